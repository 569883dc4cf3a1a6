//! In-memory cycle latency histograms, one per worker.
//! Workers record each cycle's wall time, the API reads percentiles.

use std::time::Duration;

use dashmap::DashMap;
use hdrhistogram::Histogram;
use serde::Serialize;

/// Values stored in milliseconds. Tracks 1ms to 1h, 3 significant figures.
#[derive(Default)]
pub struct CycleLatency {
    workers: DashMap<String, Histogram<u64>>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LatencySummary {
    pub worker: String,
    pub samples: u64,
    pub p50_ms: Option<u64>,
    pub p95_ms: Option<u64>,
    pub p99_ms: Option<u64>,
    pub max_ms: Option<u64>,
}

impl CycleLatency {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, worker: &str, d: Duration) {
        let ms = d.as_millis().min(u128::from(u64::MAX)) as u64;
        if !self.workers.contains_key(worker) {
            let Ok(h) = Histogram::new_with_bounds(1, 3_600_000, 3) else {
                return;
            };
            self.workers.entry(worker.to_string()).or_insert(h);
        }
        if let Some(mut h) = self.workers.get_mut(worker) {
            // Sub-millisecond cycles land in the lowest bucket.
            h.saturating_record(ms.max(1));
        }
    }

    pub fn summary(&self, worker: &str) -> LatencySummary {
        let Some(h) = self.workers.get(worker) else {
            return LatencySummary {
                worker: worker.to_string(),
                samples: 0,
                p50_ms: None,
                p95_ms: None,
                p99_ms: None,
                max_ms: None,
            };
        };
        let has = h.len() > 0;
        LatencySummary {
            worker: worker.to_string(),
            samples: h.len(),
            p50_ms: has.then(|| h.value_at_quantile(0.5)),
            p95_ms: has.then(|| h.value_at_quantile(0.95)),
            p99_ms: has.then(|| h.value_at_quantile(0.99)),
            max_ms: has.then(|| h.max()),
        }
    }

    /// Sorted by worker name.
    pub fn all(&self) -> Vec<LatencySummary> {
        let mut names: Vec<String> = self.workers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names.iter().map(|n| self.summary(n)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_worker_has_no_percentiles() {
        let latency = CycleLatency::new();
        let s = latency.summary("trigger_engine");
        assert_eq!(s.samples, 0);
        assert!(s.p50_ms.is_none());
    }

    #[test]
    fn percentiles_per_worker() {
        let latency = CycleLatency::new();
        for ms in 1..=100 {
            latency.record("trigger_engine", Duration::from_millis(ms));
        }
        latency.record("data_ingestion", Duration::from_micros(10));

        let s = latency.summary("trigger_engine");
        assert_eq!(s.samples, 100);
        assert_eq!(s.p50_ms, Some(50));
        assert_eq!(s.max_ms, Some(100));

        let names: Vec<_> = latency.all().into_iter().map(|s| s.worker).collect();
        assert_eq!(names, vec!["data_ingestion", "trigger_engine"]);
    }
}

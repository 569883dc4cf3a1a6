//! Per-service health records for the dashboard.
//! Updated by every worker action and provider call, read by the API.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::db::{PersistEvent, PersistHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Down,
    Stopped,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Down => "down",
            HealthStatus::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub service: String,
    pub status: HealthStatus,
    pub error: Option<String>,
    pub response_time_ms: Option<u64>,
    pub checked_at: DateTime<Utc>,
}

/// Shared health registry. Last write per service wins.
pub struct HealthState {
    services: DashMap<String, ServiceHealth>,
    persist: PersistHandle,
}

impl HealthState {
    pub fn new(persist: PersistHandle) -> Self {
        Self { services: DashMap::new(), persist }
    }

    pub fn record_success(&self, service: &str, elapsed: Duration) {
        self.record(service, HealthStatus::Healthy, None, Some(elapsed));
    }

    pub fn record_failure(&self, service: &str, error: impl ToString, elapsed: Duration) {
        self.record(service, HealthStatus::Down, Some(error.to_string()), Some(elapsed));
    }

    /// Ran, but with per-item errors.
    pub fn record_degraded(&self, service: &str, error: impl ToString, elapsed: Duration) {
        self.record(service, HealthStatus::Degraded, Some(error.to_string()), Some(elapsed));
    }

    pub fn record_stopped(&self, service: &str) {
        self.record(service, HealthStatus::Stopped, None, None);
    }

    fn record(
        &self,
        service: &str,
        status: HealthStatus,
        error: Option<String>,
        elapsed: Option<Duration>,
    ) {
        let health = ServiceHealth {
            service: service.to_string(),
            status,
            error,
            response_time_ms: elapsed.map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64),
            checked_at: Utc::now(),
        };
        self.services.insert(service.to_string(), health.clone());
        self.persist.send(PersistEvent::Health(health));
    }

    pub fn get(&self, service: &str) -> Option<ServiceHealth> {
        self.services.get(service).map(|h| h.clone())
    }

    /// Sorted by service name.
    pub fn all(&self) -> Vec<ServiceHealth> {
        let mut all: Vec<_> = self.services.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.service.cmp(&b.service));
        all
    }

    pub fn write_queue_pending(&self) -> u64 {
        self.persist.pending()
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new(PersistHandle::disabled())
    }
}

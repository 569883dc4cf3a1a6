use std::sync::{Arc, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::health::HealthState;
use crate::config::{service_names, worker_names};
use crate::db::{PersistEvent, PersistHandle};
use crate::error::{AppError, Result};
use crate::snapshot::SnapshotProvider;
use crate::types::Snapshot;
use crate::workers::{CycleHealth, CycleWorker};

/// Fetches the current conditions on its own interval and keeps the latest one.
pub struct DataIngestion {
    snapshots: Arc<dyn SnapshotProvider>,
    latest: RwLock<Option<Snapshot>>,
    health: Arc<HealthState>,
    persist: PersistHandle,
}

impl DataIngestion {
    pub fn new(snapshots: Arc<dyn SnapshotProvider>, health: Arc<HealthState>, persist: PersistHandle) -> Self {
        Self { snapshots, latest: RwLock::new(None), health, persist }
    }

    pub fn latest(&self) -> Option<Snapshot> {
        self.latest.read().ok().and_then(|s| s.clone())
    }
}

#[async_trait]
impl CycleWorker for DataIngestion {
    fn name(&self) -> &'static str {
        worker_names::DATA_INGESTION
    }

    async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleHealth> {
        let started = Instant::now();
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            r = self.snapshots.fetch_snapshot() => r,
        };
        let snapshot = match fetched {
            Ok(s) => s,
            Err(e) => {
                self.health.record_failure(service_names::WEATHER_API, &e, started.elapsed());
                return Err(AppError::Snapshot(e));
            }
        };
        self.health.record_success(service_names::WEATHER_API, started.elapsed());

        info!(
            temperature_c = snapshot.weather.temperature_c,
            condition = %snapshot.weather.condition,
            category = %snapshot.time.category,
            "Snapshot ingested",
        );
        self.persist.send(PersistEvent::Snapshot(snapshot.clone()));
        if let Ok(mut latest) = self.latest.write() {
            *latest = Some(snapshot);
        }
        Ok(CycleHealth::Healthy)
    }
}

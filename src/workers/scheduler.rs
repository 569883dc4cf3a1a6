use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::health::{HealthState, ServiceHealth};
use crate::api::latency::{CycleLatency, LatencySummary};
use crate::config::{worker_names, MAX_WORKER_INTERVAL_MINUTES, RESTART_PAUSE_MS};
use crate::dispatch::VoiceQueue;
use crate::error::{AppError, Result};
use crate::pipeline::{CycleReport, TriggerEngine};

/// How a finished cycle should show up on the health surface.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleHealth {
    Healthy,
    /// Completed, but some items failed.
    Degraded(String),
}

/// One unit of periodic work. Implementations must observe `cancel`.
#[async_trait]
pub trait CycleWorker: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleHealth>;
}

#[async_trait]
impl CycleWorker for TriggerEngine {
    fn name(&self) -> &'static str {
        worker_names::TRIGGER_ENGINE
    }

    async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleHealth> {
        let report = self.process_cycle(cancel).await?;
        Ok(report_health(&report))
    }
}

fn report_health(report: &CycleReport) -> CycleHealth {
    if report.errors.is_empty() {
        CycleHealth::Healthy
    } else {
        CycleHealth::Degraded(report.errors.join("; "))
    }
}

/// Worker cadences. The API speaks minutes; tests use anything.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Schedule {
    pub data_ingestion: Duration,
    pub trigger_engine: Duration,
    pub voice_poll: Duration,
}

impl Schedule {
    /// Zero is left for `validate` to reject; anything above a week is refused here.
    pub fn from_minutes(intervals: WorkerIntervals, voice_poll: Duration) -> Result<Self> {
        Ok(Self {
            data_ingestion: minutes("dataIngestionInterval", intervals.data_ingestion_interval)?,
            trigger_engine: minutes("triggerEngineInterval", intervals.trigger_engine_interval)?,
            voice_poll,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.data_ingestion.is_zero() || self.trigger_engine.is_zero() || self.voice_poll.is_zero() {
            return Err(AppError::Validation("worker intervals must be positive".to_string()));
        }
        Ok(())
    }

    fn for_worker(&self, name: &str) -> Duration {
        match name {
            worker_names::DATA_INGESTION => self.data_ingestion,
            worker_names::TRIGGER_ENGINE => self.trigger_engine,
            _ => self.voice_poll,
        }
    }
}

fn minutes(field: &str, value: u64) -> Result<Duration> {
    if value > MAX_WORKER_INTERVAL_MINUTES {
        return Err(AppError::Validation(format!(
            "{field} must be at most {MAX_WORKER_INTERVAL_MINUTES} minutes, got {value}"
        )));
    }
    value
        .checked_mul(60)
        .map(Duration::from_secs)
        .ok_or_else(|| AppError::Validation(format!("{field} is out of range")))
}

/// Control-surface body: intervals in minutes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkerIntervals {
    #[serde(alias = "dataIngestionInterval")]
    pub data_ingestion_interval: u64,
    #[serde(alias = "triggerEngineInterval")]
    pub trigger_engine_interval: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub name: &'static str,
    pub is_running: bool,
    pub in_flight: bool,
    pub interval_secs: Option<u64>,
    /// Voice worker only.
    pub queue_length: Option<usize>,
    pub health: Option<ServiceHealth>,
    pub latency: LatencySummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub workers: Vec<WorkerStatus>,
}

/// Clears the in-flight flag on drop.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
struct Lane {
    worker: Arc<dyn CycleWorker>,
    busy: Arc<AtomicBool>,
}

impl Lane {
    fn new(worker: Arc<dyn CycleWorker>) -> Self {
        Self { worker, busy: Arc::new(AtomicBool::new(false)) }
    }
}

struct Running {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    schedule: Schedule,
    started_at: DateTime<Utc>,
}

/// Runs data ingestion, the trigger engine and the voice consumer on independent timers.
///
/// Each worker is its own task. A tick that arrives while the previous cycle (or a
/// manual one) is still running is skipped. `stop()` cancels in-flight cycles
/// through a shared `CancellationToken` and waits for them to unwind.
pub struct WorkerScheduler {
    engine: Arc<TriggerEngine>,
    lanes: Vec<Lane>,
    voice_queue: Arc<VoiceQueue>,
    health: Arc<HealthState>,
    latency: Arc<CycleLatency>,
    running: Mutex<Option<Running>>,
    /// Parent of every manual cycle's token. `stop()` cancels and replaces it.
    manual_cancel: std::sync::Mutex<CancellationToken>,
    restart_pause: Duration,
}

impl WorkerScheduler {
    pub fn new(
        engine: Arc<TriggerEngine>,
        ingestion: Arc<dyn CycleWorker>,
        voice: Arc<dyn CycleWorker>,
        voice_queue: Arc<VoiceQueue>,
        health: Arc<HealthState>,
        latency: Arc<CycleLatency>,
    ) -> Self {
        let lanes = vec![
            Lane::new(ingestion),
            Lane::new(engine.clone()),
            Lane::new(voice),
        ];
        Self {
            engine,
            lanes,
            voice_queue,
            health,
            latency,
            running: Mutex::new(None),
            manual_cancel: std::sync::Mutex::new(CancellationToken::new()),
            restart_pause: Duration::from_millis(RESTART_PAUSE_MS),
        }
    }

    pub fn with_restart_pause(mut self, pause: Duration) -> Self {
        self.restart_pause = pause;
        self
    }

    fn lane(&self, name: &str) -> Option<&Lane> {
        self.lanes.iter().find(|l| l.worker.name() == name)
    }

    /// Start every worker. Each runs once immediately. Returns false if already running.
    pub async fn start(&self, schedule: Schedule) -> Result<bool> {
        schedule.validate()?;
        let mut running = self.running.lock().await;
        if running.is_some() {
            info!("Workers already running: start ignored");
            return Ok(false);
        }

        let cancel = CancellationToken::new();
        let handles: Vec<_> = self
            .lanes
            .iter()
            .map(|lane| {
                spawn_lane(
                    lane.clone(),
                    schedule.for_worker(lane.worker.name()),
                    cancel.clone(),
                    self.health.clone(),
                    self.latency.clone(),
                )
            })
            .collect();

        info!(
            data_ingestion_secs = schedule.data_ingestion.as_secs(),
            trigger_engine_secs = schedule.trigger_engine.as_secs(),
            voice_poll_secs = schedule.voice_poll.as_secs(),
            "Workers started",
        );
        *running = Some(Running { cancel, handles, schedule, started_at: Utc::now() });
        Ok(true)
    }

    /// Cancel timers and in-flight cycles, manual ones included. Returns false if
    /// the workers were not running.
    pub async fn stop(&self) -> bool {
        self.cancel_manual_cycles();
        let mut running = self.running.lock().await;
        let Some(r) = running.take() else {
            return false;
        };
        r.cancel.cancel();
        for result in join_all(r.handles).await {
            if let Err(e) = result {
                error!("Worker task join failed: {e}");
            }
        }
        for lane in &self.lanes {
            self.health.record_stopped(lane.worker.name());
        }
        info!("Workers stopped");
        true
    }

    /// Stop, pause, start. Without a new schedule the previous one is reused.
    pub async fn restart(&self, schedule: Option<Schedule>, fallback: Schedule) -> Result<()> {
        let previous = self.running.lock().await.as_ref().map(|r| r.schedule);
        let schedule = schedule.or(previous).unwrap_or(fallback);
        schedule.validate()?;

        self.stop().await;
        tokio::time::sleep(self.restart_pause).await;
        self.start(schedule).await?;
        Ok(())
    }

    fn manual_token(&self) -> CancellationToken {
        match self.manual_cancel.lock() {
            Ok(parent) => parent.child_token(),
            Err(poisoned) => poisoned.into_inner().child_token(),
        }
    }

    fn cancel_manual_cycles(&self) {
        let mut parent = match self.manual_cancel.lock() {
            Ok(parent) => parent,
            Err(poisoned) => poisoned.into_inner(),
        };
        parent.cancel();
        *parent = CancellationToken::new();
    }

    /// Run one trigger cycle now and return its report. Works whether or not the
    /// timers are running; a `stop()` issued after the call cancels it.
    pub async fn process_now(&self) -> Result<CycleReport> {
        let name = worker_names::TRIGGER_ENGINE;
        let lane = self
            .lane(name)
            .ok_or_else(|| AppError::NotFound(format!("worker {name}")))?;
        let Some(_in_flight) = InFlight::acquire(&lane.busy) else {
            return Err(AppError::CycleInProgress(name.to_string()));
        };

        let cancel = self.manual_token();
        let started = Instant::now();
        let result = self.engine.process_cycle(&cancel).await;
        let elapsed = started.elapsed();
        self.latency.record(name, elapsed);
        record_outcome(&self.health, name, result.as_ref().map(report_health), elapsed);
        result
    }

    pub async fn status(&self) -> SchedulerStatus {
        let running = self.running.lock().await;
        let workers = self
            .lanes
            .iter()
            .map(|lane| {
                let name = lane.worker.name();
                WorkerStatus {
                    name,
                    is_running: running.is_some(),
                    in_flight: lane.busy.load(Ordering::Acquire),
                    interval_secs: running.as_ref().map(|r| r.schedule.for_worker(name).as_secs()),
                    queue_length: (name == worker_names::VOICE_SYNTHESIS).then(|| self.voice_queue.len()),
                    health: self.health.get(name),
                    latency: self.latency.summary(name),
                }
            })
            .collect();
        SchedulerStatus {
            running: running.is_some(),
            started_at: running.as_ref().map(|r| r.started_at),
            workers,
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }
}

fn spawn_lane(
    lane: Lane,
    every: Duration,
    cancel: CancellationToken,
    health: Arc<HealthState>,
    latency: Arc<CycleLatency>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let name = lane.worker.name();
        // First tick fires immediately. Skip keeps a fixed rate after an overrun.
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!(worker = name, "Worker loop starting");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(_in_flight) = InFlight::acquire(&lane.busy) else {
                info!(worker = name, "Previous cycle still running: tick skipped");
                continue;
            };

            let started = Instant::now();
            let result = lane.worker.run_cycle(&cancel).await;
            let elapsed = started.elapsed();
            latency.record(name, elapsed);

            match result {
                Err(AppError::Cancelled) => break,
                other => record_outcome(&health, name, other.as_ref().cloned(), elapsed),
            }
        }
        debug!(worker = name, "Worker loop exiting");
    })
}

fn record_outcome(
    health: &HealthState,
    name: &str,
    outcome: std::result::Result<CycleHealth, &AppError>,
    elapsed: Duration,
) {
    match outcome {
        Ok(CycleHealth::Healthy) => health.record_success(name, elapsed),
        Ok(CycleHealth::Degraded(detail)) => {
            warn!(worker = name, "Cycle completed with errors: {detail}");
            health.record_degraded(name, detail, elapsed);
        }
        Err(AppError::Cancelled) => info!(worker = name, "Cycle cancelled"),
        Err(e) => {
            error!(worker = name, "Cycle failed: {e}");
            health.record_failure(name, e, elapsed);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::api::health::HealthStatus;
    use crate::db::PersistHandle;
    use crate::dispatch::TemplateScriptGenerator;
    use crate::ledger::ContractLedger;
    use crate::error::ProviderError;
    use crate::snapshot::{SnapshotProvider, StaticSnapshotProvider};
    use crate::state::MemoryRepository;
    use crate::types::Snapshot;

    /// Counts cycles; optionally blocks until cancelled.
    struct StubWorker {
        name: &'static str,
        cycles: AtomicUsize,
        block: bool,
    }

    impl StubWorker {
        fn new(name: &'static str, block: bool) -> Arc<Self> {
            Arc::new(Self { name, cycles: AtomicUsize::new(0), block })
        }

        fn cycles(&self) -> usize {
            self.cycles.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CycleWorker for StubWorker {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleHealth> {
            self.cycles.fetch_add(1, Ordering::SeqCst);
            if self.block {
                cancel.cancelled().await;
                return Err(AppError::Cancelled);
            }
            Ok(CycleHealth::Healthy)
        }
    }

    /// Never answers; only cancellation ends a fetch.
    struct StalledSnapshots;

    #[async_trait]
    impl SnapshotProvider for StalledSnapshots {
        async fn fetch_snapshot(&self) -> std::result::Result<Snapshot, ProviderError> {
            std::future::pending().await
        }
    }

    fn engine(health: Arc<HealthState>, queue: Arc<VoiceQueue>) -> Arc<TriggerEngine> {
        engine_with(health, queue, Arc::new(StaticSnapshotProvider::fair_weather()))
    }

    fn engine_with(
        health: Arc<HealthState>,
        queue: Arc<VoiceQueue>,
        snapshots: Arc<dyn SnapshotProvider>,
    ) -> Arc<TriggerEngine> {
        Arc::new(TriggerEngine::new(
            MemoryRepository::new(),
            Arc::new(ContractLedger::new()),
            snapshots,
            Arc::new(TemplateScriptGenerator),
            queue,
            health,
            PersistHandle::disabled(),
            Duration::from_secs(1),
        ))
    }

    fn scheduler(ingestion: Arc<StubWorker>, voice: Arc<StubWorker>) -> (WorkerScheduler, Arc<HealthState>) {
        let health = Arc::new(HealthState::default());
        let queue = Arc::new(VoiceQueue::new());
        let scheduler = WorkerScheduler::new(
            engine(health.clone(), queue.clone()),
            ingestion,
            voice,
            queue,
            health.clone(),
            Arc::new(CycleLatency::new()),
        )
        .with_restart_pause(Duration::from_millis(10));
        (scheduler, health)
    }

    fn hourly() -> Schedule {
        Schedule {
            data_ingestion: Duration::from_secs(3600),
            trigger_engine: Duration::from_secs(3600),
            voice_poll: Duration::from_secs(3600),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn second_start_is_a_no_op() {
        let ingestion = StubWorker::new(worker_names::DATA_INGESTION, false);
        let (scheduler, _) = scheduler(ingestion.clone(), StubWorker::new(worker_names::VOICE_SYNTHESIS, false));

        assert!(scheduler.start(hourly()).await.unwrap());
        settle().await;
        assert!(!scheduler.start(hourly()).await.unwrap());
        settle().await;

        // Ran once immediately, and the ignored start did not run it again.
        assert_eq!(ingestion.cycles(), 1);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn stop_then_start_runs_immediately_again() {
        let ingestion = StubWorker::new(worker_names::DATA_INGESTION, false);
        let (scheduler, health) = scheduler(ingestion.clone(), StubWorker::new(worker_names::VOICE_SYNTHESIS, false));

        scheduler.start(hourly()).await.unwrap();
        settle().await;
        assert!(scheduler.stop().await);
        assert!(!scheduler.is_running().await);
        assert_eq!(
            health.get(worker_names::DATA_INGESTION).unwrap().status,
            HealthStatus::Stopped
        );

        scheduler.start(hourly()).await.unwrap();
        settle().await;
        assert_eq!(ingestion.cycles(), 2);
        assert_eq!(
            health.get(worker_names::DATA_INGESTION).unwrap().status,
            HealthStatus::Healthy
        );
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn ticks_keep_firing_at_the_interval() {
        let ingestion = StubWorker::new(worker_names::DATA_INGESTION, false);
        let (scheduler, _) = scheduler(ingestion.clone(), StubWorker::new(worker_names::VOICE_SYNTHESIS, false));

        let schedule = Schedule { data_ingestion: Duration::from_millis(40), ..hourly() };
        scheduler.start(schedule).await.unwrap();
        tokio::time::sleep(Duration::from_millis(190)).await;
        scheduler.stop().await;

        assert!(ingestion.cycles() >= 3, "only {} cycles", ingestion.cycles());
    }

    #[tokio::test]
    async fn stop_cancels_in_flight_cycles() {
        let voice = StubWorker::new(worker_names::VOICE_SYNTHESIS, true);
        let (scheduler, _) = scheduler(StubWorker::new(worker_names::DATA_INGESTION, false), voice.clone());

        scheduler.start(hourly()).await.unwrap();
        settle().await;
        assert!(scheduler.status().await.workers[2].in_flight);

        tokio::time::timeout(Duration::from_secs(2), scheduler.stop())
            .await
            .expect("stop waits only for cancellation");
        assert_eq!(voice.cycles(), 1);
        assert!(!scheduler.status().await.workers[2].in_flight);
    }

    #[tokio::test]
    async fn manual_cycle_refuses_to_overlap() {
        let (scheduler, _) = scheduler(
            StubWorker::new(worker_names::DATA_INGESTION, false),
            StubWorker::new(worker_names::VOICE_SYNTHESIS, false),
        );

        let lane = scheduler.lane(worker_names::TRIGGER_ENGINE).unwrap().clone();
        let held = InFlight::acquire(&lane.busy).unwrap();
        assert!(matches!(scheduler.process_now().await, Err(AppError::CycleInProgress(_))));

        drop(held);
        let report = scheduler.process_now().await.unwrap();
        assert_eq!(report.accepted_count(), 0);
    }

    #[tokio::test]
    async fn restart_reuses_previous_schedule() {
        let ingestion = StubWorker::new(worker_names::DATA_INGESTION, false);
        let (scheduler, _) = scheduler(ingestion.clone(), StubWorker::new(worker_names::VOICE_SYNTHESIS, false));

        let custom = Schedule { trigger_engine: Duration::from_secs(120), ..hourly() };
        scheduler.start(custom).await.unwrap();
        settle().await;
        scheduler.restart(None, hourly()).await.unwrap();
        settle().await;

        let status = scheduler.status().await;
        assert!(status.running);
        assert_eq!(status.workers[1].interval_secs, Some(120));
        assert_eq!(ingestion.cycles(), 2);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn zero_interval_is_rejected() {
        let (scheduler, _) = scheduler(
            StubWorker::new(worker_names::DATA_INGESTION, false),
            StubWorker::new(worker_names::VOICE_SYNTHESIS, false),
        );
        let schedule = Schedule { trigger_engine: Duration::ZERO, ..hourly() };
        assert!(matches!(scheduler.start(schedule).await, Err(AppError::Validation(_))));
        assert!(!scheduler.is_running().await);
    }

    #[test]
    fn intervals_accept_camel_case() {
        let i: WorkerIntervals =
            serde_json::from_str(r#"{"dataIngestionInterval":15,"triggerEngineInterval":5}"#).unwrap();
        let s = Schedule::from_minutes(i, Duration::from_secs(5)).unwrap();
        assert_eq!(s.data_ingestion, Duration::from_secs(900));
        assert_eq!(s.trigger_engine, Duration::from_secs(300));
    }

    #[test]
    fn huge_minute_counts_are_a_validation_error() {
        let poll = Duration::from_secs(5);
        let overflow = WorkerIntervals { data_ingestion_interval: u64::MAX, trigger_engine_interval: 5 };
        assert!(matches!(Schedule::from_minutes(overflow, poll), Err(AppError::Validation(_))));

        let too_long = WorkerIntervals {
            data_ingestion_interval: 15,
            trigger_engine_interval: MAX_WORKER_INTERVAL_MINUTES + 1,
        };
        assert!(matches!(Schedule::from_minutes(too_long, poll), Err(AppError::Validation(_))));

        let longest = WorkerIntervals {
            data_ingestion_interval: MAX_WORKER_INTERVAL_MINUTES,
            trigger_engine_interval: 5,
        };
        let s = Schedule::from_minutes(longest, poll).unwrap();
        assert_eq!(s.data_ingestion, Duration::from_secs(7 * 24 * 3600));
    }

    #[tokio::test]
    async fn stop_cancels_a_manual_cycle() {
        let health = Arc::new(HealthState::default());
        let queue = Arc::new(VoiceQueue::new());
        let scheduler = Arc::new(WorkerScheduler::new(
            engine_with(health.clone(), queue.clone(), Arc::new(StalledSnapshots)),
            StubWorker::new(worker_names::DATA_INGESTION, false),
            StubWorker::new(worker_names::VOICE_SYNTHESIS, false),
            queue,
            health,
            Arc::new(CycleLatency::new()),
        ));

        // Workers never started: the manual cycle still answers to stop().
        let manual = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.process_now().await }
        });
        settle().await;
        assert!(!scheduler.stop().await);

        let result = tokio::time::timeout(Duration::from_secs(2), manual)
            .await
            .expect("manual cycle unwinds on stop")
            .unwrap();
        assert!(matches!(result, Err(AppError::Cancelled)));

        // Later manual cycles get a fresh token.
        let lane = scheduler.lane(worker_names::TRIGGER_ENGINE).unwrap().clone();
        assert!(!lane.busy.load(Ordering::Acquire));
        assert!(!scheduler.manual_token().is_cancelled());
    }
}

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::api::health::{HealthState, ServiceHealth};
use crate::api::latency::{CycleLatency, LatencySummary};
use crate::db::models::{SnapshotRow, TriggerRow};
use crate::db::{PersistEvent, PersistHandle};
use crate::error::AppError;
use crate::ledger::{BillingCalculator, ContractLedger};
use crate::pipeline::CycleReport;
use crate::state::Repository;
use crate::types::{
    AdTrigger, AdvertiserContract, BillingRecord, PayoutRecord, Snapshot, TriggerStatus,
    VenueContract,
};
use crate::workers::{DataIngestion, Schedule, SchedulerStatus, WorkerIntervals, WorkerScheduler};

/// Everything the handlers need, built once in `main` and shared by reference.
#[derive(Clone)]
pub struct AppContext {
    pub pool: sqlx::SqlitePool,
    pub repo: Arc<dyn Repository>,
    pub ledger: Arc<ContractLedger>,
    pub billing: Arc<BillingCalculator>,
    pub scheduler: Arc<WorkerScheduler>,
    pub ingestion: Arc<DataIngestion>,
    pub health: Arc<HealthState>,
    pub latency: Arc<CycleLatency>,
    pub persist: PersistHandle,
    /// Used when a start/restart request carries no intervals.
    pub default_schedule: Schedule,
    pub voice_poll: Duration,
}

impl AppContext {
    fn schedule_from(&self, intervals: Option<WorkerIntervals>) -> Result<Schedule, AppError> {
        match intervals {
            Some(i) => Schedule::from_minutes(i, self.voice_poll),
            None => Ok(self.default_schedule),
        }
    }
}

pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/workers/status", get(get_worker_status))
        .route("/workers/start", post(start_workers))
        .route("/workers/stop", post(stop_workers))
        .route("/workers/restart", post(restart_workers))
        .route("/workers/process", post(process_now))
        .route("/snapshot/latest", get(get_latest_snapshot))
        .route("/snapshots/recent", get(get_recent_snapshots))
        .route("/triggers/recent", get(get_recent_triggers))
        .route("/triggers/:id/status", put(update_trigger_status))
        .route("/contracts", get(get_contracts))
        .route("/billing/advertisers/:contract_id/:period", post(bill_advertiser))
        .route("/billing/venues/:contract_id/:period", post(pay_venue))
        .route("/stats/latency", get(get_stats_latency))
        .with_state(ctx)
}

// ---------------------------------------------------------------------------
// Query param structs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
    pub advertiser_id: Option<String>,
}

#[derive(Deserialize)]
pub struct TriggerStatusBody {
    pub status: TriggerStatus,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub workers_running: bool,
    pub write_queue_pending: u64,
    pub services: Vec<ServiceHealth>,
}

#[derive(Serialize)]
pub struct ControlResponse {
    pub changed: bool,
    pub status: SchedulerStatus,
}

#[derive(Serialize)]
pub struct ContractsResponse {
    pub advertisers: Vec<AdvertiserContract>,
    pub venues: Vec<VenueContract>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_health(State(ctx): State<AppContext>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        workers_running: ctx.scheduler.is_running().await,
        write_queue_pending: ctx.health.write_queue_pending(),
        services: ctx.health.all(),
    })
}

async fn get_worker_status(State(ctx): State<AppContext>) -> Json<SchedulerStatus> {
    Json(ctx.scheduler.status().await)
}

async fn start_workers(
    State(ctx): State<AppContext>,
    body: Option<Json<WorkerIntervals>>,
) -> Result<Json<ControlResponse>, AppError> {
    let schedule = ctx.schedule_from(body.map(|Json(i)| i))?;
    let changed = ctx.scheduler.start(schedule).await?;
    Ok(Json(ControlResponse { changed, status: ctx.scheduler.status().await }))
}

async fn stop_workers(State(ctx): State<AppContext>) -> Json<ControlResponse> {
    let changed = ctx.scheduler.stop().await;
    Json(ControlResponse { changed, status: ctx.scheduler.status().await })
}

async fn restart_workers(
    State(ctx): State<AppContext>,
    body: Option<Json<WorkerIntervals>>,
) -> Result<Json<ControlResponse>, AppError> {
    let requested = body
        .map(|Json(i)| Schedule::from_minutes(i, ctx.voice_poll))
        .transpose()?;
    ctx.scheduler.restart(requested, ctx.default_schedule).await?;
    Ok(Json(ControlResponse { changed: true, status: ctx.scheduler.status().await }))
}

async fn process_now(State(ctx): State<AppContext>) -> Result<Json<CycleReport>, AppError> {
    Ok(Json(ctx.scheduler.process_now().await?))
}

async fn get_latest_snapshot(State(ctx): State<AppContext>) -> Result<Json<Snapshot>, AppError> {
    ctx.ingestion
        .latest()
        .map(Json)
        .ok_or_else(|| AppError::NotFound("no snapshot ingested yet".to_string()))
}

async fn get_recent_snapshots(
    State(ctx): State<AppContext>,
    Query(params): Query<LimitQuery>,
) -> Result<Json<Vec<SnapshotRow>>, AppError> {
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    let rows = sqlx::query_as::<_, SnapshotRow>(
        r#"
        SELECT id, fetched_at, temperature_c, humidity, condition, uv_index, aqi,
               traffic_kind, time_category
        FROM weather_snapshots
        ORDER BY fetched_at DESC
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(&ctx.pool)
    .await?;
    Ok(Json(rows))
}

async fn get_recent_triggers(
    State(ctx): State<AppContext>,
    Query(params): Query<LimitQuery>,
) -> Result<Json<Vec<TriggerRow>>, AppError> {
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    let rows = sqlx::query_as::<_, TriggerRow>(
        r#"
        SELECT id, advertiser_id, rule_id, location_id, script_ref, voice_ref,
               voice_status, audio_ref, cost, status, triggered_at, period
        FROM ad_triggers
        WHERE ? IS NULL OR advertiser_id = ?
        ORDER BY triggered_at DESC
        LIMIT ?
        "#,
    )
    .bind(&params.advertiser_id)
    .bind(&params.advertiser_id)
    .bind(limit)
    .fetch_all(&ctx.pool)
    .await?;
    Ok(Json(rows))
}

/// Playback outcome reported by the venue player: pending → played | failed.
async fn update_trigger_status(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    Json(body): Json<TriggerStatusBody>,
) -> Result<Json<AdTrigger>, AppError> {
    if body.status == TriggerStatus::Pending {
        return Err(AppError::Validation("status must be played or failed".to_string()));
    }
    let trigger = ctx.repo.update_trigger_status(&id, body.status).await?;
    ctx.persist.send(PersistEvent::TriggerStatus { trigger_id: trigger.id.clone(), status: trigger.status });
    Ok(Json(trigger))
}

async fn get_contracts(State(ctx): State<AppContext>) -> Json<ContractsResponse> {
    Json(ContractsResponse {
        advertisers: ctx.ledger.list_advertiser_contracts(),
        venues: ctx.ledger.list_venue_contracts(),
    })
}

async fn bill_advertiser(
    State(ctx): State<AppContext>,
    Path((contract_id, period)): Path<(String, String)>,
) -> Result<Json<BillingRecord>, AppError> {
    Ok(Json(ctx.billing.calculate_advertiser_monthly_bill(&contract_id, &period).await?))
}

async fn pay_venue(
    State(ctx): State<AppContext>,
    Path((contract_id, period)): Path<(String, String)>,
) -> Result<Json<PayoutRecord>, AppError> {
    Ok(Json(ctx.billing.calculate_venue_monthly_payout(&contract_id, &period).await?))
}

async fn get_stats_latency(State(ctx): State<AppContext>) -> Json<Vec<LatencySummary>> {
    Json(ctx.latency.all())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

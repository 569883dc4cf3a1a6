mod api;
mod config;
mod db;
mod dispatch;
mod error;
mod ledger;
mod pipeline;
mod rules;
mod snapshot;
mod state;
mod types;
mod workers;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::health::HealthState;
use crate::api::latency::CycleLatency;
use crate::api::{router, AppContext};
use crate::config::{Config, CHANNEL_CAPACITY, SHUTDOWN_FLUSH};
use crate::db::{restore_state, DbWriter, PersistHandle};
use crate::dispatch::{
    HttpScriptGenerator, HttpVoiceSynthesizer, LocalVoiceSynthesizer, ScriptGenerator,
    TemplateScriptGenerator, VoiceQueue, VoiceSynthesizer,
};
use crate::error::Result;
use crate::ledger::{BillingCalculator, ContractLedger};
use crate::pipeline::TriggerEngine;
use crate::snapshot::time_context::billing_period;
use crate::snapshot::{HttpSnapshotProvider, SnapshotProvider, StaticSnapshotProvider};
use crate::state::{Catalog, MemoryRepository, Repository};
use crate::workers::{DataIngestion, Schedule, VoiceWorker, WorkerIntervals, WorkerScheduler};

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Database setup ---
    let pool = sqlx::SqlitePool::connect(&format!("sqlite:{}?mode=rwc", cfg.db_path)).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database ready at {}", cfg.db_path);

    let (persist_tx, persist_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let persist = PersistHandle::new(persist_tx);
    let writer = DbWriter::new(pool.clone(), persist_rx, persist.clone());
    tokio::spawn(async move { writer.run().await });

    // --- In-memory state ---
    let repo: Arc<dyn Repository> = MemoryRepository::new();
    let ledger = Arc::new(ContractLedger::new());
    match &cfg.catalog_path {
        Some(path) => Catalog::load(path).await?.install(repo.as_ref(), &ledger).await?,
        None => warn!("CATALOG_PATH not set: starting with no advertisers, rules or contracts"),
    }
    // Counters and invoices from earlier runs win over the catalog's starting values.
    restore_state(&pool, repo.as_ref(), &ledger, &billing_period(chrono::Utc::now())).await?;

    // --- Providers ---
    let snapshots: Arc<dyn SnapshotProvider> = match &cfg.weather_api_url {
        Some(url) => Arc::new(HttpSnapshotProvider::new(url.clone(), cfg.provider_timeout())?),
        None => {
            info!("WEATHER_API_URL not set: using static fair-weather snapshots");
            Arc::new(StaticSnapshotProvider::fair_weather())
        }
    };
    let scripts: Arc<dyn ScriptGenerator> = match &cfg.script_api_url {
        Some(url) => Arc::new(HttpScriptGenerator::new(url.clone(), cfg.provider_timeout())?),
        None => Arc::new(TemplateScriptGenerator),
    };
    let synthesizer: Arc<dyn VoiceSynthesizer> = match &cfg.voice_api_url {
        Some(url) => Arc::new(HttpVoiceSynthesizer::new(url.clone(), cfg.provider_timeout())?),
        None => Arc::new(LocalVoiceSynthesizer),
    };

    // --- Workers ---
    let health = Arc::new(HealthState::new(persist.clone()));
    let latency = Arc::new(CycleLatency::new());
    let voice_queue = Arc::new(VoiceQueue::new());

    let engine = Arc::new(TriggerEngine::new(
        repo.clone(),
        ledger.clone(),
        snapshots.clone(),
        scripts,
        voice_queue.clone(),
        health.clone(),
        persist.clone(),
        cfg.provider_timeout(),
    ));
    let ingestion = Arc::new(DataIngestion::new(snapshots, health.clone(), persist.clone()));
    let voice_worker = Arc::new(VoiceWorker::new(
        voice_queue.clone(),
        synthesizer,
        repo.clone(),
        health.clone(),
        persist.clone(),
    ));
    let scheduler = Arc::new(WorkerScheduler::new(
        engine,
        ingestion.clone(),
        voice_worker,
        voice_queue,
        health.clone(),
        latency.clone(),
    ));

    let default_schedule = Schedule::from_minutes(
        WorkerIntervals {
            data_ingestion_interval: cfg.data_ingestion_interval_minutes,
            trigger_engine_interval: cfg.trigger_engine_interval_minutes,
        },
        cfg.voice_poll_interval(),
    )?;
    if cfg.autostart_workers {
        scheduler.start(default_schedule).await?;
    } else {
        info!("AUTOSTART_WORKERS disabled: start workers with POST /workers/start");
    }

    // --- HTTP API server ---
    let ctx = AppContext {
        pool,
        billing: Arc::new(BillingCalculator::new(repo.clone(), ledger.clone(), persist.clone())),
        repo,
        ledger,
        scheduler: scheduler.clone(),
        ingestion,
        health,
        latency,
        persist: persist.clone(),
        default_schedule,
        voice_poll: cfg.voice_poll_interval(),
    };
    let persist_for_shutdown = persist;
    let app = router(ctx);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("Shutting down: stopping workers");
    scheduler.stop().await;
    if !persist_for_shutdown.drained(SHUTDOWN_FLUSH).await {
        warn!(pending = persist_for_shutdown.pending(), "DB writer still behind at shutdown");
    }
    Ok(())
}

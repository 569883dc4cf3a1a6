use std::time::Duration;

use crate::error::{AppError, Result};

/// Only the top-K matches of a cycle are turned into triggers.
pub const MAX_MATCHES_PER_CYCLE: usize = 3;

/// Unit cost charged when a contract carries a billing type we don't recognize.
pub const DEFAULT_UNIT_COST: f64 = 5.0;

/// Channel capacity for internal message routing.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Pause between stop and start during a worker restart (milliseconds).
pub const RESTART_PAUSE_MS: u64 = 1000;

/// Upper bound for a worker interval set through the control surface (one week).
pub const MAX_WORKER_INTERVAL_MINUTES: u64 = 7 * 24 * 60;

/// How long shutdown waits for the DB writer to catch up.
pub const SHUTDOWN_FLUSH: Duration = Duration::from_secs(5);

/// Time context is always derived in Asia/Singapore (UTC+8, no DST).
pub const SINGAPORE_UTC_OFFSET_SECS: i32 = 8 * 3600;

/// Voice used when a generated script doesn't request one.
pub const DEFAULT_VOICE_TYPE: &str = "female_warm";

/// Venue created when a trigger has nowhere to play.
pub const DEFAULT_LOCATION_NAME: &str = "Default Location";

/// Worker names as reported on the health surface.
pub mod worker_names {
    pub const DATA_INGESTION: &str = "data_ingestion";
    pub const TRIGGER_ENGINE: &str = "trigger_engine";
    pub const VOICE_SYNTHESIS: &str = "voice_synthesis";
}

/// Service names for non-worker health records.
pub mod service_names {
    pub const WEATHER_API: &str = "weather_api";
    pub const SCRIPT_API: &str = "script_api";
    pub const VOICE_API: &str = "voice_api";
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    /// JSON catalog of advertisers, rules, contracts and locations (CATALOG_PATH)
    pub catalog_path: Option<String>,
    /// Weather/traffic snapshot endpoint; static snapshots when unset (WEATHER_API_URL)
    pub weather_api_url: Option<String>,
    /// Script generation endpoint; template scripts when unset (SCRIPT_API_URL)
    pub script_api_url: Option<String>,
    /// Voice synthesis endpoint; local audio refs when unset (VOICE_API_URL)
    pub voice_api_url: Option<String>,
    pub provider_timeout_secs: u64,
    pub data_ingestion_interval_minutes: u64,
    pub trigger_engine_interval_minutes: u64,
    pub voice_poll_interval_secs: u64,
    /// Start workers on boot (AUTOSTART_WORKERS)
    pub autostart_workers: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "adtrigger.db".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            catalog_path: optional_var("CATALOG_PATH"),
            weather_api_url: optional_var("WEATHER_API_URL"),
            script_api_url: optional_var("SCRIPT_API_URL"),
            voice_api_url: optional_var("VOICE_API_URL"),
            provider_timeout_secs: std::env::var("PROVIDER_TIMEOUT_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse::<u64>()
                .unwrap_or(10),
            data_ingestion_interval_minutes: std::env::var("DATA_INGESTION_INTERVAL_MINUTES")
                .unwrap_or_else(|_| "15".to_string())
                .parse::<u64>()
                .unwrap_or(15),
            trigger_engine_interval_minutes: std::env::var("TRIGGER_ENGINE_INTERVAL_MINUTES")
                .unwrap_or_else(|_| "5".to_string())
                .parse::<u64>()
                .unwrap_or(5),
            voice_poll_interval_secs: std::env::var("VOICE_POLL_INTERVAL_SECS")
                .unwrap_or_else(|_| "5".to_string())
                .parse::<u64>()
                .unwrap_or(5),
            autostart_workers: std::env::var("AUTOSTART_WORKERS")
                .map(|v| !matches!(v.trim(), "0" | "false" | "no"))
                .unwrap_or(true),
        })
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn voice_poll_interval(&self) -> Duration {
        Duration::from_secs(self.voice_poll_interval_secs.max(1))
    }
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::error::{ProviderError, Result};
use crate::snapshot::time_context::derive_time_context;
use crate::types::{Snapshot, TrafficIncident, WeatherReading};

/// Source of the per-cycle weather/time/traffic bundle.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn fetch_snapshot(&self) -> std::result::Result<Snapshot, ProviderError>;
}

/// Body returned by the weather service.
#[derive(Debug, Deserialize)]
struct SnapshotPayload {
    weather: WeatherReading,
    #[serde(default)]
    traffic: Option<TrafficIncident>,
}

/// Fetches the current conditions from an HTTP endpoint returning
/// `{"weather": {...}, "traffic": {...}|null}`.
pub struct HttpSnapshotProvider {
    client: reqwest::Client,
    url: String,
}

impl HttpSnapshotProvider {
    pub fn new(url: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl SnapshotProvider for HttpSnapshotProvider {
    async fn fetch_snapshot(&self) -> std::result::Result<Snapshot, ProviderError> {
        let resp = self.client.get(&self.url).send().await?;
        if !resp.status().is_success() {
            return Err(ProviderError::Request(format!(
                "weather API returned {}",
                resp.status()
            )));
        }
        let payload: SnapshotPayload = resp.json().await?;
        let now = Utc::now();
        debug!(
            temperature_c = payload.weather.temperature_c,
            condition = %payload.weather.condition,
            "Fetched weather snapshot",
        );
        Ok(Snapshot {
            fetched_at: now,
            time: derive_time_context(now),
            weather: payload.weather,
            traffic: payload.traffic,
        })
    }
}

/// Serves a fixed reading. Used when no weather endpoint is configured, and in tests.
pub struct StaticSnapshotProvider {
    state: Mutex<StaticState>,
}

struct StaticState {
    weather: WeatherReading,
    traffic: Option<TrafficIncident>,
    /// Pinned clock; `None` uses the wall clock.
    at: Option<DateTime<Utc>>,
}

impl StaticSnapshotProvider {
    pub fn new(weather: WeatherReading) -> Self {
        Self {
            state: Mutex::new(StaticState { weather, traffic: None, at: None }),
        }
    }

    /// Mild, dry afternoon reading.
    pub fn fair_weather() -> Self {
        Self::new(WeatherReading {
            temperature_c: 30.0,
            humidity_percent: 70.0,
            condition: "partly cloudy".to_string(),
            uv_index: 6.0,
            aqi: Some(50),
        })
    }

    pub fn at(self, at: DateTime<Utc>) -> Self {
        if let Ok(mut s) = self.state.lock() {
            s.at = Some(at);
        }
        self
    }

    pub fn set_weather(&self, weather: WeatherReading) {
        if let Ok(mut s) = self.state.lock() {
            s.weather = weather;
        }
    }

    pub fn set_traffic(&self, traffic: Option<TrafficIncident>) {
        if let Ok(mut s) = self.state.lock() {
            s.traffic = traffic;
        }
    }
}

#[async_trait]
impl SnapshotProvider for StaticSnapshotProvider {
    async fn fetch_snapshot(&self) -> std::result::Result<Snapshot, ProviderError> {
        let s = self
            .state
            .lock()
            .map_err(|_| ProviderError::Request("static snapshot state poisoned".to_string()))?;
        let now = s.at.unwrap_or_else(Utc::now);
        Ok(Snapshot {
            fetched_at: now,
            time: derive_time_context(now),
            weather: s.weather.clone(),
            traffic: s.traffic.clone(),
        })
    }
}

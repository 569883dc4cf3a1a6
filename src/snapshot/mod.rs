pub mod provider;
pub mod time_context;

pub use provider::{HttpSnapshotProvider, SnapshotProvider, StaticSnapshotProvider};
pub use time_context::derive_time_context;

/// Snapshot at `hh:mm` Singapore time on Wednesday 2024-06-05.
#[cfg(test)]
pub fn test_snapshot(temperature_c: f64, condition: &str, hour: u32, minute: u32) -> crate::types::Snapshot {
    use chrono::{Duration, TimeZone, Utc};

    let local_midnight_utc = Utc.with_ymd_and_hms(2024, 6, 4, 16, 0, 0).unwrap();
    let at = local_midnight_utc + Duration::minutes(i64::from(hour * 60 + minute));
    crate::types::Snapshot {
        fetched_at: at,
        time: derive_time_context(at),
        weather: crate::types::WeatherReading {
            temperature_c,
            humidity_percent: 75.0,
            condition: condition.to_string(),
            uv_index: 5.0,
            aqi: None,
        },
        traffic: None,
    }
}

use chrono::{DateTime, Datelike, FixedOffset, Offset, Timelike, Utc, Weekday};

use crate::config::SINGAPORE_UTC_OFFSET_SECS;
use crate::types::{TimeCategory, TimeContext};

fn singapore() -> FixedOffset {
    FixedOffset::east_opt(SINGAPORE_UTC_OFFSET_SECS).unwrap_or_else(|| Utc.fix())
}

/// Derive local time facts for `at` in Asia/Singapore.
///
/// - business hours: weekdays 09:00–17:59
/// - peak hours: 07–09h, 12–13h, 17–19h
/// - category: 05–11 morning, 12–16 afternoon, 17–20 evening, otherwise night
pub fn derive_time_context(at: DateTime<Utc>) -> TimeContext {
    let local = at.with_timezone(&singapore());
    let hour = local.hour();
    let day_of_week = local.weekday();
    let is_weekend = matches!(day_of_week, Weekday::Sat | Weekday::Sun);

    TimeContext {
        hour,
        minute: local.minute(),
        day_of_week,
        is_weekend,
        is_business_hours: !is_weekend && (9..18).contains(&hour),
        is_peak_hours: matches!(hour, 7..=9 | 12..=13 | 17..=19),
        category: time_category(hour),
        period: billing_period(at),
    }
}

/// Billing period ("YYYY-MM", Singapore calendar) containing `at`.
pub fn billing_period(at: DateTime<Utc>) -> String {
    at.with_timezone(&singapore()).format("%Y-%m").to_string()
}

fn time_category(hour: u32) -> TimeCategory {
    match hour {
        5..=11 => TimeCategory::Morning,
        12..=16 => TimeCategory::Afternoon,
        17..=20 => TimeCategory::Evening,
        _ => TimeCategory::Night,
    }
}

/// Accepts "YYYY-MM" with a real month.
pub fn is_valid_period(period: &str) -> bool {
    let Some((y, m)) = period.split_once('-') else {
        return false;
    };
    y.len() == 4
        && m.len() == 2
        && y.parse::<u32>().is_ok()
        && m.parse::<u32>().is_ok_and(|m| (1..=12).contains(&m))
}

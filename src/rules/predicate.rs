use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::types::{FootTraffic, Location, Snapshot, TimeCategory};

/// A single typed condition. A rule's predicates form a conjunction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Predicate {
    /// Strictly greater than.
    #[serde(alias = "temperature_c_greater_than")]
    TemperatureAbove { value: f64 },
    /// Strictly less than.
    #[serde(alias = "temperature_c_less_than")]
    TemperatureBelow { value: f64 },
    /// Inclusive on both ends.
    TemperatureBetween { min: f64, max: f64 },
    #[serde(alias = "humidity_greater_than")]
    HumidityAbove { value: f64 },
    /// Case-insensitive: any candidate is a substring of the weather condition.
    WeatherContains { any: Vec<String> },
    /// Case-insensitive: no candidate is a substring of the weather condition.
    WeatherNotContains { any: Vec<String> },
    UvIndexAbove { value: f64 },
    AqiAbove { value: u32 },
    /// "HH:MM" bounds, inclusive. `start > end` wraps past midnight.
    TimeOfDayBetween { start: String, end: String },
    IsWeekend { value: bool },
    IsBusinessHours { value: bool },
    IsPeakHours { value: bool },
    TimeCategoryIn { any: Vec<TimeCategory> },
    LocationType { any: Vec<String> },
    FootTrafficAtLeast { level: FootTraffic },
    TrafficIncident { present: bool },
}

/// What a predicate is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub snapshot: &'a Snapshot,
    /// Venue the cycle would play at, if one is known.
    pub location: Option<&'a Location>,
}

/// A predicate that held, with the concrete values it looked at.
#[derive(Debug, Clone, PartialEq)]
pub struct Satisfied {
    pub description: String,
    pub captures: Vec<(&'static str, Value)>,
}

impl Satisfied {
    fn new(description: String, captures: Vec<(&'static str, Value)>) -> Self {
        Self { description, captures }
    }
}

impl Predicate {
    /// Structural checks that don't depend on the snapshot.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Predicate::TemperatureBetween { min, max } if min > max => {
                Err(format!("temperature range {min}..{max} is inverted"))
            }
            Predicate::TimeOfDayBetween { start, end } => {
                parse_hhmm(start).ok_or_else(|| format!("invalid start time {start:?}"))?;
                parse_hhmm(end).ok_or_else(|| format!("invalid end time {end:?}"))?;
                Ok(())
            }
            Predicate::WeatherContains { any }
            | Predicate::WeatherNotContains { any }
            | Predicate::LocationType { any }
                if any.is_empty() =>
            {
                Err("candidate list is empty".to_string())
            }
            Predicate::TimeCategoryIn { any } if any.is_empty() => {
                Err("candidate list is empty".to_string())
            }
            _ => Ok(()),
        }
    }

    /// Returns `Some` iff the predicate holds. Data the context lacks never satisfies.
    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> Option<Satisfied> {
        let weather = &ctx.snapshot.weather;
        let time = &ctx.snapshot.time;

        match self {
            Predicate::TemperatureAbove { value } => (weather.temperature_c > *value).then(|| {
                Satisfied::new(
                    format!("temperature {:.1}°C > {value}°C", weather.temperature_c),
                    vec![("temperature_c", json!(weather.temperature_c))],
                )
            }),
            Predicate::TemperatureBelow { value } => (weather.temperature_c < *value).then(|| {
                Satisfied::new(
                    format!("temperature {:.1}°C < {value}°C", weather.temperature_c),
                    vec![("temperature_c", json!(weather.temperature_c))],
                )
            }),
            Predicate::TemperatureBetween { min, max } => {
                (weather.temperature_c >= *min && weather.temperature_c <= *max).then(|| {
                    Satisfied::new(
                        format!("temperature {:.1}°C in {min}..={max}°C", weather.temperature_c),
                        vec![("temperature_c", json!(weather.temperature_c))],
                    )
                })
            }
            Predicate::HumidityAbove { value } => (weather.humidity_percent > *value).then(|| {
                Satisfied::new(
                    format!("humidity {:.0}% > {value}%", weather.humidity_percent),
                    vec![("humidity_percent", json!(weather.humidity_percent))],
                )
            }),
            Predicate::WeatherContains { any } => {
                let condition = weather.condition.to_lowercase();
                any.iter()
                    .find(|c| condition.contains(&c.to_lowercase()))
                    .map(|hit| {
                        Satisfied::new(
                            format!("weather \"{}\" contains \"{hit}\"", weather.condition),
                            vec![("condition", json!(weather.condition))],
                        )
                    })
            }
            Predicate::WeatherNotContains { any } => {
                let condition = weather.condition.to_lowercase();
                (!any.iter().any(|c| condition.contains(&c.to_lowercase()))).then(|| {
                    Satisfied::new(
                        format!("weather \"{}\" excludes {any:?}", weather.condition),
                        vec![("condition", json!(weather.condition))],
                    )
                })
            }
            Predicate::UvIndexAbove { value } => (weather.uv_index > *value).then(|| {
                Satisfied::new(
                    format!("uv index {:.1} > {value}", weather.uv_index),
                    vec![("uv_index", json!(weather.uv_index))],
                )
            }),
            Predicate::AqiAbove { value } => {
                let aqi = weather.aqi?;
                (aqi > *value).then(|| {
                    Satisfied::new(format!("aqi {aqi} > {value}"), vec![("aqi", json!(aqi))])
                })
            }
            Predicate::TimeOfDayBetween { start, end } => {
                let (s, e) = (parse_hhmm(start)?, parse_hhmm(end)?);
                time_in_range(time.minutes_of_day(), s, e).then(|| {
                    let local = format!("{:02}:{:02}", time.hour, time.minute);
                    Satisfied::new(
                        format!("local time {local} within {start}-{end}"),
                        vec![("local_time", json!(local)), ("hour", json!(time.hour))],
                    )
                })
            }
            Predicate::IsWeekend { value } => (time.is_weekend == *value).then(|| {
                Satisfied::new(
                    format!("is_weekend = {value}"),
                    vec![("is_weekend", json!(time.is_weekend))],
                )
            }),
            Predicate::IsBusinessHours { value } => (time.is_business_hours == *value).then(|| {
                Satisfied::new(
                    format!("is_business_hours = {value}"),
                    vec![("is_business_hours", json!(time.is_business_hours))],
                )
            }),
            Predicate::IsPeakHours { value } => (time.is_peak_hours == *value).then(|| {
                Satisfied::new(
                    format!("is_peak_hours = {value}"),
                    vec![("is_peak_hours", json!(time.is_peak_hours))],
                )
            }),
            Predicate::TimeCategoryIn { any } => any.contains(&time.category).then(|| {
                Satisfied::new(
                    format!("time category {} in {any:?}", time.category),
                    vec![("time_category", json!(time.category.to_string()))],
                )
            }),
            Predicate::LocationType { any } => {
                let location = ctx.location?;
                any.iter()
                    .any(|t| t.eq_ignore_ascii_case(&location.location_type))
                    .then(|| {
                        Satisfied::new(
                            format!("location type {} in {any:?}", location.location_type),
                            vec![("location_type", json!(location.location_type))],
                        )
                    })
            }
            Predicate::FootTrafficAtLeast { level } => {
                let location = ctx.location?;
                (location.foot_traffic >= *level).then(|| {
                    Satisfied::new(
                        format!("foot traffic {} >= {level}", location.foot_traffic),
                        vec![("foot_traffic", json!(location.foot_traffic.to_string()))],
                    )
                })
            }
            Predicate::TrafficIncident { present } => {
                let incident = ctx.snapshot.traffic.as_ref();
                (incident.is_some() == *present).then(|| {
                    let mut captures = vec![("traffic_incident", json!(incident.is_some()))];
                    if let Some(i) = incident {
                        captures.push(("traffic_kind", json!(i.kind)));
                    }
                    Satisfied::new(format!("traffic incident present = {present}"), captures)
                })
            }
        }
    }
}

/// "HH:MM" → minutes since midnight.
pub fn parse_hhmm(s: &str) -> Option<u32> {
    let (h, m) = s.trim().split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    (h < 24 && m < 60).then_some(h * 60 + m)
}

/// Inclusive range test on minutes-of-day, wrapping past midnight when `start > end`.
pub fn time_in_range(t: u32, start: u32, end: u32) -> bool {
    if start <= end {
        t >= start && t <= end
    } else {
        t >= start || t <= end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::test_snapshot;
    use crate::types::TrafficIncident;

    fn ctx(snapshot: &Snapshot) -> EvalContext<'_> {
        EvalContext { snapshot, location: None }
    }

    #[test]
    fn temperature_above_is_strict() {
        let p = Predicate::TemperatureAbove { value: 35.0 };
        let hot = test_snapshot(36.0, "sunny", 14, 0);
        let edge = test_snapshot(35.0, "sunny", 14, 0);

        let hit = p.evaluate(&ctx(&hot)).expect("36 > 35");
        assert_eq!(hit.captures, vec![("temperature_c", json!(36.0))]);
        assert!(p.evaluate(&ctx(&edge)).is_none(), "35 is not > 35");
    }

    #[test]
    fn weather_contains_is_case_insensitive() {
        let p = Predicate::WeatherContains { any: vec!["rain".into(), "storm".into()] };
        assert!(p.evaluate(&ctx(&test_snapshot(28.0, "Light Rain", 9, 0))).is_some());
        assert!(p.evaluate(&ctx(&test_snapshot(28.0, "Thunderstorm", 9, 0))).is_some());
        assert!(p.evaluate(&ctx(&test_snapshot(28.0, "Clear", 9, 0))).is_none());

        let not = Predicate::WeatherNotContains { any: vec!["rain".into()] };
        assert!(not.evaluate(&ctx(&test_snapshot(28.0, "Clear", 9, 0))).is_some());
        assert!(not.evaluate(&ctx(&test_snapshot(28.0, "heavy rain", 9, 0))).is_none());
    }

    #[test]
    fn time_of_day_wraps_past_midnight() {
        let p = Predicate::TimeOfDayBetween { start: "22:00".into(), end: "02:00".into() };
        assert!(p.evaluate(&ctx(&test_snapshot(27.0, "clear", 23, 30))).is_some());
        assert!(p.evaluate(&ctx(&test_snapshot(27.0, "clear", 1, 0))).is_some());
        assert!(p.evaluate(&ctx(&test_snapshot(27.0, "clear", 12, 0))).is_none());
    }

    #[test]
    fn time_range_bounds_are_inclusive() {
        assert!(time_in_range(9 * 60, 9 * 60, 17 * 60));
        assert!(time_in_range(17 * 60, 9 * 60, 17 * 60));
        assert!(!time_in_range(17 * 60 + 1, 9 * 60, 17 * 60));
    }

    #[test]
    fn parse_hhmm_rejects_garbage() {
        assert_eq!(parse_hhmm("07:45"), Some(465));
        assert_eq!(parse_hhmm("24:00"), None);
        assert_eq!(parse_hhmm("12:60"), None);
        assert_eq!(parse_hhmm("noon"), None);
    }

    #[test]
    fn validate_flags_malformed_predicates() {
        assert!(Predicate::TimeOfDayBetween { start: "25:00".into(), end: "02:00".into() }
            .validate()
            .is_err());
        assert!(Predicate::TemperatureBetween { min: 30.0, max: 20.0 }.validate().is_err());
        assert!(Predicate::WeatherContains { any: vec![] }.validate().is_err());
        assert!(Predicate::HumidityAbove { value: 80.0 }.validate().is_ok());
    }

    #[test]
    fn location_predicates_need_a_location() {
        let snap = test_snapshot(30.0, "clear", 10, 0);
        let mall = Location {
            id: "loc1".into(),
            name: "Mall".into(),
            location_type: "mall".into(),
            foot_traffic: FootTraffic::High,
            is_active: true,
        };
        let p = Predicate::LocationType { any: vec!["MALL".into()] };
        assert!(p.evaluate(&ctx(&snap)).is_none());
        assert!(p.evaluate(&EvalContext { snapshot: &snap, location: Some(&mall) }).is_some());

        let busy = Predicate::FootTrafficAtLeast { level: FootTraffic::Medium };
        assert!(busy.evaluate(&EvalContext { snapshot: &snap, location: Some(&mall) }).is_some());
    }

    #[test]
    fn missing_aqi_never_satisfies() {
        let p = Predicate::AqiAbove { value: 100 };
        assert!(p.evaluate(&ctx(&test_snapshot(30.0, "haze", 10, 0))).is_none());
    }

    #[test]
    fn traffic_incident_captures_kind() {
        let mut snap = test_snapshot(30.0, "clear", 18, 0);
        snap.traffic = Some(TrafficIncident { kind: "accident".into(), description: String::new() });
        let hit = Predicate::TrafficIncident { present: true }
            .evaluate(&ctx(&snap))
            .expect("incident present");
        assert!(hit.captures.contains(&("traffic_kind", json!("accident"))));
    }

    #[test]
    fn deserializes_tagged_and_legacy_names() {
        let p: Predicate =
            serde_json::from_str(r#"{"type":"temperature_c_greater_than","value":35}"#).unwrap();
        assert_eq!(p, Predicate::TemperatureAbove { value: 35.0 });
        let p: Predicate =
            serde_json::from_str(r#"{"type":"time_of_day_between","start":"22:00","end":"02:00"}"#)
                .unwrap();
        assert!(matches!(p, Predicate::TimeOfDayBetween { .. }));
    }
}

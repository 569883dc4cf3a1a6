use std::collections::BTreeMap;

use chrono::{DateTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::rules::Predicate;

/// Concrete snapshot values captured while matching, handed to script generation.
pub type Variables = BTreeMap<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Advertisers & rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Advertiser {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub business_type: String,
    /// Preferred TTS voice; falls back to the script's style.
    #[serde(default)]
    pub voice_type: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

/// Advertiser-owned conjunction of predicates. Read-only to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionRule {
    pub rule_id: String,
    pub advertiser_id: String,
    #[serde(default)]
    pub name: String,
    /// Higher fires first.
    #[serde(default)]
    pub priority: i32,
    pub conditions: Vec<Predicate>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherReading {
    pub temperature_c: f64,
    pub humidity_percent: f64,
    /// Free-form description, e.g. "light rain".
    pub condition: String,
    #[serde(default)]
    pub uv_index: f64,
    #[serde(default)]
    pub aqi: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeCategory {
    Morning,
    Afternoon,
    Evening,
    Night,
}

impl std::fmt::Display for TimeCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TimeCategory::Morning => "morning",
            TimeCategory::Afternoon => "afternoon",
            TimeCategory::Evening => "evening",
            TimeCategory::Night => "night",
        };
        write!(f, "{s}")
    }
}

/// Local (Asia/Singapore) time facts derived from the snapshot timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeContext {
    pub hour: u32,
    pub minute: u32,
    pub day_of_week: Weekday,
    pub is_weekend: bool,
    pub is_business_hours: bool,
    pub is_peak_hours: bool,
    pub category: TimeCategory,
    /// Billing period "YYYY-MM" the snapshot falls in.
    pub period: String,
}

impl TimeContext {
    pub fn minutes_of_day(&self) -> u32 {
        self.hour * 60 + self.minute
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficIncident {
    pub kind: String,
    #[serde(default)]
    pub description: String,
}

/// One immutable bundle of inputs for a single pipeline cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub fetched_at: DateTime<Utc>,
    pub weather: WeatherReading,
    pub time: TimeContext,
    pub traffic: Option<TrafficIncident>,
}

// ---------------------------------------------------------------------------
// Locations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FootTraffic {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for FootTraffic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FootTraffic::Low => "low",
            FootTraffic::Medium => "medium",
            FootTraffic::High => "high",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
    pub id: String,
    pub name: String,
    /// e.g. "mall", "gym", "transit".
    #[serde(default)]
    pub location_type: String,
    #[serde(default = "default_foot_traffic")]
    pub foot_traffic: FootTraffic,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

/// A rule whose every predicate held against the cycle's snapshot.
#[derive(Debug, Clone)]
pub struct ConditionMatch {
    pub rule: ConditionRule,
    /// Human-readable description of each satisfied predicate, in rule order.
    pub satisfied: Vec<String>,
    pub variables: Variables,
    pub priority: i32,
}

// ---------------------------------------------------------------------------
// Contracts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingType {
    MonthlyFixed,
    PerTrigger,
    Hybrid,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for BillingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BillingType::MonthlyFixed => "monthly_fixed",
            BillingType::PerTrigger => "per_trigger",
            BillingType::Hybrid => "hybrid",
            BillingType::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutType {
    FixedMonthly,
    PercentageShare,
    GuaranteedPlusBonus,
}

impl std::fmt::Display for PayoutType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PayoutType::FixedMonthly => "fixed_monthly",
            PayoutType::PercentageShare => "percentage_share",
            PayoutType::GuaranteedPlusBonus => "guaranteed_plus_bonus",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    Active,
    Paused,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvertiserContract {
    pub id: String,
    pub advertiser_id: String,
    pub billing_type: BillingType,
    #[serde(default)]
    pub monthly_fixed_fee: f64,
    #[serde(default)]
    pub per_trigger_rate: f64,
    /// 0 disables the budget guard.
    #[serde(default)]
    pub monthly_budget: f64,
    pub max_triggers_per_month: u32,
    #[serde(default)]
    pub current_month_spend: f64,
    #[serde(default)]
    pub current_month_triggers: u32,
    pub status: ContractStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueContract {
    pub id: String,
    /// Location the venue contract pays out for.
    pub venue_id: String,
    pub payout_type: PayoutType,
    /// Fixed payout, or the guaranteed minimum for guaranteed_plus_bonus.
    #[serde(default)]
    pub fixed_monthly_amount: f64,
    #[serde(default)]
    pub revenue_share_percentage: f64,
    #[serde(default)]
    pub bonus_per_trigger: f64,
    #[serde(default)]
    pub bonus_threshold: u32,
    #[serde(default)]
    pub current_month_earnings: f64,
    #[serde(default)]
    pub current_month_triggers: u32,
    pub status: ContractStatus,
}

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    Pending,
    Played,
    Failed,
}

impl std::fmt::Display for TriggerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TriggerStatus::Pending => "pending",
            TriggerStatus::Played => "played",
            TriggerStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceStatus {
    Pending,
    Completed,
    Failed,
}

impl std::fmt::Display for VoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VoiceStatus::Pending => "pending",
            VoiceStatus::Completed => "completed",
            VoiceStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// One accepted, billed occurrence of an ad. Core fields never change after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdTrigger {
    pub id: String,
    pub advertiser_id: String,
    pub rule_id: String,
    pub location_id: String,
    pub script_ref: String,
    pub script_text: String,
    /// Voice job id handed to the synthesis queue.
    pub voice_ref: String,
    pub voice_status: VoiceStatus,
    pub audio_ref: Option<String>,
    pub cost: f64,
    pub variables: Variables,
    pub status: TriggerStatus,
    pub triggered_at: DateTime<Utc>,
    pub period: String,
}

// ---------------------------------------------------------------------------
// Billing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingRecord {
    pub id: String,
    pub contract_id: String,
    pub advertiser_id: String,
    pub period: String,
    pub billing_type: BillingType,
    pub fixed_fee: f64,
    pub trigger_count: u32,
    pub trigger_charges: f64,
    pub total: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutRecord {
    pub id: String,
    pub contract_id: String,
    pub venue_id: String,
    pub period: String,
    pub payout_type: PayoutType,
    pub base_amount: f64,
    pub variable_amount: f64,
    pub trigger_count: u32,
    pub total: f64,
    pub created_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

fn default_foot_traffic() -> FootTraffic {
    FootTraffic::Medium
}

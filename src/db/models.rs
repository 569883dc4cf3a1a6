//! Row types for reads against the SQLite mirror.
//! Used with `sqlx::query_as` by the API and by the startup restore.
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{AppError, Result};
use crate::types::{AdTrigger, BillingRecord, PayoutRecord};

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct TriggerRow {
    pub id: String,
    pub advertiser_id: String,
    pub rule_id: String,
    pub location_id: String,
    pub script_ref: String,
    pub voice_ref: String,
    pub voice_status: String,
    pub audio_ref: Option<String>,
    pub cost: f64,
    pub status: String,
    pub triggered_at: i64,
    pub period: String,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct SnapshotRow {
    pub id: i64,
    pub fetched_at: i64,
    pub temperature_c: f64,
    pub humidity: f64,
    pub condition: String,
    pub uv_index: f64,
    pub aqi: Option<i64>,
    pub traffic_kind: Option<String>,
    pub time_category: String,
}

/// Full `ad_triggers` row, read back when rebuilding in-memory state.
#[derive(Debug, sqlx::FromRow)]
pub struct StoredTriggerRow {
    pub id: String,
    pub advertiser_id: String,
    pub rule_id: String,
    pub location_id: String,
    pub script_ref: String,
    pub script_text: String,
    pub voice_ref: String,
    pub voice_status: String,
    pub audio_ref: Option<String>,
    pub cost: f64,
    pub variables: String,
    pub status: String,
    pub triggered_at: i64,
    pub period: String,
}

impl StoredTriggerRow {
    pub fn into_trigger(self) -> Result<AdTrigger> {
        Ok(AdTrigger {
            voice_status: label(&self.voice_status)?,
            status: label(&self.status)?,
            variables: serde_json::from_str(&self.variables)?,
            triggered_at: millis(self.triggered_at)?,
            id: self.id,
            advertiser_id: self.advertiser_id,
            rule_id: self.rule_id,
            location_id: self.location_id,
            script_ref: self.script_ref,
            script_text: self.script_text,
            voice_ref: self.voice_ref,
            audio_ref: self.audio_ref,
            cost: self.cost,
            period: self.period,
        })
    }
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct BillingRow {
    pub id: String,
    pub contract_id: String,
    pub advertiser_id: String,
    pub period: String,
    pub billing_type: String,
    pub fixed_fee: f64,
    pub trigger_count: i64,
    pub trigger_charges: f64,
    pub total: f64,
    pub created_at: i64,
}

impl BillingRow {
    pub fn into_record(self) -> Result<BillingRecord> {
        Ok(BillingRecord {
            billing_type: label(&self.billing_type)?,
            trigger_count: count(self.trigger_count)?,
            created_at: millis(self.created_at)?,
            id: self.id,
            contract_id: self.contract_id,
            advertiser_id: self.advertiser_id,
            period: self.period,
            fixed_fee: self.fixed_fee,
            trigger_charges: self.trigger_charges,
            total: self.total,
        })
    }
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct PayoutRow {
    pub id: String,
    pub contract_id: String,
    pub venue_id: String,
    pub period: String,
    pub payout_type: String,
    pub base_amount: f64,
    pub variable_amount: f64,
    pub trigger_count: i64,
    pub total: f64,
    pub created_at: i64,
}

impl PayoutRow {
    pub fn into_record(self) -> Result<PayoutRecord> {
        Ok(PayoutRecord {
            payout_type: label(&self.payout_type)?,
            trigger_count: count(self.trigger_count)?,
            created_at: millis(self.created_at)?,
            id: self.id,
            contract_id: self.contract_id,
            venue_id: self.venue_id,
            period: self.period,
            base_amount: self.base_amount,
            variable_amount: self.variable_amount,
            total: self.total,
        })
    }
}

/// Stored enum labels are the serde names, e.g. "per_trigger".
fn label<T: DeserializeOwned>(raw: &str) -> Result<T> {
    Ok(serde_json::from_value(serde_json::Value::String(raw.to_string()))?)
}

fn millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| AppError::Persistence(format!("timestamp {ms} out of range")))
}

fn count(n: i64) -> Result<u32> {
    u32::try_from(n).map_err(|_| AppError::Persistence(format!("trigger count {n} out of range")))
}

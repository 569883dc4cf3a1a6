use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, warn};

use crate::api::health::ServiceHealth;
use crate::error::Result;
use crate::types::{AdTrigger, BillingRecord, PayoutRecord, Snapshot, TriggerStatus, VoiceStatus};

/// Everything mirrored into SQLite.
#[derive(Debug, Clone)]
pub enum PersistEvent {
    Trigger(AdTrigger),
    TriggerStatus { trigger_id: String, status: TriggerStatus },
    TriggerVoice { trigger_id: String, status: VoiceStatus, audio_ref: Option<String> },
    Billing(BillingRecord),
    Payout(PayoutRecord),
    Health(ServiceHealth),
    Snapshot(Snapshot),
}

/// Non-blocking sender side of the write-behind queue. A disabled handle drops events.
#[derive(Clone, Default)]
pub struct PersistHandle {
    tx: Option<mpsc::Sender<PersistEvent>>,
    pending: Arc<AtomicU64>,
}

impl PersistHandle {
    pub fn new(tx: mpsc::Sender<PersistEvent>) -> Self {
        Self { tx: Some(tx), pending: Arc::new(AtomicU64::new(0)) }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn send(&self, event: PersistEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        // Counted before the send so the writer can never mark it written first.
        self.pending.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = tx.try_send(event) {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            warn!("DB writer channel unavailable: {e}");
        }
    }

    /// Approximate count of events queued for the writer.
    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    /// Wait until the writer has caught up. False if `within` ran out first.
    pub async fn drained(&self, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        while self.pending() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }

    fn mark_written(&self) {
        // fetch_update so a racing reader never sees a wrapped counter.
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
    }
}

/// Receives PersistEvents and writes them to SQLite.
/// Runs as a dedicated background task off the trigger path.
pub struct DbWriter {
    pool: sqlx::SqlitePool,
    rx: mpsc::Receiver<PersistEvent>,
    handle: PersistHandle,
}

impl DbWriter {
    pub fn new(pool: sqlx::SqlitePool, rx: mpsc::Receiver<PersistEvent>, handle: PersistHandle) -> Self {
        Self { pool, rx, handle }
    }

    pub async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            if let Err(e) = self.write(&event).await {
                error!("DB write error: {e}");
            }
            self.handle.mark_written();
        }
    }

    async fn write(&self, event: &PersistEvent) -> Result<()> {
        match event {
            PersistEvent::Trigger(t) => self.write_trigger(t).await,
            PersistEvent::TriggerStatus { trigger_id, status } => {
                sqlx::query("UPDATE ad_triggers SET status = ? WHERE id = ?")
                    .bind(status.to_string())
                    .bind(trigger_id)
                    .execute(&self.pool)
                    .await?;
                Ok(())
            }
            PersistEvent::TriggerVoice { trigger_id, status, audio_ref } => {
                sqlx::query("UPDATE ad_triggers SET voice_status = ?, audio_ref = ? WHERE id = ?")
                    .bind(status.to_string())
                    .bind(audio_ref)
                    .bind(trigger_id)
                    .execute(&self.pool)
                    .await?;
                Ok(())
            }
            PersistEvent::Billing(b) => {
                sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO billing_records (
                        id, contract_id, advertiser_id, period, billing_type,
                        fixed_fee, trigger_count, trigger_charges, total, created_at
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&b.id)
                .bind(&b.contract_id)
                .bind(&b.advertiser_id)
                .bind(&b.period)
                .bind(b.billing_type.to_string())
                .bind(b.fixed_fee)
                .bind(i64::from(b.trigger_count))
                .bind(b.trigger_charges)
                .bind(b.total)
                .bind(b.created_at.timestamp_millis())
                .execute(&self.pool)
                .await?;
                Ok(())
            }
            PersistEvent::Payout(p) => {
                sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO payout_records (
                        id, contract_id, venue_id, period, payout_type,
                        base_amount, variable_amount, trigger_count, total, created_at
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&p.id)
                .bind(&p.contract_id)
                .bind(&p.venue_id)
                .bind(&p.period)
                .bind(p.payout_type.to_string())
                .bind(p.base_amount)
                .bind(p.variable_amount)
                .bind(i64::from(p.trigger_count))
                .bind(p.total)
                .bind(p.created_at.timestamp_millis())
                .execute(&self.pool)
                .await?;
                Ok(())
            }
            PersistEvent::Health(h) => {
                sqlx::query(
                    r#"
                    INSERT INTO worker_health (service, status, error, response_time_ms, checked_at)
                    VALUES (?, ?, ?, ?, ?)
                    ON CONFLICT(service) DO UPDATE SET
                        status = excluded.status,
                        error = excluded.error,
                        response_time_ms = excluded.response_time_ms,
                        checked_at = excluded.checked_at
                    "#,
                )
                .bind(&h.service)
                .bind(h.status.to_string())
                .bind(&h.error)
                .bind(h.response_time_ms.map(|ms| ms as i64))
                .bind(h.checked_at.timestamp_millis())
                .execute(&self.pool)
                .await?;
                Ok(())
            }
            PersistEvent::Snapshot(s) => {
                sqlx::query(
                    r#"
                    INSERT INTO weather_snapshots (
                        fetched_at, temperature_c, humidity, condition, uv_index, aqi,
                        traffic_kind, time_category
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(s.fetched_at.timestamp_millis())
                .bind(s.weather.temperature_c)
                .bind(s.weather.humidity_percent)
                .bind(&s.weather.condition)
                .bind(s.weather.uv_index)
                .bind(s.weather.aqi.map(i64::from))
                .bind(s.traffic.as_ref().map(|t| t.kind.clone()))
                .bind(s.time.category.to_string())
                .execute(&self.pool)
                .await?;
                Ok(())
            }
        }
    }

    async fn write_trigger(&self, t: &AdTrigger) -> Result<()> {
        let variables = serde_json::to_string(&t.variables)?;

        sqlx::query(
            r#"
            INSERT INTO ad_triggers (
                id, advertiser_id, rule_id, location_id, script_ref, script_text,
                voice_ref, voice_status, audio_ref, cost, variables, status,
                triggered_at, period
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&t.id)
        .bind(&t.advertiser_id)
        .bind(&t.rule_id)
        .bind(&t.location_id)
        .bind(&t.script_ref)
        .bind(&t.script_text)
        .bind(&t.voice_ref)
        .bind(t.voice_status.to_string())
        .bind(&t.audio_ref)
        .bind(t.cost)
        .bind(variables)
        .bind(t.status.to_string())
        .bind(t.triggered_at.timestamp_millis())
        .bind(&t.period)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

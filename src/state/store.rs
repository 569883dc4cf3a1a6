use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{AppError, Result};
use crate::types::{
    AdTrigger, Advertiser, BillingRecord, ConditionRule, Location, PayoutRecord, TriggerStatus,
    VoiceStatus,
};

/// Get/create/update/list access to everything the pipeline reads and appends.
/// Contract counters live in the ledger, not here.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn list_active_rules(&self) -> Result<Vec<ConditionRule>>;
    async fn upsert_rule(&self, rule: ConditionRule) -> Result<()>;

    async fn get_advertiser(&self, id: &str) -> Result<Option<Advertiser>>;
    async fn list_advertisers(&self) -> Result<Vec<Advertiser>>;
    async fn upsert_advertiser(&self, advertiser: Advertiser) -> Result<()>;

    async fn list_locations(&self) -> Result<Vec<Location>>;
    async fn create_location(&self, location: Location) -> Result<Location>;

    async fn create_trigger(&self, trigger: AdTrigger) -> Result<()>;
    async fn get_trigger(&self, id: &str) -> Result<Option<AdTrigger>>;
    /// Most recent first.
    async fn list_triggers(&self, limit: usize) -> Result<Vec<AdTrigger>>;
    async fn triggers_for_advertiser(&self, advertiser_id: &str, period: &str) -> Result<Vec<AdTrigger>>;
    async fn triggers_for_location(&self, location_id: &str, period: &str) -> Result<Vec<AdTrigger>>;
    async fn update_trigger_status(&self, id: &str, status: TriggerStatus) -> Result<AdTrigger>;
    async fn update_voice_status(
        &self,
        voice_ref: &str,
        status: VoiceStatus,
        audio_ref: Option<String>,
    ) -> Result<AdTrigger>;

    async fn get_billing_record(&self, contract_id: &str, period: &str) -> Result<Option<BillingRecord>>;
    /// Inserts unless a record for `(contract_id, period)` exists; returns the stored record
    /// and whether it was newly inserted.
    async fn insert_billing_record(&self, record: BillingRecord) -> Result<(BillingRecord, bool)>;
    async fn get_payout_record(&self, contract_id: &str, period: &str) -> Result<Option<PayoutRecord>>;
    async fn insert_payout_record(&self, record: PayoutRecord) -> Result<(PayoutRecord, bool)>;
}

/// In-memory repository. DashMap entries give per-key locking; sequence numbers
/// preserve catalog insertion order for rules and locations.
#[derive(Default)]
pub struct MemoryRepository {
    seq: AtomicU64,
    /// rule_id → (insertion seq, rule)
    rules: DashMap<String, (u64, ConditionRule)>,
    advertisers: DashMap<String, Advertiser>,
    /// location_id → (insertion seq, location)
    locations: DashMap<String, (u64, Location)>,
    triggers: DashMap<String, AdTrigger>,
    /// voice_ref → trigger_id
    voice_index: DashMap<String, String>,
    /// (contract_id, period) → record
    billing: DashMap<(String, String), BillingRecord>,
    payouts: DashMap<(String, String), PayoutRecord>,
}

impl MemoryRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    #[cfg(test)]
    pub fn trigger_count(&self) -> usize {
        self.triggers.len()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn list_active_rules(&self) -> Result<Vec<ConditionRule>> {
        let mut rules: Vec<(u64, ConditionRule)> = self
            .rules
            .iter()
            .filter(|e| e.value().1.is_active)
            .map(|e| e.value().clone())
            .collect();
        rules.sort_by_key(|(seq, _)| *seq);
        Ok(rules.into_iter().map(|(_, r)| r).collect())
    }

    async fn upsert_rule(&self, rule: ConditionRule) -> Result<()> {
        match self.rules.entry(rule.rule_id.clone()) {
            Entry::Occupied(mut e) => e.get_mut().1 = rule,
            Entry::Vacant(e) => {
                e.insert((self.next_seq(), rule));
            }
        }
        Ok(())
    }

    async fn get_advertiser(&self, id: &str) -> Result<Option<Advertiser>> {
        Ok(self.advertisers.get(id).map(|a| a.clone()))
    }

    async fn list_advertisers(&self) -> Result<Vec<Advertiser>> {
        Ok(self.advertisers.iter().map(|e| e.value().clone()).collect())
    }

    async fn upsert_advertiser(&self, advertiser: Advertiser) -> Result<()> {
        self.advertisers.insert(advertiser.id.clone(), advertiser);
        Ok(())
    }

    async fn list_locations(&self) -> Result<Vec<Location>> {
        let mut locations: Vec<(u64, Location)> =
            self.locations.iter().map(|e| e.value().clone()).collect();
        locations.sort_by_key(|(seq, _)| *seq);
        Ok(locations.into_iter().map(|(_, l)| l).collect())
    }

    async fn create_location(&self, location: Location) -> Result<Location> {
        match self.locations.entry(location.id.clone()) {
            Entry::Occupied(e) => Err(AppError::Persistence(format!(
                "location {} already exists",
                e.key()
            ))),
            Entry::Vacant(e) => {
                e.insert((self.next_seq(), location.clone()));
                Ok(location)
            }
        }
    }

    async fn create_trigger(&self, trigger: AdTrigger) -> Result<()> {
        match self.triggers.entry(trigger.id.clone()) {
            Entry::Occupied(e) => Err(AppError::Persistence(format!(
                "trigger {} already exists",
                e.key()
            ))),
            Entry::Vacant(e) => {
                self.voice_index.insert(trigger.voice_ref.clone(), trigger.id.clone());
                e.insert(trigger);
                Ok(())
            }
        }
    }

    async fn get_trigger(&self, id: &str) -> Result<Option<AdTrigger>> {
        Ok(self.triggers.get(id).map(|t| t.clone()))
    }

    async fn list_triggers(&self, limit: usize) -> Result<Vec<AdTrigger>> {
        let mut all: Vec<AdTrigger> = self.triggers.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| b.triggered_at.cmp(&a.triggered_at));
        all.truncate(limit);
        Ok(all)
    }

    async fn triggers_for_advertiser(&self, advertiser_id: &str, period: &str) -> Result<Vec<AdTrigger>> {
        Ok(self
            .triggers
            .iter()
            .filter(|e| e.advertiser_id == advertiser_id && e.period == period)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn triggers_for_location(&self, location_id: &str, period: &str) -> Result<Vec<AdTrigger>> {
        Ok(self
            .triggers
            .iter()
            .filter(|e| e.location_id == location_id && e.period == period)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn update_trigger_status(&self, id: &str, status: TriggerStatus) -> Result<AdTrigger> {
        let mut trigger = self
            .triggers
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("trigger {id}")))?;
        if trigger.status != TriggerStatus::Pending {
            return Err(AppError::Validation(format!(
                "trigger {id} is already {}",
                trigger.status
            )));
        }
        trigger.status = status;
        Ok(trigger.clone())
    }

    async fn update_voice_status(
        &self,
        voice_ref: &str,
        status: VoiceStatus,
        audio_ref: Option<String>,
    ) -> Result<AdTrigger> {
        let trigger_id = self
            .voice_index
            .get(voice_ref)
            .map(|id| id.clone())
            .ok_or_else(|| AppError::NotFound(format!("voice job {voice_ref}")))?;
        let mut trigger = self
            .triggers
            .get_mut(&trigger_id)
            .ok_or_else(|| AppError::NotFound(format!("trigger {trigger_id}")))?;
        trigger.voice_status = status;
        trigger.audio_ref = audio_ref;
        Ok(trigger.clone())
    }

    async fn get_billing_record(&self, contract_id: &str, period: &str) -> Result<Option<BillingRecord>> {
        Ok(self
            .billing
            .get(&(contract_id.to_string(), period.to_string()))
            .map(|r| r.clone()))
    }

    async fn insert_billing_record(&self, record: BillingRecord) -> Result<(BillingRecord, bool)> {
        match self.billing.entry((record.contract_id.clone(), record.period.clone())) {
            Entry::Occupied(e) => Ok((e.get().clone(), false)),
            Entry::Vacant(e) => Ok((e.insert(record).value().clone(), true)),
        }
    }

    async fn get_payout_record(&self, contract_id: &str, period: &str) -> Result<Option<PayoutRecord>> {
        Ok(self
            .payouts
            .get(&(contract_id.to_string(), period.to_string()))
            .map(|r| r.clone()))
    }

    async fn insert_payout_record(&self, record: PayoutRecord) -> Result<(PayoutRecord, bool)> {
        match self.payouts.entry((record.contract_id.clone(), record.period.clone())) {
            Entry::Occupied(e) => Ok((e.get().clone(), false)),
            Entry::Vacant(e) => Ok((e.insert(record).value().clone(), true)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

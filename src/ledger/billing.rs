use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{PersistEvent, PersistHandle};
use crate::error::{AppError, Result};
use crate::ledger::ContractLedger;
use crate::snapshot::time_context::is_valid_period;
use crate::state::Repository;
use crate::types::{BillingRecord, BillingType, PayoutRecord, PayoutType};

/// Rolls a contract's period activity into an immutable invoice or payout record.
///
/// Amounts are derived from the period's persisted triggers rather than the
/// live counters, so a period can still be billed after the month rolled over.
/// Records are keyed by `(contract_id, period)`: asking twice returns the first
/// record.
pub struct BillingCalculator {
    repo: Arc<dyn Repository>,
    ledger: Arc<ContractLedger>,
    persist: PersistHandle,
}

impl BillingCalculator {
    pub fn new(repo: Arc<dyn Repository>, ledger: Arc<ContractLedger>, persist: PersistHandle) -> Self {
        Self { repo, ledger, persist }
    }

    pub async fn calculate_advertiser_monthly_bill(
        &self,
        contract_id: &str,
        period: &str,
    ) -> Result<BillingRecord> {
        check_period(period)?;
        let contract = self
            .ledger
            .advertiser_contract(contract_id)
            .ok_or_else(|| AppError::NotFound(format!("advertiser contract {contract_id}")))?;

        if let Some(existing) = self.repo.get_billing_record(contract_id, period).await? {
            warn!(contract_id, period, record_id = %existing.id, "Period already billed: returning existing record");
            return Ok(existing);
        }

        let triggers = self
            .repo
            .triggers_for_advertiser(&contract.advertiser_id, period)
            .await?;
        let trigger_count = triggers.len() as u32;
        let trigger_sum: f64 = triggers.iter().map(|t| t.cost).sum();

        let (fixed_fee, trigger_charges) = match contract.billing_type {
            BillingType::MonthlyFixed => (contract.monthly_fixed_fee, 0.0),
            BillingType::PerTrigger | BillingType::Unknown => (0.0, trigger_sum),
            BillingType::Hybrid => (contract.monthly_fixed_fee, trigger_sum),
        };

        let record = BillingRecord {
            id: Uuid::new_v4().to_string(),
            contract_id: contract.id.clone(),
            advertiser_id: contract.advertiser_id.clone(),
            period: period.to_string(),
            billing_type: contract.billing_type,
            fixed_fee,
            trigger_count,
            trigger_charges,
            total: fixed_fee + trigger_charges,
            created_at: Utc::now(),
        };

        let (record, inserted) = self.repo.insert_billing_record(record).await?;
        if inserted {
            info!(
                contract_id,
                period,
                triggers = record.trigger_count,
                total = record.total,
                "Advertiser bill generated"
            );
            self.persist.send(PersistEvent::Billing(record.clone()));
        }
        Ok(record)
    }

    pub async fn calculate_venue_monthly_payout(
        &self,
        contract_id: &str,
        period: &str,
    ) -> Result<PayoutRecord> {
        check_period(period)?;
        let contract = self
            .ledger
            .venue_contract(contract_id)
            .ok_or_else(|| AppError::NotFound(format!("venue contract {contract_id}")))?;

        if let Some(existing) = self.repo.get_payout_record(contract_id, period).await? {
            warn!(contract_id, period, record_id = %existing.id, "Period already paid out: returning existing record");
            return Ok(existing);
        }

        let triggers = self.repo.triggers_for_location(&contract.venue_id, period).await?;
        let trigger_count = triggers.len() as u32;

        let (base_amount, variable_amount) = match contract.payout_type {
            PayoutType::FixedMonthly => (contract.fixed_monthly_amount, 0.0),
            PayoutType::PercentageShare => {
                let revenue: f64 = triggers.iter().map(|t| t.cost).sum();
                (0.0, revenue * contract.revenue_share_percentage / 100.0)
            }
            PayoutType::GuaranteedPlusBonus => {
                let bonus_triggers = trigger_count.saturating_sub(contract.bonus_threshold);
                (
                    contract.fixed_monthly_amount,
                    contract.bonus_per_trigger * f64::from(bonus_triggers),
                )
            }
        };

        let record = PayoutRecord {
            id: Uuid::new_v4().to_string(),
            contract_id: contract.id.clone(),
            venue_id: contract.venue_id.clone(),
            period: period.to_string(),
            payout_type: contract.payout_type,
            base_amount,
            variable_amount,
            trigger_count,
            total: base_amount + variable_amount,
            created_at: Utc::now(),
        };

        let (record, inserted) = self.repo.insert_payout_record(record).await?;
        if inserted {
            info!(
                contract_id,
                period,
                triggers = record.trigger_count,
                total = record.total,
                "Venue payout generated"
            );
            self.persist.send(PersistEvent::Payout(record.clone()));
        }
        Ok(record)
    }
}

fn check_period(period: &str) -> Result<()> {
    if is_valid_period(period) {
        Ok(())
    } else {
        Err(AppError::Validation(format!("invalid billing period {period:?}, expected YYYY-MM")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

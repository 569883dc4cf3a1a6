use std::sync::Mutex;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::config::DEFAULT_UNIT_COST;
use crate::error::{AppError, Result};
use crate::types::{AdTrigger, AdvertiserContract, BillingType, ContractStatus, PayoutType, VenueContract};

/// Soft rejection of a match. Not an error: the cycle records it and moves on.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    BudgetExceeded { spend: f64, cost: f64, budget: f64 },
    QuotaExceeded { triggers: u32, max: u32 },
    ContractInactive,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::BudgetExceeded { spend, cost, budget } => {
                write!(f, "budget exceeded: {spend:.2} + {cost:.2} > {budget:.2}")
            }
            RejectReason::QuotaExceeded { triggers, max } => {
                write!(f, "quota exceeded: {triggers}/{max} triggers used")
            }
            RejectReason::ContractInactive => write!(f, "contract inactive"),
        }
    }
}

pub enum ReserveOutcome<'a> {
    Reserved(Reservation<'a>),
    Rejected(RejectReason),
}

/// Spend and one trigger already applied to a contract. Dropping it without
/// `commit()` gives both back, so an aborted match leaves no ledger trace.
#[must_use = "an uncommitted reservation is released on drop"]
pub struct Reservation<'a> {
    ledger: &'a ContractLedger,
    contract_id: String,
    cost: f64,
    settled: bool,
}

impl Reservation<'_> {
    pub fn contract_id(&self) -> &str {
        &self.contract_id
    }

    pub fn cost(&self) -> f64 {
        self.cost
    }

    pub fn commit(mut self) {
        self.settled = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.ledger.release(&self.contract_id, self.cost);
        }
    }
}

/// What a single trigger earned a venue.
#[derive(Debug, Clone, PartialEq)]
pub struct VenueEarning {
    pub contract_id: String,
    pub amount: f64,
    pub month_triggers: u32,
}

/// Cost of one trigger under this contract's billing type.
pub fn unit_cost(contract: &AdvertiserContract) -> f64 {
    match contract.billing_type {
        BillingType::MonthlyFixed => 0.0,
        BillingType::PerTrigger | BillingType::Hybrid => contract.per_trigger_rate,
        BillingType::Unknown => DEFAULT_UNIT_COST,
    }
}

/// Owner of advertiser and venue contract counters.
///
/// Every check-then-write happens under the DashMap entry lock for that
/// contract, so concurrent cycles can never both pass a guard only one of
/// them can satisfy.
pub struct ContractLedger {
    /// contract_id → advertiser contract
    advertiser: DashMap<String, AdvertiserContract>,
    /// contract_id → venue contract
    venue: DashMap<String, VenueContract>,
    /// Billing period the counters currently belong to.
    current_period: Mutex<Option<String>>,
}

impl ContractLedger {
    pub fn new() -> Self {
        Self {
            advertiser: DashMap::new(),
            venue: DashMap::new(),
            current_period: Mutex::new(None),
        }
    }

    pub fn insert_advertiser_contract(&self, contract: AdvertiserContract) {
        self.advertiser.insert(contract.id.clone(), contract);
    }

    pub fn insert_venue_contract(&self, contract: VenueContract) {
        self.venue.insert(contract.id.clone(), contract);
    }

    pub fn advertiser_contract(&self, contract_id: &str) -> Option<AdvertiserContract> {
        self.advertiser.get(contract_id).map(|c| c.clone())
    }

    pub fn venue_contract(&self, contract_id: &str) -> Option<VenueContract> {
        self.venue.get(contract_id).map(|c| c.clone())
    }

    pub fn list_advertiser_contracts(&self) -> Vec<AdvertiserContract> {
        let mut all: Vec<_> = self.advertiser.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn list_venue_contracts(&self) -> Vec<VenueContract> {
        let mut all: Vec<_> = self.venue.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// The advertiser's active contract. With several, the lowest id wins.
    pub fn active_contract_for(&self, advertiser_id: &str) -> Option<AdvertiserContract> {
        self.advertiser
            .iter()
            .filter(|e| e.advertiser_id == advertiser_id && e.status == ContractStatus::Active)
            .map(|e| e.value().clone())
            .min_by(|a, b| a.id.cmp(&b.id))
    }

    pub fn active_venue_contract_for(&self, venue_id: &str) -> Option<VenueContract> {
        self.venue
            .iter()
            .filter(|e| e.venue_id == venue_id && e.status == ContractStatus::Active)
            .map(|e| e.value().clone())
            .min_by(|a, b| a.id.cmp(&b.id))
    }

    /// Budget and quota guards plus the counter increment, as one atomic step.
    pub fn reserve(&self, contract_id: &str) -> Result<ReserveOutcome<'_>> {
        let mut contract = self
            .advertiser
            .get_mut(contract_id)
            .ok_or_else(|| AppError::NotFound(format!("advertiser contract {contract_id}")))?;

        if contract.status != ContractStatus::Active {
            return Ok(ReserveOutcome::Rejected(RejectReason::ContractInactive));
        }

        let cost = unit_cost(&contract);
        if contract.monthly_budget > 0.0 && contract.current_month_spend + cost > contract.monthly_budget {
            return Ok(ReserveOutcome::Rejected(RejectReason::BudgetExceeded {
                spend: contract.current_month_spend,
                cost,
                budget: contract.monthly_budget,
            }));
        }
        if contract.current_month_triggers >= contract.max_triggers_per_month {
            return Ok(ReserveOutcome::Rejected(RejectReason::QuotaExceeded {
                triggers: contract.current_month_triggers,
                max: contract.max_triggers_per_month,
            }));
        }

        contract.current_month_spend += cost;
        contract.current_month_triggers += 1;
        drop(contract);

        Ok(ReserveOutcome::Reserved(Reservation {
            ledger: self,
            contract_id: contract_id.to_string(),
            cost,
            settled: false,
        }))
    }

    fn release(&self, contract_id: &str, cost: f64) {
        match self.advertiser.get_mut(contract_id) {
            Some(mut contract) => {
                contract.current_month_spend = (contract.current_month_spend - cost).max(0.0);
                contract.current_month_triggers = contract.current_month_triggers.saturating_sub(1);
            }
            None => warn!(contract_id, "Released reservation for a contract that no longer exists"),
        }
    }

    /// Credit the venue's active contract for one trigger. `None` if the venue has no contract.
    ///
    /// guaranteed_plus_bonus only earns for triggers beyond `bonus_threshold`.
    pub fn record_venue_trigger(&self, venue_id: &str, unit_cost: f64) -> Option<VenueEarning> {
        let contract_id = self.active_venue_contract_for(venue_id)?.id;
        let mut contract = self.venue.get_mut(&contract_id)?;

        contract.current_month_triggers += 1;
        let amount = match contract.payout_type {
            PayoutType::FixedMonthly => 0.0,
            PayoutType::PercentageShare => unit_cost * contract.revenue_share_percentage / 100.0,
            PayoutType::GuaranteedPlusBonus => {
                if contract.current_month_triggers > contract.bonus_threshold {
                    contract.bonus_per_trigger
                } else {
                    0.0
                }
            }
        };
        contract.current_month_earnings += amount;

        Some(VenueEarning {
            contract_id,
            amount,
            month_triggers: contract.current_month_triggers,
        })
    }

    /// Zero the monthly counters when `period` differs from the one last seen.
    /// The first observed period is adopted without a reset. Returns true on reset.
    pub fn roll_over(&self, period: &str) -> bool {
        let Ok(mut current) = self.current_period.lock() else {
            return false;
        };
        let seen = current.clone();
        match seen.as_deref() {
            Some(p) if p == period => false,
            None => {
                *current = Some(period.to_string());
                false
            }
            Some(previous) => {
                info!(from = previous, to = period, "Billing period rolled over: resetting contract counters");
                *current = Some(period.to_string());
                drop(current);
                self.reset_month();
                true
            }
        }
    }

    /// Rebuild the monthly counters for `period` from triggers already recorded in it,
    /// attributing each one the same way a live cycle does. Adopts `period` as current.
    pub fn rebuild_counters<'a>(&self, period: &str, triggers: impl IntoIterator<Item = &'a AdTrigger>) {
        if let Ok(mut current) = self.current_period.lock() {
            *current = Some(period.to_string());
        }
        self.reset_month();

        let mut replayed = 0usize;
        for trigger in triggers.into_iter().filter(|t| t.period == period) {
            match self.active_contract_for(&trigger.advertiser_id) {
                Some(contract) => {
                    if let Some(mut c) = self.advertiser.get_mut(&contract.id) {
                        c.current_month_spend += trigger.cost;
                        c.current_month_triggers += 1;
                    }
                }
                None => warn!(
                    trigger_id = %trigger.id,
                    advertiser_id = %trigger.advertiser_id,
                    "Recorded trigger has no active contract: spend not restored",
                ),
            }
            self.record_venue_trigger(&trigger.location_id, trigger.cost);
            replayed += 1;
        }
        info!(period, replayed, "Contract counters rebuilt from recorded triggers");
    }

    pub fn reset_month(&self) {
        for mut c in self.advertiser.iter_mut() {
            c.current_month_spend = 0.0;
            c.current_month_triggers = 0;
        }
        for mut v in self.venue.iter_mut() {
            v.current_month_earnings = 0.0;
            v.current_month_triggers = 0;
        }
    }
}

impl Default for ContractLedger {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

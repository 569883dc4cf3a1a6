use serde::Serialize;
use tracing::info;

use crate::db::models::{BillingRow, PayoutRow, StoredTriggerRow};
use crate::error::Result;
use crate::ledger::ContractLedger;
use crate::state::Repository;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RestoreSummary {
    pub triggers: usize,
    pub billing_records: usize,
    pub payout_records: usize,
}

/// Reload what earlier runs recorded so the in-memory repository and ledger pick up
/// where the last process stopped.
///
/// Triggers, invoices and payouts go back into `repo`. Contract counters for
/// `period` are then rebuilt from that period's triggers, so budgets and quotas
/// already spent stay spent. With no recorded triggers at all the catalog's
/// counters are kept. Run after the catalog is installed and before any
/// worker starts.
pub async fn restore_state(
    pool: &sqlx::SqlitePool,
    repo: &dyn Repository,
    ledger: &ContractLedger,
    period: &str,
) -> Result<RestoreSummary> {
    let trigger_rows = sqlx::query_as::<_, StoredTriggerRow>(
        r#"
        SELECT id, advertiser_id, rule_id, location_id, script_ref, script_text,
               voice_ref, voice_status, audio_ref, cost, variables, status,
               triggered_at, period
        FROM ad_triggers
        ORDER BY triggered_at ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut current = Vec::new();
    let triggers = trigger_rows.len();
    for row in trigger_rows {
        let trigger = row.into_trigger()?;
        if trigger.period == period {
            current.push(trigger.clone());
        }
        repo.create_trigger(trigger).await?;
    }

    let billing_rows = sqlx::query_as::<_, BillingRow>(
        r#"
        SELECT id, contract_id, advertiser_id, period, billing_type, fixed_fee,
               trigger_count, trigger_charges, total, created_at
        FROM billing_records
        "#,
    )
    .fetch_all(pool)
    .await?;
    let billing_records = billing_rows.len();
    for row in billing_rows {
        repo.insert_billing_record(row.into_record()?).await?;
    }

    let payout_rows = sqlx::query_as::<_, PayoutRow>(
        r#"
        SELECT id, contract_id, venue_id, period, payout_type, base_amount,
               variable_amount, trigger_count, total, created_at
        FROM payout_records
        "#,
    )
    .fetch_all(pool)
    .await?;
    let payout_records = payout_rows.len();
    for row in payout_rows {
        repo.insert_payout_record(row.into_record()?).await?;
    }

    // A database with no history leaves the catalog's counters alone.
    if triggers > 0 {
        ledger.rebuild_counters(period, &current);
    }

    let summary = RestoreSummary { triggers, billing_records, payout_records };
    info!(
        period,
        triggers,
        billing_records,
        payout_records,
        "Restored {triggers} triggers, {billing_records} invoices, {payout_records} payouts",
    );
    Ok(summary)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use tokio::sync::mpsc;

    use crate::db::{DbWriter, PersistEvent, PersistHandle};
    use crate::ledger::{BillingCalculator, ReserveOutcome};
    use crate::state::MemoryRepository;
    use crate::types::{
        AdTrigger, AdvertiserContract, BillingType, ContractStatus, PayoutType, TriggerStatus,
        Variables, VenueContract, VoiceStatus,
    };

    const PERIOD: &str = "2024-06";

    fn contract() -> AdvertiserContract {
        AdvertiserContract {
            id: "c1".to_string(),
            advertiser_id: "adv1".to_string(),
            billing_type: BillingType::Hybrid,
            monthly_fixed_fee: 4000.0,
            per_trigger_rate: 8.0,
            monthly_budget: 16.0,
            max_triggers_per_month: 100,
            current_month_spend: 0.0,
            current_month_triggers: 0,
            status: ContractStatus::Active,
        }
    }

    fn venue() -> VenueContract {
        VenueContract {
            id: "v1".to_string(),
            venue_id: "loc1".to_string(),
            payout_type: PayoutType::PercentageShare,
            fixed_monthly_amount: 0.0,
            revenue_share_percentage: 25.0,
            bonus_per_trigger: 0.0,
            bonus_threshold: 0,
            current_month_earnings: 0.0,
            current_month_triggers: 0,
            status: ContractStatus::Active,
        }
    }

    fn trigger(n: usize, period: &str) -> AdTrigger {
        let mut variables = Variables::new();
        variables.insert("temperature_c".to_string(), serde_json::json!(33.0));
        AdTrigger {
            id: format!("t{n}"),
            advertiser_id: "adv1".to_string(),
            rule_id: "r1".to_string(),
            location_id: "loc1".to_string(),
            script_ref: format!("script-t{n}"),
            script_text: "Ice cold drinks inside!".to_string(),
            voice_ref: format!("voice-t{n}"),
            voice_status: VoiceStatus::Completed,
            audio_ref: Some(format!("audio/script-t{n}.mp3")),
            cost: 8.0,
            variables,
            status: TriggerStatus::Played,
            triggered_at: Utc::now(),
            period: period.to_string(),
        }
    }

    /// Repository and ledger as a fresh process sees them: catalog only.
    fn fresh_state() -> (Arc<MemoryRepository>, Arc<ContractLedger>) {
        let ledger = Arc::new(ContractLedger::new());
        ledger.insert_advertiser_contract(contract());
        ledger.insert_venue_contract(venue());
        (MemoryRepository::new(), ledger)
    }

    async fn pool() -> sqlx::SqlitePool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn writer(pool: &sqlx::SqlitePool) -> PersistHandle {
        let (tx, rx) = mpsc::channel(64);
        let handle = PersistHandle::new(tx);
        tokio::spawn(DbWriter::new(pool.clone(), rx, handle.clone()).run());
        handle
    }

    /// First run: spends the whole budget on two triggers and bills the period.
    async fn first_run(pool: &sqlx::SqlitePool) -> String {
        let (repo, ledger) = fresh_state();
        let persist = writer(pool);

        for n in 0..2 {
            match ledger.reserve("c1").unwrap() {
                ReserveOutcome::Reserved(r) => {
                    let t = trigger(n, PERIOD);
                    repo.create_trigger(t.clone()).await.unwrap();
                    r.commit();
                    ledger.record_venue_trigger("loc1", 8.0);
                    persist.send(PersistEvent::Trigger(t));
                }
                ReserveOutcome::Rejected(reason) => panic!("unexpected rejection: {reason}"),
            };
        }
        persist.send(PersistEvent::Trigger(trigger(9, "2024-05")));

        let billing = BillingCalculator::new(repo, ledger, persist.clone());
        let bill = billing.calculate_advertiser_monthly_bill("c1", PERIOD).await.unwrap();
        assert!(persist.drained(Duration::from_secs(2)).await);
        bill.id
    }

    #[tokio::test]
    async fn spent_budget_survives_a_restart() {
        let pool = pool().await;
        first_run(&pool).await;

        let (repo, ledger) = fresh_state();
        let summary = restore_state(&pool, repo.as_ref(), &ledger, PERIOD).await.unwrap();
        assert_eq!(summary.triggers, 3);

        let c = ledger.advertiser_contract("c1").unwrap();
        assert_eq!(c.current_month_spend, 16.0);
        assert_eq!(c.current_month_triggers, 2);
        assert!(matches!(
            ledger.reserve("c1").unwrap(),
            ReserveOutcome::Rejected(crate::ledger::contracts::RejectReason::BudgetExceeded { .. })
        ));
        assert_eq!(ledger.venue_contract("v1").unwrap().current_month_earnings, 4.0);

        // Same period again: no reset of what was just rebuilt.
        assert!(!ledger.roll_over(PERIOD));
        assert_eq!(ledger.advertiser_contract("c1").unwrap().current_month_triggers, 2);

        let t = repo.get_trigger("t1").await.unwrap().unwrap();
        assert_eq!(t.status, TriggerStatus::Played);
        assert_eq!(t.voice_status, VoiceStatus::Completed);
        assert_eq!(t.variables["temperature_c"], serde_json::json!(33.0));
    }

    #[tokio::test]
    async fn billing_after_a_restart_returns_the_stored_invoice() {
        let pool = pool().await;
        let first_id = first_run(&pool).await;

        let (repo, ledger) = fresh_state();
        restore_state(&pool, repo.as_ref(), &ledger, PERIOD).await.unwrap();

        let billing = BillingCalculator::new(repo, ledger, PersistHandle::disabled());
        let bill = billing.calculate_advertiser_monthly_bill("c1", PERIOD).await.unwrap();
        assert_eq!(bill.id, first_id);
        assert_eq!(bill.trigger_count, 2);
        assert_eq!(bill.total, 4016.0);
    }

    #[tokio::test]
    async fn unbilled_period_is_computed_from_restored_triggers() {
        let pool = pool().await;
        let persist = writer(&pool);
        for n in 0..2 {
            persist.send(PersistEvent::Trigger(trigger(n, PERIOD)));
        }
        assert!(persist.drained(Duration::from_secs(2)).await);

        let (repo, ledger) = fresh_state();
        restore_state(&pool, repo.as_ref(), &ledger, PERIOD).await.unwrap();

        let billing = BillingCalculator::new(repo, ledger, PersistHandle::disabled());
        let bill = billing.calculate_advertiser_monthly_bill("c1", PERIOD).await.unwrap();
        assert_eq!(bill.trigger_count, 2);
        assert_eq!(bill.total, 4016.0);
    }

    #[tokio::test]
    async fn empty_database_leaves_catalog_counters() {
        let pool = pool().await;
        let (repo, ledger) = fresh_state();
        let seeded = AdvertiserContract { current_month_spend: 8.0, current_month_triggers: 1, ..contract() };
        ledger.insert_advertiser_contract(seeded);

        let summary = restore_state(&pool, repo.as_ref(), &ledger, PERIOD).await.unwrap();
        assert_eq!(summary, RestoreSummary::default());
        let c = ledger.advertiser_contract("c1").unwrap();
        assert_eq!((c.current_month_spend, c.current_month_triggers), (8.0, 1));
    }
}

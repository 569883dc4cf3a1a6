use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::health::HealthState;
use crate::config::{service_names, DEFAULT_LOCATION_NAME, DEFAULT_VOICE_TYPE, MAX_MATCHES_PER_CYCLE};
use crate::db::{PersistEvent, PersistHandle};
use crate::dispatch::{fallback_script, ScriptGenerator, ScriptRequest, VoiceJob, VoiceQueue};
use crate::error::{AppError, Result};
use crate::ledger::{ContractLedger, ReserveOutcome};
use crate::rules::ConditionEngine;
use crate::snapshot::SnapshotProvider;
use crate::state::Repository;
use crate::types::{
    AdTrigger, ConditionMatch, FootTraffic, Location, Snapshot, TriggerStatus, Variables,
    VoiceStatus,
};

pub const DEFAULT_LOCATION_ID: &str = "default-location";

#[derive(Debug, Clone, Serialize)]
pub struct AcceptedTrigger {
    pub trigger_id: String,
    pub rule_id: String,
    pub advertiser_id: String,
    pub location_id: String,
    pub cost: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchNote {
    pub rule_id: String,
    pub advertiser_id: String,
    pub reason: String,
}

/// Outcome of one cycle. Partial success is normal: per-match errors land in `errors`.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub period: Option<String>,
    pub matches: usize,
    pub accepted: Vec<AcceptedTrigger>,
    pub rejected: Vec<MatchNote>,
    pub skipped: Vec<MatchNote>,
    pub errors: Vec<String>,
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl CycleReport {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            period: None,
            matches: 0,
            accepted: Vec::new(),
            rejected: Vec::new(),
            skipped: Vec::new(),
            errors: Vec::new(),
            cancelled: false,
            duration_ms: 0,
        }
    }

    pub fn accepted_count(&self) -> usize {
        self.accepted.len()
    }
}

enum MatchOutcome {
    Accepted(AcceptedTrigger),
    Rejected(String),
    Skipped(String),
}

/// Turns one snapshot's matches into accepted or rejected triggers.
pub struct TriggerEngine {
    repo: Arc<dyn Repository>,
    ledger: Arc<ContractLedger>,
    conditions: ConditionEngine,
    snapshots: Arc<dyn SnapshotProvider>,
    scripts: Arc<dyn ScriptGenerator>,
    voice: Arc<VoiceQueue>,
    health: Arc<HealthState>,
    persist: PersistHandle,
    script_timeout: Duration,
}

impl TriggerEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<dyn Repository>,
        ledger: Arc<ContractLedger>,
        snapshots: Arc<dyn SnapshotProvider>,
        scripts: Arc<dyn ScriptGenerator>,
        voice: Arc<VoiceQueue>,
        health: Arc<HealthState>,
        persist: PersistHandle,
        script_timeout: Duration,
    ) -> Self {
        Self {
            conditions: ConditionEngine::new(repo.clone()),
            repo,
            ledger,
            snapshots,
            scripts,
            voice,
            health,
            persist,
            script_timeout,
        }
    }

    /// Fetch → evaluate → process the top matches.
    ///
    /// A snapshot failure aborts the cycle with `AppError::Snapshot`. Cancellation
    /// stops before the next match; a match interrupted mid-flight leaves no
    /// ledger change and no trigger.
    pub async fn process_cycle(&self, cancel: &CancellationToken) -> Result<CycleReport> {
        let started = Instant::now();
        let mut report = CycleReport::new();

        let snapshot = self.fetch_snapshot(cancel).await?;
        let period = snapshot.time.period.clone();
        self.ledger.roll_over(&period);
        report.period = Some(period);

        let location = match self.resolve_location().await {
            Ok(l) => Some(l),
            Err(e) => {
                warn!("Could not resolve a venue: {e}");
                report.errors.push(format!("venue resolution: {e}"));
                None
            }
        };

        let matches = self.conditions.evaluate(&snapshot, location.as_ref()).await?;
        report.matches = matches.len();
        if matches.is_empty() {
            debug!("No rules matched this snapshot");
        }

        for m in matches.into_iter().take(MAX_MATCHES_PER_CYCLE) {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let note = |reason: String| MatchNote {
                rule_id: m.rule.rule_id.clone(),
                advertiser_id: m.rule.advertiser_id.clone(),
                reason,
            };
            match self.process_match(&m, &snapshot, location.as_ref(), cancel).await {
                Ok(MatchOutcome::Accepted(a)) => report.accepted.push(a),
                Ok(MatchOutcome::Rejected(reason)) => {
                    info!(rule_id = %m.rule.rule_id, "Match rejected: {reason}");
                    report.rejected.push(note(reason));
                }
                Ok(MatchOutcome::Skipped(reason)) => {
                    info!(rule_id = %m.rule.rule_id, "Match skipped: {reason}");
                    report.skipped.push(note(reason));
                }
                Err(AppError::Cancelled) => {
                    info!(rule_id = %m.rule.rule_id, "Cycle cancelled mid-match, nothing committed");
                    report.cancelled = true;
                    break;
                }
                Err(e) => {
                    warn!(rule_id = %m.rule.rule_id, "Match failed: {e}");
                    report.errors.push(format!("rule {}: {e}", m.rule.rule_id));
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            matches = report.matches,
            accepted = report.accepted.len(),
            rejected = report.rejected.len(),
            skipped = report.skipped.len(),
            errors = report.errors.len(),
            "Trigger cycle complete in {}ms",
            report.duration_ms,
        );
        Ok(report)
    }

    async fn fetch_snapshot(&self, cancel: &CancellationToken) -> Result<Snapshot> {
        let started = Instant::now();
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            r = self.snapshots.fetch_snapshot() => r,
        };
        match fetched {
            Ok(s) => {
                self.health.record_success(service_names::WEATHER_API, started.elapsed());
                Ok(s)
            }
            Err(e) => {
                self.health.record_failure(service_names::WEATHER_API, &e, started.elapsed());
                Err(AppError::Snapshot(e))
            }
        }
    }

    /// First active venue; a default one is created when none exists.
    async fn resolve_location(&self) -> Result<Location> {
        if let Some(l) = first_active(self.repo.list_locations().await?) {
            return Ok(l);
        }
        let default = Location {
            id: DEFAULT_LOCATION_ID.to_string(),
            name: DEFAULT_LOCATION_NAME.to_string(),
            location_type: "general".to_string(),
            foot_traffic: FootTraffic::Medium,
            is_active: true,
        };
        match self.repo.create_location(default).await {
            Ok(l) => {
                info!(location_id = %l.id, "No active venue: created default location");
                Ok(l)
            }
            // Another cycle may have created it first.
            Err(e) => first_active(self.repo.list_locations().await?).ok_or(e),
        }
    }

    async fn process_match(
        &self,
        m: &ConditionMatch,
        snapshot: &Snapshot,
        location: Option<&Location>,
        cancel: &CancellationToken,
    ) -> Result<MatchOutcome> {
        let rule_id = &m.rule.rule_id;
        let Some(advertiser) = self.repo.get_advertiser(&m.rule.advertiser_id).await? else {
            return Ok(MatchOutcome::Skipped("advertiser not found".to_string()));
        };
        let Some(contract) = self.ledger.active_contract_for(&advertiser.id) else {
            return Ok(MatchOutcome::Skipped("no active contract".to_string()));
        };

        let reservation = match self.ledger.reserve(&contract.id)? {
            ReserveOutcome::Reserved(r) => r,
            ReserveOutcome::Rejected(reason) => return Ok(MatchOutcome::Rejected(reason.to_string())),
        };
        let cost = reservation.cost();
        debug!(contract_id = %reservation.contract_id(), cost, rule_id = %rule_id, "Spend reserved");

        let variables = trigger_variables(m, snapshot);
        let request = ScriptRequest::new(rule_id, &advertiser, variables.clone());
        let (script_text, voice_style) = self.script_for(&request, cancel).await?;

        let location = location
            .ok_or_else(|| AppError::Persistence("no venue available for trigger".to_string()))?;

        let id = Uuid::new_v4().to_string();
        let trigger = AdTrigger {
            script_ref: format!("script-{id}"),
            voice_ref: format!("voice-{id}"),
            id,
            advertiser_id: advertiser.id.clone(),
            rule_id: rule_id.clone(),
            location_id: location.id.clone(),
            script_text,
            voice_status: VoiceStatus::Pending,
            audio_ref: None,
            cost,
            variables,
            status: TriggerStatus::Pending,
            triggered_at: snapshot.fetched_at,
            period: snapshot.time.period.clone(),
        };

        // A failed write drops the reservation, which gives the spend back.
        self.repo.create_trigger(trigger.clone()).await?;
        reservation.commit();

        if let Some(earning) = self.ledger.record_venue_trigger(&location.id, cost) {
            debug!(
                venue_contract = %earning.contract_id,
                amount = earning.amount,
                month_triggers = earning.month_triggers,
                "Venue credited",
            );
        }

        let voice_type = voice_style
            .or_else(|| advertiser.voice_type.clone())
            .unwrap_or_else(|| DEFAULT_VOICE_TYPE.to_string());
        self.voice.enqueue(VoiceJob {
            voice_ref: trigger.voice_ref.clone(),
            script_ref: trigger.script_ref.clone(),
            text: trigger.script_text.clone(),
            voice_type,
        });

        info!(
            trigger_id = %trigger.id,
            rule_id = %rule_id,
            advertiser_id = %advertiser.id,
            location_id = %location.id,
            cost,
            "Trigger accepted",
        );

        let accepted = AcceptedTrigger {
            trigger_id: trigger.id.clone(),
            rule_id: rule_id.clone(),
            advertiser_id: advertiser.id.clone(),
            location_id: location.id.clone(),
            cost,
        };
        self.persist.send(PersistEvent::Trigger(trigger));
        Ok(MatchOutcome::Accepted(accepted))
    }

    /// Generated copy, or the deterministic fallback when the generator fails or times out.
    async fn script_for(
        &self,
        request: &ScriptRequest,
        cancel: &CancellationToken,
    ) -> Result<(String, Option<String>)> {
        let started = Instant::now();
        let generated = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            r = tokio::time::timeout(self.script_timeout, self.scripts.generate_script(request)) => r,
        };

        let error = match generated {
            Ok(Ok(script)) => {
                self.health.record_success(service_names::SCRIPT_API, started.elapsed());
                return Ok((script.text, script.voice_style));
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {}ms", self.script_timeout.as_millis()),
        };

        warn!(rule_id = %request.rule_id, "Script generation failed, using fallback: {error}");
        self.health
            .record_failure(service_names::SCRIPT_API, &error, started.elapsed());
        Ok((fallback_script(request), None))
    }
}

fn first_active(locations: Vec<Location>) -> Option<Location> {
    locations.into_iter().find(|l| l.is_active)
}

/// Rule captures plus the headline snapshot values the copy may refer to.
fn trigger_variables(m: &ConditionMatch, snapshot: &Snapshot) -> Variables {
    let mut vars = m.variables.clone();
    let w = &snapshot.weather;
    vars.entry("temperature_c".to_string()).or_insert(json!(w.temperature_c));
    vars.entry("condition".to_string()).or_insert(json!(w.condition));
    vars.entry("humidity_percent".to_string()).or_insert(json!(w.humidity_percent));
    vars.entry("time_category".to_string())
        .or_insert(json!(snapshot.time.category.to_string()));
    vars
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;

    use crate::dispatch::{GeneratedScript, TemplateScriptGenerator};
    use crate::error::ProviderError;
    use crate::rules::Predicate;
    use crate::snapshot::StaticSnapshotProvider;
    use crate::state::MemoryRepository;
    use crate::types::{
        AdvertiserContract, Advertiser, BillingRecord, BillingType, ConditionRule, ContractStatus,
        PayoutRecord, PayoutType, VenueContract,
    };

    struct FailingScripts;

    #[async_trait]
    impl ScriptGenerator for FailingScripts {
        async fn generate_script(&self, _: &ScriptRequest) -> std::result::Result<GeneratedScript, ProviderError> {
            Err(ProviderError::Request("connection refused".to_string()))
        }
    }

    struct SlowScripts;

    #[async_trait]
    impl ScriptGenerator for SlowScripts {
        async fn generate_script(&self, _: &ScriptRequest) -> std::result::Result<GeneratedScript, ProviderError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(GeneratedScript { text: "too late".to_string(), voice_style: None })
        }
    }

    struct DownSnapshots;

    #[async_trait]
    impl SnapshotProvider for DownSnapshots {
        async fn fetch_snapshot(&self) -> std::result::Result<Snapshot, ProviderError> {
            Err(ProviderError::Timeout(10_000))
        }
    }

    /// Delegates to a MemoryRepository but refuses to store triggers.
    struct ReadOnlyRepository(Arc<MemoryRepository>);

    #[async_trait]
    impl Repository for ReadOnlyRepository {
        async fn list_active_rules(&self) -> Result<Vec<ConditionRule>> {
            self.0.list_active_rules().await
        }
        async fn upsert_rule(&self, rule: ConditionRule) -> Result<()> {
            self.0.upsert_rule(rule).await
        }
        async fn get_advertiser(&self, id: &str) -> Result<Option<Advertiser>> {
            self.0.get_advertiser(id).await
        }
        async fn list_advertisers(&self) -> Result<Vec<Advertiser>> {
            self.0.list_advertisers().await
        }
        async fn upsert_advertiser(&self, advertiser: Advertiser) -> Result<()> {
            self.0.upsert_advertiser(advertiser).await
        }
        async fn list_locations(&self) -> Result<Vec<Location>> {
            self.0.list_locations().await
        }
        async fn create_location(&self, location: Location) -> Result<Location> {
            self.0.create_location(location).await
        }
        async fn create_trigger(&self, _: AdTrigger) -> Result<()> {
            Err(AppError::Persistence("disk full".to_string()))
        }
        async fn get_trigger(&self, id: &str) -> Result<Option<AdTrigger>> {
            self.0.get_trigger(id).await
        }
        async fn list_triggers(&self, limit: usize) -> Result<Vec<AdTrigger>> {
            self.0.list_triggers(limit).await
        }
        async fn triggers_for_advertiser(&self, advertiser_id: &str, period: &str) -> Result<Vec<AdTrigger>> {
            self.0.triggers_for_advertiser(advertiser_id, period).await
        }
        async fn triggers_for_location(&self, location_id: &str, period: &str) -> Result<Vec<AdTrigger>> {
            self.0.triggers_for_location(location_id, period).await
        }
        async fn update_trigger_status(&self, id: &str, status: TriggerStatus) -> Result<AdTrigger> {
            self.0.update_trigger_status(id, status).await
        }
        async fn update_voice_status(
            &self,
            voice_ref: &str,
            status: VoiceStatus,
            audio_ref: Option<String>,
        ) -> Result<AdTrigger> {
            self.0.update_voice_status(voice_ref, status, audio_ref).await
        }
        async fn get_billing_record(&self, contract_id: &str, period: &str) -> Result<Option<BillingRecord>> {
            self.0.get_billing_record(contract_id, period).await
        }
        async fn insert_billing_record(&self, record: BillingRecord) -> Result<(BillingRecord, bool)> {
            self.0.insert_billing_record(record).await
        }
        async fn get_payout_record(&self, contract_id: &str, period: &str) -> Result<Option<PayoutRecord>> {
            self.0.get_payout_record(contract_id, period).await
        }
        async fn insert_payout_record(&self, record: PayoutRecord) -> Result<(PayoutRecord, bool)> {
            self.0.insert_payout_record(record).await
        }
    }

    struct Fixture {
        repo: Arc<MemoryRepository>,
        ledger: Arc<ContractLedger>,
        voice: Arc<VoiceQueue>,
        health: Arc<HealthState>,
    }

    fn hot_rule(id: &str, advertiser_id: &str, priority: i32) -> ConditionRule {
        ConditionRule {
            rule_id: id.to_string(),
            advertiser_id: advertiser_id.to_string(),
            name: format!("hot day {id}"),
            priority,
            conditions: vec![Predicate::TemperatureAbove { value: 32.0 }],
            is_active: true,
        }
    }

    fn advertiser(id: &str) -> Advertiser {
        Advertiser {
            id: id.to_string(),
            name: format!("Shop {id}"),
            business_type: "beverages".to_string(),
            voice_type: None,
            is_active: true,
        }
    }

    fn contract(id: &str, advertiser_id: &str, budget: f64) -> AdvertiserContract {
        AdvertiserContract {
            id: id.to_string(),
            advertiser_id: advertiser_id.to_string(),
            billing_type: BillingType::PerTrigger,
            monthly_fixed_fee: 0.0,
            per_trigger_rate: 8.0,
            monthly_budget: budget,
            max_triggers_per_month: 100,
            current_month_spend: 0.0,
            current_month_triggers: 0,
            status: ContractStatus::Active,
        }
    }

    /// One advertiser per rule, each with its own per-trigger contract.
    async fn fixture(advertisers: &[(&str, i32)], budget: f64) -> Fixture {
        let repo = MemoryRepository::new();
        let ledger = Arc::new(ContractLedger::new());
        for (n, (adv, priority)) in advertisers.iter().enumerate() {
            repo.upsert_advertiser(advertiser(adv)).await.unwrap();
            repo.upsert_rule(hot_rule(&format!("r{n}"), adv, *priority)).await.unwrap();
            ledger.insert_advertiser_contract(contract(&format!("c-{adv}"), adv, budget));
        }
        Fixture {
            repo,
            ledger,
            voice: Arc::new(VoiceQueue::new()),
            health: Arc::new(HealthState::default()),
        }
    }

    fn hot_snapshot() -> Arc<StaticSnapshotProvider> {
        let provider = StaticSnapshotProvider::fair_weather()
            .at(Utc.with_ymd_and_hms(2024, 6, 5, 6, 0, 0).unwrap());
        provider.set_weather(crate::types::WeatherReading {
            temperature_c: 34.0,
            humidity_percent: 75.0,
            condition: "sunny".to_string(),
            uv_index: 9.0,
            aqi: Some(40),
        });
        Arc::new(provider)
    }

    impl Fixture {
        fn engine_with(
            &self,
            repo: Arc<dyn Repository>,
            snapshots: Arc<dyn SnapshotProvider>,
            scripts: Arc<dyn ScriptGenerator>,
        ) -> TriggerEngine {
            TriggerEngine::new(
                repo,
                self.ledger.clone(),
                snapshots,
                scripts,
                self.voice.clone(),
                self.health.clone(),
                PersistHandle::disabled(),
                Duration::from_secs(5),
            )
        }

        fn engine(&self) -> TriggerEngine {
            self.engine_with(self.repo.clone(), hot_snapshot(), Arc::new(TemplateScriptGenerator))
        }
    }

    #[tokio::test]
    async fn accepted_match_creates_trigger_and_charges_contract() {
        let fx = fixture(&[("adv1", 10)], 0.0).await;
        fx.repo
            .create_location(Location {
                id: "mall-1".to_string(),
                name: "Orchard Mall".to_string(),
                location_type: "mall".to_string(),
                foot_traffic: FootTraffic::High,
                is_active: true,
            })
            .await
            .unwrap();
        fx.ledger.insert_venue_contract(VenueContract {
            id: "vc1".to_string(),
            venue_id: "mall-1".to_string(),
            payout_type: PayoutType::PercentageShare,
            fixed_monthly_amount: 0.0,
            revenue_share_percentage: 50.0,
            bonus_per_trigger: 0.0,
            bonus_threshold: 0,
            current_month_earnings: 0.0,
            current_month_triggers: 0,
            status: ContractStatus::Active,
        });

        let report = fx.engine().process_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.accepted_count(), 1);
        assert!(report.errors.is_empty());
        assert_eq!(report.period.as_deref(), Some("2024-06"));

        let accepted = &report.accepted[0];
        let trigger = fx.repo.get_trigger(&accepted.trigger_id).await.unwrap().unwrap();
        assert_eq!(trigger.status, TriggerStatus::Pending);
        assert_eq!(trigger.location_id, "mall-1");
        assert_eq!(trigger.cost, 8.0);
        assert_eq!(trigger.variables["temperature_c"], json!(34.0));

        let c = fx.ledger.advertiser_contract("c-adv1").unwrap();
        assert_eq!(c.current_month_spend, 8.0);
        assert_eq!(c.current_month_triggers, 1);
        assert_eq!(fx.ledger.venue_contract("vc1").unwrap().current_month_earnings, 4.0);

        let jobs = fx.voice.drain().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].voice_ref, trigger.voice_ref);
        assert_eq!(jobs[0].voice_type, DEFAULT_VOICE_TYPE);
    }

    #[tokio::test]
    async fn only_top_three_matches_in_priority_order() {
        let fx = fixture(&[("a", 1), ("b", 7), ("c", 10), ("d", 9), ("e", 2)], 0.0).await;
        let report = fx.engine().process_cycle(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.matches, 5);
        let order: Vec<_> = report.accepted.iter().map(|a| a.advertiser_id.as_str()).collect();
        assert_eq!(order, vec!["c", "d", "b"]);
    }

    #[tokio::test]
    async fn creates_default_location_when_none_exist() {
        let fx = fixture(&[("adv1", 1)], 0.0).await;
        let report = fx.engine().process_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.accepted[0].location_id, DEFAULT_LOCATION_ID);
        assert_eq!(fx.repo.list_locations().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn budget_rejection_is_reported_not_raised() {
        // Budget covers exactly one trigger at 8.
        let fx = fixture(&[("adv1", 1)], 10.0).await;
        let engine = fx.engine();
        let first = engine.process_cycle(&CancellationToken::new()).await.unwrap();
        let second = engine.process_cycle(&CancellationToken::new()).await.unwrap();

        assert_eq!(first.accepted_count(), 1);
        assert_eq!(second.accepted_count(), 0);
        assert_eq!(second.rejected.len(), 1);
        assert!(second.rejected[0].reason.starts_with("budget exceeded"));
        assert_eq!(fx.ledger.advertiser_contract("c-adv1").unwrap().current_month_spend, 8.0);
    }

    #[tokio::test]
    async fn missing_contract_is_skipped() {
        let fx = fixture(&[("adv1", 1)], 0.0).await;
        fx.repo.upsert_advertiser(advertiser("adv2")).await.unwrap();
        fx.repo.upsert_rule(hot_rule("orphan", "adv2", 5)).await.unwrap();

        let report = fx.engine().process_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].rule_id, "orphan");
        assert_eq!(report.accepted_count(), 1);
    }

    #[tokio::test]
    async fn script_failure_falls_back_and_still_triggers() {
        let fx = fixture(&[("adv1", 1)], 0.0).await;
        let engine = fx.engine_with(fx.repo.clone(), hot_snapshot(), Arc::new(FailingScripts));

        let report = engine.process_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.accepted_count(), 1);

        let trigger = fx.repo.get_trigger(&report.accepted[0].trigger_id).await.unwrap().unwrap();
        assert_eq!(trigger.script_text, "It's 34 degrees right now. Drop by Shop adv1 today!");
        let health = fx.health.get(service_names::SCRIPT_API).unwrap();
        assert_eq!(health.status, crate::api::health::HealthStatus::Down);
    }

    #[tokio::test]
    async fn snapshot_failure_aborts_cycle() {
        let fx = fixture(&[("adv1", 1)], 0.0).await;
        let engine = fx.engine_with(fx.repo.clone(), Arc::new(DownSnapshots), Arc::new(TemplateScriptGenerator));

        let err = engine.process_cycle(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, AppError::Snapshot(ProviderError::Timeout(_))));
        assert_eq!(fx.repo.trigger_count(), 0);
    }

    #[tokio::test]
    async fn persistence_failure_releases_reservation() {
        let fx = fixture(&[("adv1", 1), ("adv2", 2)], 0.0).await;
        let repo = Arc::new(ReadOnlyRepository(fx.repo.clone()));
        let engine = fx.engine_with(repo, hot_snapshot(), Arc::new(TemplateScriptGenerator));

        let report = engine.process_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.accepted_count(), 0);
        assert_eq!(report.errors.len(), 2);
        for id in ["c-adv1", "c-adv2"] {
            let c = fx.ledger.advertiser_contract(id).unwrap();
            assert_eq!(c.current_month_spend, 0.0);
            assert_eq!(c.current_month_triggers, 0);
        }
        assert!(fx.voice.is_empty());
    }

    #[tokio::test]
    async fn cancellation_mid_match_commits_nothing() {
        let fx = fixture(&[("adv1", 1)], 0.0).await;
        let engine = fx.engine_with(fx.repo.clone(), hot_snapshot(), Arc::new(SlowScripts));

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let report = engine.process_cycle(&cancel).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.accepted_count(), 0);
        assert_eq!(fx.repo.trigger_count(), 0);
        assert_eq!(fx.ledger.advertiser_contract("c-adv1").unwrap().current_month_triggers, 0);
    }

    #[tokio::test]
    async fn cancelled_before_fetch_is_an_error() {
        let fx = fixture(&[("adv1", 1)], 0.0).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = fx.engine().process_cycle(&cancel).await.unwrap_err();
        assert!(matches!(err, AppError::Cancelled));
    }
}

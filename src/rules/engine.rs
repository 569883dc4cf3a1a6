use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Result, RuleError};
use crate::rules::predicate::EvalContext;
use crate::state::Repository;
use crate::types::{ConditionMatch, ConditionRule, Location, Snapshot, Variables};

/// Evaluates the active rule set against one snapshot.
pub struct ConditionEngine {
    repo: Arc<dyn Repository>,
}

impl ConditionEngine {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    /// Priority-ordered matches for this snapshot. Individual bad rules are logged and skipped.
    pub async fn evaluate(
        &self,
        snapshot: &Snapshot,
        location: Option<&Location>,
    ) -> Result<Vec<ConditionMatch>> {
        let rules = self.repo.list_active_rules().await?;
        let advertisers: HashSet<String> = self
            .repo
            .list_advertisers()
            .await?
            .into_iter()
            .filter(|a| a.is_active)
            .map(|a| a.id)
            .collect();

        let ctx = EvalContext { snapshot, location };
        let matches = match_rules(&rules, &ctx, |id| advertisers.contains(id));
        debug!(
            rules = rules.len(),
            matches = matches.len(),
            "Evaluated {} rules, {} matched",
            rules.len(),
            matches.len(),
        );
        Ok(matches)
    }
}

/// Match every active rule, returning hits sorted by descending priority.
/// Equal priorities keep their input order.
pub fn match_rules<F>(
    rules: &[ConditionRule],
    ctx: &EvalContext<'_>,
    advertiser_exists: F,
) -> Vec<ConditionMatch>
where
    F: Fn(&str) -> bool,
{
    let mut matches: Vec<ConditionMatch> = rules
        .iter()
        .filter(|r| r.is_active)
        .filter_map(|rule| match evaluate_rule(rule, ctx, &advertiser_exists) {
            Ok(hit) => hit,
            Err(e) => {
                warn!(rule_id = %rule.rule_id, "Skipping rule: {e}");
                None
            }
        })
        .collect();

    // sort_by is stable, so ties stay in catalog order.
    matches.sort_by(|a, b| b.priority.cmp(&a.priority));
    matches
}

/// `Ok(None)` when any predicate fails; `Err` when the rule can't be evaluated at all.
pub fn evaluate_rule<F>(
    rule: &ConditionRule,
    ctx: &EvalContext<'_>,
    advertiser_exists: F,
) -> std::result::Result<Option<ConditionMatch>, RuleError>
where
    F: Fn(&str) -> bool,
{
    if !advertiser_exists(&rule.advertiser_id) {
        return Err(RuleError::UnknownAdvertiser {
            rule_id: rule.rule_id.clone(),
            advertiser_id: rule.advertiser_id.clone(),
        });
    }
    if rule.conditions.is_empty() {
        return Err(RuleError::InvalidPredicate {
            rule_id: rule.rule_id.clone(),
            reason: "rule has no conditions".to_string(),
        });
    }

    // Every predicate is checked up front so a bad rule is flagged whatever the weather.
    for predicate in &rule.conditions {
        predicate.validate().map_err(|reason| RuleError::InvalidPredicate {
            rule_id: rule.rule_id.clone(),
            reason,
        })?;
    }

    let mut satisfied = Vec::with_capacity(rule.conditions.len());
    let mut variables = Variables::new();

    for predicate in &rule.conditions {
        let Some(hit) = predicate.evaluate(ctx) else {
            return Ok(None);
        };
        satisfied.push(hit.description);
        for (key, value) in hit.captures {
            variables.insert(key.to_string(), value);
        }
    }

    Ok(Some(ConditionMatch {
        rule: rule.clone(),
        satisfied,
        variables,
        priority: rule.priority,
    }))
}

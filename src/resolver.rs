//! Rule resolution and execution planning.
//!
//! Resolution is a pure function over the candidate rules of one topic:
//!
//! 1. keep rules whose effective window contains `as_of`;
//! 2. keep the highest precedence tier present;
//! 3. exactly one survivor wins, more than one is a conflict, none is a gap.
//!
//! Planning expands the transitive topic dependencies of the requested
//! targets and orders them so every rule runs after the topics it reads.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::Serialize;
use tracing::debug;

use crate::error::ExecutionError;
use crate::rule::{PrecedenceTier, Rule, RuleVersionRef, Topic};
use crate::ruleset::{RulesetId, RulesetSnapshot};

/// The rule chosen for a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedRule {
    /// Winning rule.
    pub rule: Rule,
    /// Lower-tier rules in force at the same date, highest tier first.
    pub overridden: Vec<RuleVersionRef>,
}

/// Topics in dependency order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    pub ruleset_id: RulesetId,
    pub as_of: NaiveDate,
    /// Every rule to execute; dependencies come first.
    pub steps: Vec<ResolvedRule>,
    /// Topics the caller asked for (all planned topics when none were named).
    pub targets: BTreeSet<Topic>,
}

impl ExecutionPlan {
    /// Planned topics in execution order.
    pub fn topics(&self) -> impl Iterator<Item = &Topic> {
        self.steps.iter().map(|s| &s.rule.topic)
    }
}

/// Chooses the rule for `topic` among `candidates` at `as_of`.
///
/// # Errors
///
/// - `RuleConflict` if two or more rules share the winning tier.
/// - `MissingRule` if no candidate is in force.
pub fn resolve_topic<'a>(
    topic: &Topic,
    candidates: impl IntoIterator<Item = &'a Rule>,
    as_of: NaiveDate,
) -> Result<ResolvedRule, ExecutionError> {
    let mut by_tier: BTreeMap<PrecedenceTier, Vec<&Rule>> = BTreeMap::new();
    for rule in candidates {
        if rule.topic == *topic && rule.window.contains(as_of) {
            by_tier.entry(rule.tier).or_default().push(rule);
        }
    }

    // `PrecedenceTier` orders Statute highest, so the last entry wins.
    let Some((tier, winners)) = by_tier.pop_last() else {
        return Err(ExecutionError::MissingRule {
            topic: topic.to_string(),
            as_of,
        });
    };
    if winners.len() > 1 {
        let mut rules: Vec<String> = winners.iter().map(|r| r.version_ref().to_string()).collect();
        rules.sort();
        return Err(ExecutionError::RuleConflict {
            topic: topic.to_string(),
            tier: tier.as_str().to_string(),
            rules,
        });
    }

    let overridden = by_tier
        .into_iter()
        .rev()
        .flat_map(|(_, rules)| rules.into_iter().map(Rule::version_ref))
        .collect();
    Ok(ResolvedRule {
        rule: winners[0].clone(),
        overridden,
    })
}

/// Builds the execution plan for `targets` inside one snapshot.
///
/// Empty `targets` plans every topic that has a rule in force at `as_of`.
///
/// # Errors
///
/// Returns resolution failures for any required topic and
/// `DependencyCycle` if the resolved rules read each other.
pub fn plan(snapshot: &RulesetSnapshot, as_of: NaiveDate, targets: &[Topic]) -> Result<ExecutionPlan, ExecutionError> {
    let requested: BTreeSet<Topic> = if targets.is_empty() {
        snapshot
            .rules
            .iter()
            .filter(|r| r.window.contains(as_of))
            .map(|r| r.topic.clone())
            .collect()
    } else {
        targets.iter().cloned().collect()
    };

    let mut resolved: BTreeMap<Topic, ResolvedRule> = BTreeMap::new();
    let mut pending: Vec<Topic> = requested.iter().cloned().collect();
    while let Some(topic) = pending.pop() {
        if resolved.contains_key(&topic) {
            continue;
        }
        let choice = resolve_topic(&topic, &snapshot.rules, as_of)?;
        debug!(
            ruleset_id = %snapshot.id,
            %topic,
            rule = %choice.rule.version_ref(),
            overridden = choice.overridden.len(),
            "rule resolved"
        );
        pending.extend(
            choice
                .rule
                .dependencies()
                .into_iter()
                .filter(|dep| !resolved.contains_key(dep)),
        );
        resolved.insert(topic, choice);
    }

    let steps = order(resolved)?;
    Ok(ExecutionPlan {
        ruleset_id: snapshot.id.clone(),
        as_of,
        steps,
        targets: requested,
    })
}

/// Kahn's algorithm with a sorted ready set, so ties break by topic name.
fn order(mut resolved: BTreeMap<Topic, ResolvedRule>) -> Result<Vec<ResolvedRule>, ExecutionError> {
    let mut waiting_on: BTreeMap<Topic, BTreeSet<Topic>> = resolved
        .iter()
        .map(|(topic, r)| (topic.clone(), r.rule.dependencies()))
        .collect();
    let mut dependents: BTreeMap<Topic, Vec<Topic>> = BTreeMap::new();
    for (topic, deps) in &waiting_on {
        for dep in deps {
            dependents.entry(dep.clone()).or_default().push(topic.clone());
        }
    }

    let mut ready: BTreeSet<Topic> = waiting_on
        .iter()
        .filter(|(_, deps)| deps.is_empty())
        .map(|(t, _)| t.clone())
        .collect();
    let mut steps = Vec::with_capacity(resolved.len());
    while let Some(topic) = ready.pop_first() {
        waiting_on.remove(&topic);
        for dependent in dependents.remove(&topic).unwrap_or_default() {
            if let Some(deps) = waiting_on.get_mut(&dependent) {
                deps.remove(&topic);
                if deps.is_empty() {
                    ready.insert(dependent);
                }
            }
        }
        if let Some(step) = resolved.remove(&topic) {
            steps.push(step);
        }
    }

    if !waiting_on.is_empty() {
        return Err(ExecutionError::DependencyCycle {
            topics: waiting_on.into_keys().map(|t| t.to_string()).collect(),
        });
    }
    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::decimal::Unit;
    use crate::expr::Expr;
    use crate::ruleset::RulesetArtifact;
    use crate::time::EffectiveWindow;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn rule(id: &str, topic: &str, tier: PrecedenceTier, window: EffectiveWindow, expr: Expr) -> Rule {
        Rule::builder()
            .id(id, 1)
            .topic(topic)
            .tier(tier)
            .window(window)
            .expression(expr)
            .unit(Unit::Dollars)
            .build()
            .unwrap()
    }

    fn snapshot(rules: Vec<Rule>) -> RulesetSnapshot {
        RulesetSnapshot::draft(
            RulesetArtifact::new(RulesetId::parse("ruleset-20240701").unwrap(), None, rules).unwrap(),
        )
    }

    #[test]
    fn highest_tier_wins() {
        let statute = rule("s", "t", PrecedenceTier::Statute, EffectiveWindow::always(), Expr::input("a"));
        let guidance = rule("g", "t", PrecedenceTier::Guidance, EffectiveWindow::always(), Expr::input("b"));
        let resolved = resolve_topic(&Topic::new("t"), [&guidance, &statute], date(2024, 7, 1)).unwrap();
        assert_eq!(resolved.rule.id, "s");
        assert_eq!(resolved.overridden, vec![RuleVersionRef::new("g", 1)]);
    }

    #[test]
    fn window_filters_before_tier() {
        let fy24 = EffectiveWindow::new(date(2023, 7, 1), date(2024, 7, 1)).unwrap();
        let statute = rule("s", "t", PrecedenceTier::Statute, fy24, Expr::input("a"));
        let ruling = rule("r", "t", PrecedenceTier::Ruling, EffectiveWindow::always(), Expr::input("b"));
        let rules = [statute, ruling];
        assert_eq!(resolve_topic(&Topic::new("t"), &rules, date(2024, 1, 1)).unwrap().rule.id, "s");
        assert_eq!(resolve_topic(&Topic::new("t"), &rules, date(2024, 7, 1)).unwrap().rule.id, "r");
    }

    #[test]
    fn same_tier_is_conflict_and_none_is_missing() {
        let a = rule("b-rule", "t", PrecedenceTier::Ruling, EffectiveWindow::always(), Expr::input("a"));
        let b = rule("a-rule", "t", PrecedenceTier::Ruling, EffectiveWindow::always(), Expr::input("b"));
        let err = resolve_topic(&Topic::new("t"), [&a, &b], date(2024, 7, 1)).unwrap_err();
        let ExecutionError::RuleConflict { rules, tier, .. } = err else {
            panic!("expected conflict");
        };
        assert_eq!(rules, vec!["a-rule@v1", "b-rule@v1"]);
        assert_eq!(tier, "ruling");

        let err = resolve_topic(&Topic::new("other"), [&a], date(2024, 7, 1)).unwrap_err();
        assert_eq!(err.kind(), "missing_rule");
    }

    #[test]
    fn plan_orders_dependencies_first() {
        let always = EffectiveWindow::always();
        let snap = snapshot(vec![
            rule("net", "net", PrecedenceTier::Statute, always, Expr::sub(Expr::topic("gross"), Expr::topic("tax"))),
            rule("tax", "tax", PrecedenceTier::Statute, always, Expr::topic("gross")),
            rule("gross", "gross", PrecedenceTier::Statute, always, Expr::input("salary")),
            rule("other", "other", PrecedenceTier::Statute, always, Expr::input("x")),
        ]);
        let p = plan(&snap, date(2024, 7, 1), &[Topic::new("net")]).unwrap();
        let order: Vec<&str> = p.topics().map(Topic::as_str).collect();
        assert_eq!(order, vec!["gross", "tax", "net"]);

        let all = plan(&snap, date(2024, 7, 1), &[]).unwrap();
        assert_eq!(all.steps.len(), 4);
    }

    #[test]
    fn plan_detects_cycles() {
        let always = EffectiveWindow::always();
        let snap = snapshot(vec![
            rule("a", "a", PrecedenceTier::Statute, always, Expr::topic("b")),
            rule("b", "b", PrecedenceTier::Statute, always, Expr::topic("a")),
        ]);
        let err = plan(&snap, date(2024, 7, 1), &[Topic::new("a")]).unwrap_err();
        assert_eq!(err.kind(), "dependency_cycle");
    }
}

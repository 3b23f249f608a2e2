//! Calculation execution.
//!
//! Runs a resolved [`ExecutionPlan`] over client data and a snapshot of the
//! assumptions in force at `as_of`. Each rule sees only its declared inputs,
//! assumptions and the outputs of topics planned before it.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::decimal::{Quantity, RoundingPolicy};
use crate::error::{CalcError, CalcResult, ExecutionError, ValidationError};
use crate::expr::{Comparison, Expr};
use crate::fact::RoundingStep;
use crate::reference::{Assumption, AssumptionRef, AssumptionValue};
use crate::request::ClientData;
use crate::resolver::{ExecutionPlan, ResolvedRule};
use crate::rule::{Rule, RuleVersionRef, Topic};

/// Assumption versions pinned for one calculation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssumptionSnapshot {
    entries: BTreeMap<String, Assumption>,
}

impl AssumptionSnapshot {
    /// Creates an empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys every rule in the plan declares.
    #[must_use]
    pub fn required_keys(plan: &ExecutionPlan) -> BTreeSet<String> {
        plan.steps
            .iter()
            .flat_map(|s| s.rule.assumptions.iter().cloned())
            .collect()
    }

    /// Pins the version of each key in force at `as_of`, reading through
    /// `fetch`.
    ///
    /// # Errors
    ///
    /// Returns `MissingAssumption` for a key with no version in force and
    /// propagates `fetch` failures.
    pub fn load(
        keys: &BTreeSet<String>,
        as_of: NaiveDate,
        mut fetch: impl FnMut(&str) -> CalcResult<Option<Assumption>>,
    ) -> CalcResult<Self> {
        let mut snapshot = Self::new();
        for key in keys {
            let assumption = fetch(key)?.ok_or_else(|| ExecutionError::MissingAssumption {
                key: key.clone(),
                as_of,
            })?;
            snapshot.insert(assumption);
        }
        Ok(snapshot)
    }

    /// Adds or replaces an assumption.
    pub fn insert(&mut self, assumption: Assumption) {
        self.entries.insert(assumption.key.clone(), assumption);
    }

    /// Looks up an assumption by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Assumption> {
        self.entries.get(key)
    }

    /// Number of pinned assumptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is pinned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Human-readable record of one rule execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub rule: RuleVersionRef,
    pub topic: Topic,
    pub detail: String,
}

/// Output of one rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleOutput {
    pub topic: Topic,
    /// Value after the rule's final rounding.
    pub value: Quantity,
    pub rule: RuleVersionRef,
    pub rounding_steps: Vec<RoundingStep>,
    /// Topics whose outputs this rule read.
    pub upstream: BTreeSet<Topic>,
    /// Exact assumption versions read.
    pub assumptions_used: BTreeSet<AssumptionRef>,
    pub trace: TraceEntry,
}

/// Outputs of a whole plan, in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub outputs: Vec<RuleOutput>,
}

impl Execution {
    /// Output for a topic.
    #[must_use]
    pub fn output(&self, topic: &Topic) -> Option<&RuleOutput> {
        self.outputs.iter().find(|o| o.topic == *topic)
    }
}

/// Executes every step of `plan`.
///
/// # Errors
///
/// - `MissingInput` if a rule reads a client field that was not supplied.
/// - `MissingAssumption` if an assumption is not in the snapshot.
/// - `UnitMismatch`, `Arithmetic` or `PrecisionExceeded` from the kernel.
pub fn execute(plan: &ExecutionPlan, client_data: &ClientData, assumptions: &AssumptionSnapshot) -> CalcResult<Execution> {
    let mut values: BTreeMap<Topic, Quantity> = BTreeMap::new();
    let mut outputs = Vec::with_capacity(plan.steps.len());
    for step in &plan.steps {
        let output = execute_rule(step, plan.as_of, client_data, assumptions, &values)?;
        debug!(
            ruleset_id = %plan.ruleset_id,
            as_of = %plan.as_of,
            topic = %output.topic,
            rule = %output.rule,
            value = %output.value.amount,
            "rule executed"
        );
        values.insert(output.topic.clone(), output.value.clone());
        outputs.push(output);
    }
    Ok(Execution { outputs })
}

fn execute_rule(
    step: &ResolvedRule,
    as_of: NaiveDate,
    client_data: &ClientData,
    assumptions: &AssumptionSnapshot,
    upstream: &BTreeMap<Topic, Quantity>,
) -> CalcResult<RuleOutput> {
    let rule = &step.rule;
    let mut ctx = Evaluation {
        rule,
        as_of,
        client_data,
        assumptions,
        upstream,
        steps: Vec::new(),
        read_topics: BTreeSet::new(),
        used: BTreeSet::new(),
        notes: Vec::new(),
    };
    let raw = ctx.eval(&rule.expression)?;
    if raw.unit != rule.unit {
        return Err(ExecutionError::UnitMismatch {
            operation: "output".to_string(),
            left: raw.unit,
            right: rule.unit,
        }
        .into());
    }

    let value = rule.rounding.apply_to(&raw);
    ctx.steps.push(RoundingStep::new(
        rule.version_ref(),
        &raw.amount,
        &value.amount,
        rule.rounding,
    ));

    let mut detail = format!(
        "{} = {} {} via {} ({})",
        rule.topic,
        value.amount,
        value.unit,
        rule.version_ref(),
        rule.tier
    );
    if !step.overridden.is_empty() {
        let overridden: Vec<String> = step.overridden.iter().map(ToString::to_string).collect();
        detail.push_str(&format!("; overrides {}", overridden.join(", ")));
    }
    for note in &ctx.notes {
        detail.push_str("; ");
        detail.push_str(note);
    }

    Ok(RuleOutput {
        topic: rule.topic.clone(),
        value,
        rule: rule.version_ref(),
        rounding_steps: ctx.steps,
        upstream: ctx.read_topics,
        assumptions_used: ctx.used,
        trace: TraceEntry {
            rule: rule.version_ref(),
            topic: rule.topic.clone(),
            detail,
        },
    })
}

/// Range-checks a leaf value before it reaches arithmetic.
fn leaf(value: &Quantity) -> CalcResult<Quantity> {
    value.check_range()?;
    Ok(value.clone())
}

struct Evaluation<'a> {
    rule: &'a Rule,
    as_of: NaiveDate,
    client_data: &'a ClientData,
    assumptions: &'a AssumptionSnapshot,
    upstream: &'a BTreeMap<Topic, Quantity>,
    steps: Vec<RoundingStep>,
    read_topics: BTreeSet<Topic>,
    used: BTreeSet<AssumptionRef>,
    notes: Vec<String>,
}

impl<'a> Evaluation<'a> {
    fn eval(&mut self, expr: &Expr) -> CalcResult<Quantity> {
        let value = match expr {
            Expr::Const { value } => return leaf(value),
            Expr::Input { field } => {
                let Some(value) = self.client_data.get(field) else {
                    return Err(ValidationError::MissingInput {
                        field: field.clone(),
                    }
                    .into());
                };
                return leaf(value);
            }
            Expr::Assumption { key } => {
                let assumption = self.assumption(key)?;
                return match &assumption.value {
                    AssumptionValue::Scalar(q) => leaf(q),
                    AssumptionValue::Schedule(_) => Err(arithmetic(format!(
                        "assumption '{key}' is a bracket schedule, not a scalar"
                    ))),
                };
            }
            Expr::Topic { topic } => {
                let Some(value) = self.upstream.get(topic) else {
                    return Err(ExecutionError::MissingRule {
                        topic: topic.to_string(),
                        as_of: self.as_of,
                    }
                    .into());
                };
                self.read_topics.insert(topic.clone());
                return Ok(value.clone());
            }
            Expr::Add { args } => {
                let mut iter = args.iter();
                let Some(first) = iter.next() else {
                    return Err(arithmetic("add needs at least one operand".to_string()));
                };
                let mut total = self.eval(first)?;
                for arg in iter {
                    let next = self.eval(arg)?;
                    total = total.add(&next)?;
                }
                total
            }
            Expr::Sub { left, right } => {
                let (l, r) = (self.eval(left)?, self.eval(right)?);
                l.sub(&r)?
            }
            Expr::Mul { left, right } => {
                let (l, r) = (self.eval(left)?, self.eval(right)?);
                l.mul(&r)?
            }
            Expr::Div { left, right } => {
                let (l, r) = (self.eval(left)?, self.eval(right)?);
                l.div(&r)?
            }
            Expr::Neg { arg } => self.eval(arg)?.neg(),
            Expr::Min { args } | Expr::Max { args } => {
                let is_min = matches!(expr, Expr::Min { .. });
                let mut iter = args.iter();
                let Some(first) = iter.next() else {
                    return Err(arithmetic("min/max needs at least one operand".to_string()));
                };
                let mut best = self.eval(first)?;
                for arg in iter {
                    let next = self.eval(arg)?;
                    best = if is_min { best.min(&next)? } else { best.max(&next)? };
                }
                return Ok(best);
            }
            Expr::FloorZero { arg } => return Ok(self.eval(arg)?.floor_zero()),
            Expr::Round { arg, policy } => {
                let inner = self.eval(arg)?;
                return Ok(self.round(&inner, *policy));
            }
            Expr::If { cond, then, otherwise } => {
                let (l, r) = (self.eval(&cond.left)?, self.eval(&cond.right)?);
                let ordering = l.compare(&r)?;
                let holds = match cond.cmp {
                    Comparison::Gt => ordering.is_gt(),
                    Comparison::Ge => ordering.is_ge(),
                    Comparison::Lt => ordering.is_lt(),
                    Comparison::Le => ordering.is_le(),
                    Comparison::Eq => ordering.is_eq(),
                    Comparison::Ne => ordering.is_ne(),
                };
                self.notes.push(format!(
                    "{} {:?} {} is {holds}",
                    l.amount, cond.cmp, r.amount
                ));
                return if holds { self.eval(then) } else { self.eval(otherwise) };
            }
            Expr::Progressive { base, schedule } => {
                let base = self.eval(base)?;
                let assumption = self.assumption(schedule)?;
                let AssumptionValue::Schedule(brackets) = &assumption.value else {
                    return Err(arithmetic(format!("assumption '{schedule}' is not a bracket schedule")));
                };
                let bands = brackets
                    .brackets
                    .iter()
                    .filter(|b| base.amount > b.threshold.amount)
                    .count();
                let result = brackets.apply(&base)?;
                self.notes
                    .push(format!("{schedule} applied to {} across {bands} bracket(s)", base.amount));
                result
            }
            Expr::Compound {
                principal,
                rate,
                periods,
            } => {
                let (p, r) = (self.eval(principal)?, self.eval(rate)?);
                self.notes
                    .push(format!("compounded {} at {} {} over {periods} period(s)", p.amount, r.amount, r.unit));
                p.compound(&r, *periods)?
            }
        };
        // Arithmetic nodes fall through here.
        if self.rule.rounding.rounds_each_step() {
            Ok(self.round(&value, self.rule.rounding))
        } else {
            Ok(value)
        }
    }

    fn round(&mut self, value: &Quantity, policy: RoundingPolicy) -> Quantity {
        let rounded = policy.apply_to(value);
        if rounded.amount != value.amount {
            self.steps.push(RoundingStep::new(
                self.rule.version_ref(),
                &value.amount,
                &rounded.amount,
                policy,
            ));
        }
        rounded
    }

    fn assumption(&mut self, key: &str) -> Result<&'a Assumption, CalcError> {
        let assumptions: &'a AssumptionSnapshot = self.assumptions;
        let Some(assumption) = assumptions.get(key) else {
            return Err(ExecutionError::MissingAssumption {
                key: key.to_string(),
                as_of: self.as_of,
            }
            .into());
        };
        self.used.insert(AssumptionRef {
            key: assumption.key.clone(),
            version: assumption.version,
        });
        Ok(assumption)
    }
}

fn arithmetic(reason: String) -> CalcError {
    ExecutionError::Arithmetic { reason }.into()
}

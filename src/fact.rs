//! Immutable computed results.
//!
//! A [`Fact`] is written once and never updated. Its identifier is derived
//! from the parameter tuple that produced it, so recomputing the same tuple
//! addresses the same fact.

use std::fmt;

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::decimal::{Quantity, RoundingPolicy};
use crate::error::ValidationError;
use crate::request::InputsHash;
use crate::rule::{RuleVersionRef, Topic};
use crate::ruleset::RulesetId;
use crate::scenario::ScenarioId;

/// Namespace for deterministic fact identifiers.
const FACT_NAMESPACE: Uuid = Uuid::from_u128(0x3c1f_9a52_7d0e_4b8c_a6e1_52f0_8d4b_19c7);

/// Largest page a fact query may request.
pub const MAX_PAGE_SIZE: usize = 1000;

/// Default page size.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Maximum length of a topic pattern.
pub const MAX_PATTERN_LEN: usize = 256;

/// Deterministic fact identifier (UUIDv5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FactId(pub Uuid);

impl FactId {
    /// Derives the identifier for a parameter tuple.
    #[must_use]
    pub fn derive(
        ruleset_id: &RulesetId,
        as_of: NaiveDate,
        scenario_id: &ScenarioId,
        inputs_hash: &InputsHash,
        topic: &Topic,
    ) -> Self {
        let name = format!("{ruleset_id}\u{1f}{as_of}\u{1f}{scenario_id}\u{1f}{inputs_hash}\u{1f}{topic}");
        Self(Uuid::new_v5(&FACT_NAMESPACE, name.as_bytes()))
    }
}

impl fmt::Display for FactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for FactId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| ValidationError::InvalidQuery {
                reason: format!("'{s}' is not a fact id: {e}"),
            })
    }
}

/// One rounding applied while computing a fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundingStep {
    /// Rule whose policy applied.
    pub rule: RuleVersionRef,
    /// Amount before rounding.
    pub before: String,
    /// Amount after rounding.
    pub after: String,
    /// Policy applied.
    pub policy: RoundingPolicy,
}

impl RoundingStep {
    pub(crate) fn new(rule: RuleVersionRef, before: &BigDecimal, after: &BigDecimal, policy: RoundingPolicy) -> Self {
        Self {
            rule,
            before: before.to_string(),
            after: after.to_string(),
            policy,
        }
    }
}

/// An immutable computed value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fact {
    /// Deterministic identifier.
    pub id: FactId,
    /// Topic computed.
    pub topic: Topic,
    /// Value and unit.
    pub value: Quantity,
    /// Ruleset used.
    pub ruleset_id: RulesetId,
    /// Evaluation date.
    pub as_of: NaiveDate,
    /// Scenario the fact belongs to.
    pub scenario_id: ScenarioId,
    /// Hash of the client data.
    pub inputs_hash: InputsHash,
    /// Contributing rule versions (never empty).
    pub rules: Vec<RuleVersionRef>,
    /// Rounding applied, in order.
    #[serde(default)]
    pub rounding_steps: Vec<RoundingStep>,
    /// When the fact was first written.
    pub created_at: DateTime<Utc>,
}

impl Fact {
    /// Validates the invariants every stored fact must satisfy.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::MissingField` if no contributing rule is
    /// recorded, or `InvalidQuery` if the id does not match the tuple.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.rules.is_empty() {
            return Err(ValidationError::MissingField {
                field: "fact.rules".to_string(),
            });
        }
        let expected = FactId::derive(
            &self.ruleset_id,
            self.as_of,
            &self.scenario_id,
            &self.inputs_hash,
            &self.topic,
        );
        if expected != self.id {
            return Err(ValidationError::InvalidQuery {
                reason: format!("fact id {} does not match its parameters", self.id),
            });
        }
        Ok(())
    }

    /// Compares everything except `created_at`, using exact decimal text.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.id == other.id
            && self.topic == other.topic
            && self.value.unit == other.value.unit
            && self.value.amount_string() == other.value.amount_string()
            && self.ruleset_id == other.ruleset_id
            && self.as_of == other.as_of
            && self.scenario_id == other.scenario_id
            && self.inputs_hash == other.inputs_hash
            && self.rules == other.rules
            && self.rounding_steps == other.rounding_steps
    }
}

/// Filters for fact retrieval.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactQuery {
    /// Restrict to one scenario.
    pub scenario_id: Option<ScenarioId>,
    /// Restrict to one ruleset.
    pub ruleset_id: Option<RulesetId>,
    /// Exact topic.
    pub topic: Option<Topic>,
    /// Regex over the topic name (full match).
    pub topic_pattern: Option<String>,
    /// Earliest `as_of` (inclusive).
    pub as_of_from: Option<NaiveDate>,
    /// Latest `as_of` (inclusive).
    pub as_of_to: Option<NaiveDate>,
    /// Results to skip.
    pub offset: usize,
    /// Page size; 0 means [`DEFAULT_PAGE_SIZE`].
    pub limit: usize,
}

impl FactQuery {
    /// Query for one scenario.
    #[must_use]
    pub fn scenario(scenario_id: ScenarioId) -> Self {
        Self {
            scenario_id: Some(scenario_id),
            ..Self::default()
        }
    }

    /// Restricts to one ruleset.
    #[must_use]
    pub fn ruleset(mut self, ruleset_id: RulesetId) -> Self {
        self.ruleset_id = Some(ruleset_id);
        self
    }

    /// Restricts to one topic.
    #[must_use]
    pub fn topic(mut self, topic: impl Into<Topic>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Restricts to topics matching a regex.
    #[must_use]
    pub fn topic_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.topic_pattern = Some(pattern.into());
        self
    }

    /// Restricts `as_of` to an inclusive date range.
    #[must_use]
    pub fn as_of_between(mut self, from: Option<NaiveDate>, to: Option<NaiveDate>) -> Self {
        self.as_of_from = from;
        self.as_of_to = to;
        self
    }

    /// Sets pagination.
    #[must_use]
    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = limit;
        self
    }

    /// Effective page size.
    #[must_use]
    pub fn effective_limit(&self) -> usize {
        if self.limit == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            self.limit
        }
    }

    /// Validates bounds and compiles the topic pattern.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidQuery` for an inverted date range, an
    /// oversized page, or an invalid pattern.
    pub fn compile(&self) -> Result<FactMatcher<'_>, ValidationError> {
        if let (Some(from), Some(to)) = (self.as_of_from, self.as_of_to) {
            if from > to {
                return Err(ValidationError::InvalidQuery {
                    reason: format!("as_of_from {from} is after as_of_to {to}"),
                });
            }
        }
        if self.limit > MAX_PAGE_SIZE {
            return Err(ValidationError::InvalidQuery {
                reason: format!("limit {} exceeds {MAX_PAGE_SIZE}", self.limit),
            });
        }
        let pattern = match &self.topic_pattern {
            Some(p) if p.len() > MAX_PATTERN_LEN => {
                return Err(ValidationError::InvalidQuery {
                    reason: format!("topic pattern exceeds {MAX_PATTERN_LEN} characters"),
                });
            }
            Some(p) => Some(Regex::new(&format!("^(?:{p})$")).map_err(|e| ValidationError::InvalidQuery {
                reason: format!("invalid topic pattern: {e}"),
            })?),
            None => None,
        };
        Ok(FactMatcher { query: self, pattern })
    }
}

/// A validated [`FactQuery`] with its pattern compiled.
#[derive(Debug)]
pub struct FactMatcher<'a> {
    query: &'a FactQuery,
    pattern: Option<Regex>,
}

impl FactMatcher<'_> {
    /// Returns true if the fact passes every filter.
    #[must_use]
    pub fn matches(&self, fact: &Fact) -> bool {
        let q = self.query;
        q.scenario_id.as_ref().map_or(true, |s| *s == fact.scenario_id)
            && q.ruleset_id.as_ref().map_or(true, |r| *r == fact.ruleset_id)
            && q.topic.as_ref().map_or(true, |t| *t == fact.topic)
            && q.as_of_from.map_or(true, |from| fact.as_of >= from)
            && q.as_of_to.map_or(true, |to| fact.as_of <= to)
            && self
                .pattern
                .as_ref()
                .map_or(true, |re| re.is_match(fact.topic.as_str()))
    }

    /// Sorts matches deterministically and cuts the requested page.
    #[must_use]
    pub fn paginate(&self, mut matches: Vec<Fact>) -> FactPage {
        matches.sort_by(|a, b| {
            a.as_of
                .cmp(&b.as_of)
                .then_with(|| a.topic.cmp(&b.topic))
                .then_with(|| a.id.cmp(&b.id))
        });
        let total = matches.len();
        let limit = self.query.effective_limit();
        let offset = self.query.offset;
        let facts: Vec<Fact> = matches.into_iter().skip(offset).take(limit).collect();
        let end = offset.saturating_add(facts.len());
        FactPage {
            facts,
            total,
            offset,
            limit,
            next_offset: (end < total).then_some(end),
        }
    }
}

/// One page of query results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactPage {
    /// Facts in `(as_of, topic, id)` order.
    pub facts: Vec<Fact>,
    /// Total matches across all pages.
    pub total: usize,
    /// Offset of this page.
    pub offset: usize,
    /// Page size used.
    pub limit: usize,
    /// Offset of the next page, if any.
    pub next_offset: Option<usize>,
}

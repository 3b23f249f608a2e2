//! Versioned calculation rules.
//!
//! A [`Rule`] produces exactly one topic. Rules are immutable: a change is a
//! new version with its own effective window and content hash, published in
//! a new ruleset snapshot.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::decimal::{RoundingPolicy, Unit};
use crate::digest::{digest_json, RULE_DOMAIN};
use crate::error::{CalcError, ValidationError};
use crate::expr::Expr;
use crate::reference::{validate_identifier, MAX_ID_LEN};
use crate::time::EffectiveWindow;

/// Computation key produced by a rule, e.g. `pit.income_tax`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Creates a topic.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the topic name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Validates the topic name: lowercase ascii, digits, `.`, `_` and `-`.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidTopic` otherwise.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let ok = !self.0.is_empty()
            && self.0.len() <= MAX_ID_LEN
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'));
        if ok {
            Ok(())
        } else {
            Err(ValidationError::InvalidTopic { value: self.0.clone() })
        }
    }
}

impl From<&str> for Topic {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Topic {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Precedence tier of a rule's authority.
///
/// `Statute > Regulation > Ruling > Guidance > Assumption`. The order is
/// closed; there is no way to register another tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecedenceTier {
    Statute,
    Regulation,
    Ruling,
    Guidance,
    Assumption,
}

impl PrecedenceTier {
    /// Numeric rank; higher wins.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Statute => 4,
            Self::Regulation => 3,
            Self::Ruling => 2,
            Self::Guidance => 1,
            Self::Assumption => 0,
        }
    }

    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Statute => "statute",
            Self::Regulation => "regulation",
            Self::Ruling => "ruling",
            Self::Guidance => "guidance",
            Self::Assumption => "assumption",
        }
    }
}

impl PartialOrd for PrecedenceTier {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PrecedenceTier {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl fmt::Display for PrecedenceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one version of one rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleVersionRef {
    /// Rule identifier.
    pub rule_id: String,
    /// Rule version.
    pub version: u32,
}

impl RuleVersionRef {
    /// Creates a reference.
    #[must_use]
    pub fn new(rule_id: impl Into<String>, version: u32) -> Self {
        Self {
            rule_id: rule_id.into(),
            version,
        }
    }
}

impl fmt::Display for RuleVersionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.rule_id, self.version)
    }
}

/// A cited reference with its pinpoint locator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Citation {
    /// Reference identifier.
    pub reference_id: String,
    /// Section, schedule or paragraph.
    pub pinpoint: String,
}

impl Citation {
    /// Creates a citation.
    #[must_use]
    pub fn new(reference_id: impl Into<String>, pinpoint: impl Into<String>) -> Self {
        Self {
            reference_id: reference_id.into(),
            pinpoint: pinpoint.into(),
        }
    }
}

/// A versioned calculation rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Stable identifier shared by all versions.
    pub id: String,
    /// Version number (starts at 1).
    pub version: u32,
    /// Topic this rule produces.
    pub topic: Topic,
    /// Authority tier.
    pub tier: PrecedenceTier,
    /// When this version is in force.
    pub window: EffectiveWindow,
    /// Calculation.
    pub expression: Expr,
    /// Unit of the result.
    pub unit: Unit,
    /// Rounding applied to the result.
    #[serde(default)]
    pub rounding: RoundingPolicy,
    /// References this rule implements.
    #[serde(default)]
    pub citations: Vec<Citation>,
    /// Assumption keys the expression may read.
    #[serde(default)]
    pub assumptions: Vec<String>,
    /// Free-text description.
    #[serde(default)]
    pub description: Option<String>,
    /// Declared blake3 hash over all other fields. Empty until sealed.
    #[serde(default)]
    pub content_hash: String,
}

#[derive(Serialize)]
struct RuleContent<'a> {
    id: &'a str,
    version: u32,
    topic: &'a Topic,
    tier: PrecedenceTier,
    window: &'a EffectiveWindow,
    expression: &'a Expr,
    unit: Unit,
    rounding: &'a RoundingPolicy,
    citations: &'a [Citation],
    assumptions: &'a [String],
    description: Option<&'a str>,
}

impl Rule {
    /// Creates a new rule builder.
    #[must_use]
    pub fn builder() -> RuleBuilder {
        RuleBuilder::new()
    }

    /// Reference to this version.
    #[must_use]
    pub fn version_ref(&self) -> RuleVersionRef {
        RuleVersionRef::new(self.id.clone(), self.version)
    }

    /// Topics this rule depends on.
    #[must_use]
    pub fn dependencies(&self) -> BTreeSet<Topic> {
        self.expression.topics()
    }

    /// Computes the content hash from the current fields.
    ///
    /// # Errors
    ///
    /// Returns `CalcError::Internal` if serialization fails.
    pub fn compute_content_hash(&self) -> Result<String, CalcError> {
        let content = RuleContent {
            id: &self.id,
            version: self.version,
            topic: &self.topic,
            tier: self.tier,
            window: &self.window,
            expression: &self.expression,
            unit: self.unit,
            rounding: &self.rounding,
            citations: &self.citations,
            assumptions: &self.assumptions,
            description: self.description.as_deref(),
        };
        digest_json(RULE_DOMAIN, &content)
    }

    /// Returns true if the declared hash matches the content.
    ///
    /// # Errors
    ///
    /// Returns `CalcError::Internal` if serialization fails.
    pub fn hash_matches(&self) -> Result<bool, CalcError> {
        Ok(self.compute_content_hash()? == self.content_hash)
    }

    /// Structural checks that need no store access.
    ///
    /// # Errors
    ///
    /// Returns the first `ValidationError` found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_identifier("rule.id", &self.id)?;
        let invalid = |reason: String| ValidationError::InvalidRule {
            rule: self.version_ref().to_string(),
            reason,
        };
        if self.version == 0 {
            return Err(invalid("version must start at 1".to_string()));
        }
        self.topic.validate()?;
        self.window.validate()?;
        self.rounding.validate()?;
        if let Some(issue) = self.expression.structural_issue() {
            return Err(invalid(issue));
        }
        if self.dependencies().contains(&self.topic) {
            return Err(invalid("rule reads its own topic".to_string()));
        }
        Ok(())
    }
}

/// Builder for creating rules.
#[derive(Debug, Default)]
pub struct RuleBuilder {
    id: Option<String>,
    version: Option<u32>,
    topic: Option<Topic>,
    tier: Option<PrecedenceTier>,
    window: Option<EffectiveWindow>,
    expression: Option<Expr>,
    unit: Option<Unit>,
    rounding: Option<RoundingPolicy>,
    citations: Vec<Citation>,
    assumptions: Vec<String>,
    description: Option<String>,
}

impl RuleBuilder {
    /// Creates a new rule builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the rule id and version.
    #[must_use]
    pub fn id(mut self, id: impl Into<String>, version: u32) -> Self {
        self.id = Some(id.into());
        self.version = Some(version);
        self
    }

    /// Sets the produced topic.
    #[must_use]
    pub fn topic(mut self, topic: impl Into<Topic>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Sets the precedence tier.
    #[must_use]
    pub fn tier(mut self, tier: PrecedenceTier) -> Self {
        self.tier = Some(tier);
        self
    }

    /// Sets the effective window.
    #[must_use]
    pub fn window(mut self, window: EffectiveWindow) -> Self {
        self.window = Some(window);
        self
    }

    /// Sets the expression.
    #[must_use]
    pub fn expression(mut self, expression: Expr) -> Self {
        self.expression = Some(expression);
        self
    }

    /// Sets the output unit.
    #[must_use]
    pub fn unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Sets the rounding policy (defaults to cents, half-up, final).
    #[must_use]
    pub fn rounding(mut self, rounding: RoundingPolicy) -> Self {
        self.rounding = Some(rounding);
        self
    }

    /// Adds a citation.
    #[must_use]
    pub fn cite(mut self, reference_id: impl Into<String>, pinpoint: impl Into<String>) -> Self {
        self.citations.push(Citation::new(reference_id, pinpoint));
        self
    }

    /// Declares an assumption key.
    #[must_use]
    pub fn assumption(mut self, key: impl Into<String>) -> Self {
        self.assumptions.push(key.into());
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Builds the rule, computing its content hash.
    ///
    /// # Errors
    ///
    /// Returns a `CalcError::Validation` if a required field is missing or
    /// the rule is structurally invalid.
    pub fn build(self) -> Result<Rule, CalcError> {
        let missing = |field: &str| ValidationError::MissingField {
            field: field.to_string(),
        };
        let mut rule = Rule {
            id: self.id.ok_or_else(|| missing("id"))?,
            version: self.version.ok_or_else(|| missing("version"))?,
            topic: self.topic.ok_or_else(|| missing("topic"))?,
            tier: self.tier.ok_or_else(|| missing("tier"))?,
            window: self.window.ok_or_else(|| missing("window"))?,
            expression: self.expression.ok_or_else(|| missing("expression"))?,
            unit: self.unit.ok_or_else(|| missing("unit"))?,
            rounding: self.rounding.unwrap_or_default(),
            citations: self.citations,
            assumptions: self.assumptions,
            description: self.description,
            content_hash: String::new(),
        };
        rule.validate()?;
        rule.content_hash = rule.compute_content_hash()?;
        Ok(rule)
    }
}

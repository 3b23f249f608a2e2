//! Authoritative references and versioned assumptions.
//!
//! Both are read-only to the engine: they are loaded into a [`RuleStore`]
//! ahead of time and selected by `as_of` at calculation time.
//!
//! [`RuleStore`]: crate::storage::RuleStore

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::decimal::{range_issue, Quantity};
use crate::error::{ExecutionError, ValidationError};
use crate::time::EffectiveWindow;

/// Maximum length of identifiers and keys.
pub const MAX_ID_LEN: usize = 128;

pub(crate) fn validate_identifier(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField {
            field: field.to_string(),
        });
    }
    if value.len() > MAX_ID_LEN {
        return Err(ValidationError::FieldTooLong {
            field: field.to_string(),
            max_length: MAX_ID_LEN,
        });
    }
    Ok(())
}

/// A versioned authoritative source (an Act, a ruling, published guidance).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    /// Stable identifier, e.g. `ITAA1997`.
    pub id: String,
    /// Version of the document.
    pub version: u32,
    /// Title.
    pub title: String,
    /// Publishing body.
    #[serde(default)]
    pub publisher: Option<String>,
    /// Pinpoint locators that rules may cite (sections, schedules).
    /// Empty means any pinpoint is accepted.
    #[serde(default)]
    pub pinpoints: Vec<String>,
    /// When this version is in force.
    pub window: EffectiveWindow,
}

impl Reference {
    /// Creates a reference version.
    #[must_use]
    pub fn new(id: impl Into<String>, version: u32, title: impl Into<String>, window: EffectiveWindow) -> Self {
        Self {
            id: id.into(),
            version,
            title: title.into(),
            publisher: None,
            pinpoints: Vec::new(),
            window,
        }
    }

    /// Sets the publisher.
    #[must_use]
    pub fn with_publisher(mut self, publisher: impl Into<String>) -> Self {
        self.publisher = Some(publisher.into());
        self
    }

    /// Adds a pinpoint locator.
    #[must_use]
    pub fn with_pinpoint(mut self, pinpoint: impl Into<String>) -> Self {
        self.pinpoints.push(pinpoint.into());
        self
    }

    /// Returns true if this version lists `pinpoint` (or lists none).
    #[must_use]
    pub fn has_pinpoint(&self, pinpoint: &str) -> bool {
        self.pinpoints.is_empty() || self.pinpoints.iter().any(|p| p == pinpoint)
    }

    /// Validates the record.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` for empty ids, titles, version 0 or an empty window.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_identifier("reference.id", &self.id)?;
        if self.title.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "reference.title".to_string(),
            });
        }
        if self.version == 0 {
            return Err(ValidationError::MissingField {
                field: "reference.version".to_string(),
            });
        }
        self.window.validate()
    }
}

/// One band of a progressive schedule: income above `threshold` up to the
/// next band's threshold is taxed at `rate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bracket {
    /// Lower bound of the band.
    pub threshold: Quantity,
    /// Marginal rate applied within the band.
    pub rate: Quantity,
}

impl Bracket {
    /// Creates a bracket.
    #[must_use]
    pub const fn new(threshold: Quantity, rate: Quantity) -> Self {
        Self { threshold, rate }
    }
}

/// A marginal bracket schedule (income tax scales and the like).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BracketSchedule {
    /// Bands ordered by ascending threshold.
    pub brackets: Vec<Bracket>,
}

impl BracketSchedule {
    /// Creates a schedule.
    #[must_use]
    pub const fn new(brackets: Vec<Bracket>) -> Self {
        Self { brackets }
    }

    /// Validates ordering and units.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidAssumption` on an empty schedule,
    /// unordered or mixed-unit thresholds, negative thresholds, or rates that
    /// are not scaling units.
    pub fn validate(&self, key: &str) -> Result<(), ValidationError> {
        let invalid = |reason: String| ValidationError::InvalidAssumption {
            key: key.to_string(),
            reason,
        };
        let Some(first) = self.brackets.first() else {
            return Err(invalid("schedule has no brackets".to_string()));
        };
        if first.threshold.is_negative() {
            return Err(invalid("first threshold is negative".to_string()));
        }
        for pair in self.brackets.windows(2) {
            if pair[0].threshold.unit != pair[1].threshold.unit {
                return Err(invalid("thresholds use different units".to_string()));
            }
            if pair[0].threshold.amount >= pair[1].threshold.amount {
                return Err(invalid(format!(
                    "threshold {} does not increase",
                    pair[1].threshold.amount
                )));
            }
        }
        if let Some(bad) = self.brackets.iter().find(|b| !b.rate.unit.is_scaling()) {
            return Err(invalid(format!("rate unit {} cannot scale an amount", bad.rate.unit)));
        }
        for bracket in &self.brackets {
            for value in [&bracket.threshold, &bracket.rate] {
                if let Some(reason) = range_issue(&value.amount) {
                    return Err(invalid(reason));
                }
            }
        }
        Ok(())
    }

    /// Applies the schedule marginally to `base`.
    ///
    /// # Errors
    ///
    /// `UnitMismatch` if `base` and the thresholds differ in unit.
    pub fn apply(&self, base: &Quantity) -> Result<Quantity, ExecutionError> {
        let mut total = Quantity::zero(base.unit);
        for (idx, bracket) in self.brackets.iter().enumerate() {
            if base.compare(&bracket.threshold)? != Ordering::Greater {
                break;
            }
            let top = match self.brackets.get(idx + 1) {
                Some(next) => base.min(&next.threshold)?,
                None => base.clone(),
            };
            let band = top.sub(&bracket.threshold)?;
            total = total.add(&band.mul(&bracket.rate)?)?;
        }
        Ok(total)
    }
}

/// Value of an assumption version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssumptionValue {
    /// A single quantity (a rate, a cap, a threshold).
    Scalar(Quantity),
    /// A progressive bracket schedule.
    Schedule(BracketSchedule),
}

/// A versioned parameter selected by `as_of`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assumption {
    /// Key referenced by rules, e.g. `medicare.rate`.
    pub key: String,
    /// Version of the parameter.
    pub version: u32,
    /// The value.
    pub value: AssumptionValue,
    /// When this version is in force.
    pub window: EffectiveWindow,
    /// Reference the value is taken from, if any.
    #[serde(default)]
    pub source_reference: Option<String>,
    /// Free-text description.
    #[serde(default)]
    pub description: Option<String>,
}

impl Assumption {
    /// Creates a scalar assumption.
    #[must_use]
    pub fn scalar(key: impl Into<String>, version: u32, value: Quantity, window: EffectiveWindow) -> Self {
        Self {
            key: key.into(),
            version,
            value: AssumptionValue::Scalar(value),
            window,
            source_reference: None,
            description: None,
        }
    }

    /// Creates a schedule assumption.
    #[must_use]
    pub fn schedule(
        key: impl Into<String>,
        version: u32,
        schedule: BracketSchedule,
        window: EffectiveWindow,
    ) -> Self {
        Self {
            key: key.into(),
            version,
            value: AssumptionValue::Schedule(schedule),
            window,
            source_reference: None,
            description: None,
        }
    }

    /// Records the reference this value comes from.
    #[must_use]
    pub fn with_source(mut self, reference_id: impl Into<String>) -> Self {
        self.source_reference = Some(reference_id.into());
        self
    }

    /// Returns the scalar value, or `None` for schedules.
    #[must_use]
    pub const fn as_scalar(&self) -> Option<&Quantity> {
        match &self.value {
            AssumptionValue::Scalar(q) => Some(q),
            AssumptionValue::Schedule(_) => None,
        }
    }

    /// Returns the schedule, or `None` for scalars.
    #[must_use]
    pub const fn as_schedule(&self) -> Option<&BracketSchedule> {
        match &self.value {
            AssumptionValue::Schedule(s) => Some(s),
            AssumptionValue::Scalar(_) => None,
        }
    }

    /// Validates the record.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` for an empty key, version 0, an empty
    /// window or a malformed schedule.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_identifier("assumption.key", &self.key)?;
        if self.version == 0 {
            return Err(ValidationError::MissingField {
                field: "assumption.version".to_string(),
            });
        }
        self.window.validate()?;
        match &self.value {
            AssumptionValue::Schedule(schedule) => schedule.validate(&self.key)?,
            AssumptionValue::Scalar(value) => {
                if let Some(reason) = range_issue(&value.amount) {
                    return Err(ValidationError::InvalidAssumption {
                        key: self.key.clone(),
                        reason,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Exact assumption version used by a calculation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssumptionRef {
    /// Assumption key.
    pub key: String,
    /// Version used.
    pub version: u32,
}

impl std::fmt::Display for AssumptionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@v{}", self.key, self.version)
    }
}

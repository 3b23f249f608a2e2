//! Calculation requests.
//!
//! A request names every parameter explicitly: client data, ruleset, `as_of`
//! date and scenario. None of them has a default.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::decimal::{range_issue, Quantity};
use crate::digest::{digest_json, INPUTS_DOMAIN, REQUEST_DOMAIN};
use crate::error::{CalcError, ValidationError};
use crate::fact::FactId;
use crate::reference::validate_identifier;
use crate::rule::Topic;
use crate::ruleset::RulesetId;
use crate::scenario::ScenarioId;

/// Maximum number of client data fields per request.
pub const MAX_CLIENT_FIELDS: usize = 512;

/// Structured client data: named quantities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientData {
    fields: BTreeMap<String, Quantity>,
}

impl ClientData {
    /// Creates empty client data.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: Quantity) -> Self {
        self.fields.insert(field.into(), value);
        self
    }

    /// Inserts or replaces a field.
    pub fn insert(&mut self, field: impl Into<String>, value: Quantity) {
        self.fields.insert(field.into(), value);
    }

    /// Looks up a field.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Quantity> {
        self.fields.get(field)
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if there are no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Field names in sorted order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Stable hash of the client data.
    ///
    /// # Errors
    ///
    /// Returns `CalcError::Internal` if serialization fails.
    pub fn inputs_hash(&self) -> Result<InputsHash, CalcError> {
        Ok(InputsHash(digest_json(INPUTS_DOMAIN, &self.fields)?))
    }
}

/// Hex blake3 digest of a request's client data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputsHash(String);

impl InputsHash {
    /// Returns the hex string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InputsHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key that makes `run` safe to retry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Creates a caller-supplied key.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of a completed `run`, recorded under its idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// The key the run was submitted under.
    pub key: IdempotencyKey,
    /// Fingerprint of the request that used the key.
    pub fingerprint: IdempotencyKey,
    /// Facts returned by the run, in dependency order.
    pub fact_ids: Vec<FactId>,
    /// When the run completed.
    pub recorded_at: DateTime<Utc>,
}

/// A single calculation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalculationRequest {
    /// Client data.
    pub client_data: ClientData,
    /// Ruleset to calculate against.
    pub ruleset_id: RulesetId,
    /// Date the calculation is evaluated at.
    pub as_of: NaiveDate,
    /// Scenario the resulting facts belong to.
    pub scenario_id: ScenarioId,
    /// Topics to compute; empty means every topic in force at `as_of`.
    #[serde(default)]
    pub targets: Vec<Topic>,
    /// Caller-supplied idempotency key.
    #[serde(default)]
    pub idempotency_key: Option<IdempotencyKey>,
}

#[derive(Serialize)]
struct RequestFingerprint<'a> {
    client_data: &'a ClientData,
    ruleset_id: &'a RulesetId,
    as_of: NaiveDate,
    scenario_id: &'a ScenarioId,
    targets: Vec<&'a Topic>,
}

impl CalculationRequest {
    /// Creates a request. All four parameters are mandatory.
    #[must_use]
    pub fn new(client_data: ClientData, ruleset_id: RulesetId, as_of: NaiveDate, scenario_id: ScenarioId) -> Self {
        Self {
            client_data,
            ruleset_id,
            as_of,
            scenario_id,
            targets: Vec::new(),
            idempotency_key: None,
        }
    }

    /// Restricts the calculation to the given topics (and their dependencies).
    #[must_use]
    pub fn with_targets(mut self, targets: impl IntoIterator<Item = impl Into<Topic>>) -> Self {
        self.targets = targets.into_iter().map(Into::into).collect();
        self
    }

    /// Sets a caller-supplied idempotency key.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(IdempotencyKey::new(key));
        self
    }

    /// Hash over every input of the request (targets in sorted order).
    ///
    /// # Errors
    ///
    /// Returns `CalcError::Internal` if serialization fails.
    pub fn fingerprint(&self) -> Result<IdempotencyKey, CalcError> {
        let mut targets: Vec<&Topic> = self.targets.iter().collect();
        targets.sort();
        targets.dedup();
        let fingerprint = RequestFingerprint {
            client_data: &self.client_data,
            ruleset_id: &self.ruleset_id,
            as_of: self.as_of,
            scenario_id: &self.scenario_id,
            targets,
        };
        Ok(IdempotencyKey(digest_json(REQUEST_DOMAIN, &fingerprint)?))
    }

    /// The caller's key, or the fingerprint when none was supplied.
    ///
    /// # Errors
    ///
    /// Returns `CalcError::Internal` if serialization fails.
    pub fn effective_idempotency_key(&self) -> Result<IdempotencyKey, CalcError> {
        match &self.idempotency_key {
            Some(key) => Ok(key.clone()),
            None => self.fingerprint(),
        }
    }

    /// Validates identifiers and sizes.
    ///
    /// # Errors
    ///
    /// Returns the first `ValidationError` found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.ruleset_id.validate()?;
        validate_identifier("scenario_id", self.scenario_id.as_str())?;
        if self.client_data.len() > MAX_CLIENT_FIELDS {
            return Err(ValidationError::FieldTooLong {
                field: "client_data".to_string(),
                max_length: MAX_CLIENT_FIELDS,
            });
        }
        for (field, value) in &self.client_data.fields {
            validate_identifier("client_data field", field)?;
            if let Some(reason) = range_issue(&value.amount) {
                return Err(ValidationError::PrecisionExceeded {
                    field: field.clone(),
                    reason,
                });
            }
        }
        for topic in &self.targets {
            topic.validate()?;
        }
        if let Some(key) = &self.idempotency_key {
            validate_identifier("idempotency_key", key.as_str())?;
        }
        Ok(())
    }
}

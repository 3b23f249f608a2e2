//! Error types for factforge.
//!
//! Errors are layered: input problems are `ValidationError`, concurrency and
//! write-once violations are `ConflictError`, evaluation and runtime failures
//! are `ExecutionError`, and backend failures are `StorageError`. Every error
//! exposes a machine-readable `kind()` and an operator-facing `remediation()`.
//!
//! Messages name rules, topics and keys. They never include rule expressions.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::decimal::Unit;
use crate::storage::StorageError;

/// Validation errors (bad or missing input).
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("Invalid effective window: from ({from}) must be before to ({to})")]
    InvalidTimeRange {
        from: NaiveDate,
        to: NaiveDate,
    },

    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Field '{field}' exceeds maximum length of {max_length}")]
    FieldTooLong {
        field: String,
        max_length: usize,
    },

    #[error("Client data field '{field}' is required but was not supplied")]
    MissingInput {
        field: String,
    },

    #[error("Invalid ruleset id '{value}': expected ruleset-YYYYMMDD with an optional -suffix")]
    InvalidRulesetId {
        value: String,
    },

    #[error("Invalid topic '{value}'")]
    InvalidTopic {
        value: String,
    },

    #[error("Invalid rounding policy: {reason}")]
    InvalidRounding {
        reason: String,
    },

    #[error("Rule {rule} is malformed: {reason}")]
    InvalidRule {
        rule: String,
        reason: String,
    },

    #[error("Reference '{id}' is malformed: {reason}")]
    InvalidReference {
        id: String,
        reason: String,
    },

    #[error("Assumption '{key}' is malformed: {reason}")]
    InvalidAssumption {
        key: String,
        reason: String,
    },

    #[error("Invalid query: {reason}")]
    InvalidQuery {
        reason: String,
    },

    #[error("Value of '{field}' is out of range: {reason}")]
    PrecisionExceeded {
        field: String,
        reason: String,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },

    #[error("Batch of {actual} requests exceeds the synchronous limit of {max}")]
    BatchTooLarge {
        max: usize,
        actual: usize,
    },

    #[error("{resource} not found: {id}")]
    NotFound {
        resource: &'static str,
        id: String,
    },

    #[error("Scenario '{id}' is archived and accepts no new facts")]
    ScenarioArchived {
        id: String,
    },

    #[error("The base scenario cannot be archived")]
    BaseScenarioImmutable,

    #[error("Ruleset {ruleset_id} is {status} and cannot be used for calculation")]
    RulesetNotActive {
        ruleset_id: String,
        status: String,
    },

    #[error("Ruleset {ruleset_id} failed validation with {} issue(s)", .issues.len())]
    RulesetValidationFailed {
        ruleset_id: String,
        issues: Vec<String>,
    },

    #[error("Ruleset {ruleset_id} cannot move from {from} to {to}")]
    InvalidTransition {
        ruleset_id: String,
        from: String,
        to: String,
    },
}

impl ValidationError {
    /// Machine-readable error kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidTimeRange { .. } => "invalid_time_range",
            Self::MissingField { .. } => "missing_field",
            Self::FieldTooLong { .. } => "field_too_long",
            Self::MissingInput { .. } => "missing_input",
            Self::InvalidRulesetId { .. } => "invalid_ruleset_id",
            Self::InvalidTopic { .. } => "invalid_topic",
            Self::InvalidRounding { .. } => "invalid_rounding",
            Self::InvalidRule { .. } => "invalid_rule",
            Self::InvalidReference { .. } => "invalid_reference",
            Self::InvalidAssumption { .. } => "invalid_assumption",
            Self::InvalidQuery { .. } => "invalid_query",
            Self::PrecisionExceeded { .. } => "precision_exceeded",
            Self::InvalidConfig { .. } => "invalid_config",
            Self::BatchTooLarge { .. } => "batch_too_large",
            Self::NotFound { .. } => "not_found",
            Self::ScenarioArchived { .. } => "scenario_archived",
            Self::BaseScenarioImmutable => "base_scenario_immutable",
            Self::RulesetNotActive { .. } => "ruleset_not_active",
            Self::RulesetValidationFailed { .. } => "ruleset_validation_failed",
            Self::InvalidTransition { .. } => "invalid_transition",
        }
    }

    /// Suggested fix for the caller.
    #[must_use]
    pub fn remediation(&self) -> String {
        match self {
            Self::MissingInput { field } => {
                format!("supply client data field '{field}' and resubmit the request")
            }
            Self::PrecisionExceeded { field, .. } => format!(
                "keep '{field}' within {} integer digits and {} decimal places",
                crate::decimal::MAX_INTEGER_DIGITS,
                crate::decimal::MAX_AMOUNT_SCALE
            ),
            Self::BatchTooLarge { .. } => {
                "submit the batch through the job queue and poll its status".to_string()
            }
            Self::RulesetNotActive { ruleset_id, .. } => {
                format!("validate and activate {ruleset_id}, or calculate against the active ruleset")
            }
            Self::RulesetValidationFailed { ruleset_id, .. } => {
                format!("inspect the validation report of {ruleset_id}, fix the artifact and publish a new snapshot")
            }
            Self::ScenarioArchived { .. } => "create a new scenario for further calculations".to_string(),
            Self::NotFound { resource, .. } => format!("check the {resource} identifier"),
            Self::InvalidTransition { .. } => {
                "follow Draft -> Validated -> Active; only superseded snapshots can be rolled back to"
                    .to_string()
            }
            _ => "correct the request and resubmit".to_string(),
        }
    }
}

/// Conflicts with concurrent writers or with existing immutable records.
#[derive(Debug, Clone, Error)]
pub enum ConflictError {
    #[error("{resource} '{id}' changed concurrently: expected version {expected}, found {actual}")]
    VersionConflict {
        resource: &'static str,
        id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Fact {id} already exists and is immutable")]
    FactAlreadyExists {
        id: String,
    },

    #[error("Idempotency key '{key}' was already used for a different request")]
    IdempotencyMismatch {
        key: String,
    },

    #[error("Ruleset {id} has already been published")]
    DuplicateRuleset {
        id: String,
    },

    #[error("Scenario '{id}' already exists")]
    DuplicateScenario {
        id: String,
    },
}

impl ConflictError {
    /// Machine-readable error kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::VersionConflict { .. } => "version_conflict",
            Self::FactAlreadyExists { .. } => "fact_already_exists",
            Self::IdempotencyMismatch { .. } => "idempotency_mismatch",
            Self::DuplicateRuleset { .. } => "duplicate_ruleset",
            Self::DuplicateScenario { .. } => "duplicate_scenario",
        }
    }

    /// Suggested fix for the caller.
    #[must_use]
    pub fn remediation(&self) -> String {
        match self {
            Self::VersionConflict { resource, .. } => {
                format!("reload the {resource} and retry with its current version")
            }
            Self::FactAlreadyExists { .. } => {
                "facts are write-once; compute under a new scenario or ruleset instead".to_string()
            }
            Self::IdempotencyMismatch { .. } => {
                "use a fresh idempotency key for a changed request".to_string()
            }
            Self::DuplicateRuleset { .. } => "publish under a new ruleset id".to_string(),
            Self::DuplicateScenario { .. } => "choose another scenario id".to_string(),
        }
    }
}

/// Execution errors that occur while resolving, evaluating or scheduling work.
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    #[error("Conflicting {tier} rules for topic '{topic}': {}", .rules.join(", "))]
    RuleConflict {
        topic: String,
        tier: String,
        rules: Vec<String>,
    },

    #[error("No rule in force for topic '{topic}' as of {as_of}")]
    MissingRule {
        topic: String,
        as_of: NaiveDate,
    },

    #[error("No version of assumption '{key}' is in force as of {as_of}")]
    MissingAssumption {
        key: String,
        as_of: NaiveDate,
    },

    #[error("Unit mismatch in {operation}: {left} vs {right}")]
    UnitMismatch {
        operation: String,
        left: Unit,
        right: Unit,
    },

    #[error("Calculation failed: {reason}")]
    Arithmetic {
        reason: String,
    },

    #[error("Value exceeds precision limits: {reason}")]
    PrecisionExceeded {
        reason: String,
    },

    #[error("Topic dependency cycle: {}", .topics.join(" -> "))]
    DependencyCycle {
        topics: Vec<String>,
    },

    #[error("Provenance of fact {fact_id} is deeper than {max_depth} hops")]
    ProvenanceDepthExceeded {
        fact_id: String,
        max_depth: usize,
    },

    #[error("Provenance node {node} does not resolve")]
    DanglingProvenance {
        node: String,
    },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Job queue is full (capacity {capacity})")]
    QueueFull {
        capacity: usize,
    },

    #[error("Job queue is shut down")]
    Disconnected,

    #[error("{operation} failed after {attempts} attempt(s): {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },
}

impl ExecutionError {
    /// Machine-readable error kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RuleConflict { .. } => "rule_conflict",
            Self::MissingRule { .. } => "missing_rule",
            Self::MissingAssumption { .. } => "missing_assumption",
            Self::UnitMismatch { .. } => "unit_mismatch",
            Self::Arithmetic { .. } => "execution_error",
            Self::PrecisionExceeded { .. } => "precision_exceeded",
            Self::DependencyCycle { .. } => "dependency_cycle",
            Self::ProvenanceDepthExceeded { .. } => "provenance_depth_exceeded",
            Self::DanglingProvenance { .. } => "dangling_provenance",
            Self::Timeout { .. } => "timeout",
            Self::QueueFull { .. } => "queue_full",
            Self::Disconnected => "disconnected",
            Self::RetriesExhausted { .. } => "retries_exhausted",
        }
    }

    /// Suggested fix for the operator.
    #[must_use]
    pub fn remediation(&self) -> String {
        match self {
            Self::RuleConflict { topic, .. } => format!(
                "close the effective window of all but one rule for '{topic}' in a new ruleset snapshot"
            ),
            Self::MissingRule { topic, as_of } => {
                format!("publish a rule for '{topic}' effective on {as_of}, or change the as_of date")
            }
            Self::MissingAssumption { key, as_of } => {
                format!("add a version of assumption '{key}' effective on {as_of}")
            }
            Self::UnitMismatch { .. } => {
                "check the units of the client data and of the rule inputs".to_string()
            }
            Self::Arithmetic { .. } | Self::PrecisionExceeded { .. } => {
                "check the client data for out-of-range values".to_string()
            }
            Self::DependencyCycle { .. } => {
                "break the cycle between topics in the ruleset artifact".to_string()
            }
            Self::ProvenanceDepthExceeded { .. } => {
                "flatten the topic dependency chain of the ruleset".to_string()
            }
            Self::DanglingProvenance { .. } => {
                "restore the missing reference, assumption or ruleset in the store".to_string()
            }
            Self::Timeout { .. } => "split the batch or raise the job timeout".to_string(),
            Self::QueueFull { .. } => "retry later with backoff".to_string(),
            Self::Disconnected => "restart the job queue".to_string(),
            Self::RetriesExhausted { .. } => {
                "inspect the dead-letter queue and the backing store health".to_string()
            }
        }
    }
}

/// Top-level error type for factforge.
#[derive(Debug, Clone, Error)]
pub enum CalcError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Conflict: {0}")]
    Conflict(#[from] ConflictError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl CalcError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Machine-readable error kind (snake case).
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Validation(e) => e.kind(),
            Self::Conflict(e) => e.kind(),
            Self::Execution(e) => e.kind(),
            Self::Storage(e) => e.kind(),
            Self::Internal { .. } => "internal",
        }
    }

    /// Suggested fix.
    #[must_use]
    pub fn remediation(&self) -> String {
        match self {
            Self::Validation(e) => e.remediation(),
            Self::Conflict(e) => e.remediation(),
            Self::Execution(e) => e.remediation(),
            Self::Storage(e) => e.remediation(),
            Self::Internal { .. } => "report the failure with its context".to_string(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Internal { .. } => false,
            Self::Conflict(e) => matches!(e, ConflictError::VersionConflict { .. }),
            Self::Execution(e) => matches!(
                e,
                ExecutionError::Timeout { .. } | ExecutionError::QueueFull { .. }
            ),
            Self::Storage(e) => e.is_transient(),
        }
    }

    /// Serializable summary used in batch results and job records.
    #[must_use]
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind().to_string(),
            message: self.to_string(),
            remediation: self.remediation(),
            retryable: self.is_retryable(),
        }
    }
}

impl From<serde_json::Error> for CalcError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("serialization failed: {err}"))
    }
}

/// Flattened error description for callers that cannot hold a `CalcError`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Machine-readable kind.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Suggested fix.
    pub remediation: String,
    /// Whether retrying may succeed.
    pub retryable: bool,
}

/// Result type alias for factforge operations.
pub type CalcResult<T> = Result<T, CalcError>;

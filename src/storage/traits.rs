//! Abstract storage traits for factforge.
//!
//! These traits define the contract that storage backends must implement.
//! Facts and provenance edges are append-only: no trait here exposes an
//! update or delete for them. Scenarios and the ruleset registry are
//! mutable only through optimistic-concurrency writes.

use chrono::NaiveDate;
use thiserror::Error;

use crate::fact::{Fact, FactId, FactPage, FactQuery};
use crate::provenance::{NodeRef, ProvenanceEdge};
use crate::reference::{Assumption, Reference};
use crate::request::{IdempotencyKey, IdempotencyRecord};
use crate::ruleset::{RulesetId, RulesetSnapshot};
use crate::scenario::{Scenario, ScenarioId};

/// Errors that can occur during storage operations.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// Record not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Optimistic concurrency check failed.
    #[error("Version conflict on {key}: expected {expected}, found {actual}")]
    VersionConflict {
        /// Record key.
        key: String,
        /// Version the writer expected.
        expected: u64,
        /// Version currently stored.
        actual: u64,
    },

    /// The backend did not answer in time.
    #[error("Storage timeout: {0}")]
    Timeout(String),

    /// The backend is temporarily unreachable.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The query itself is malformed.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),
}

impl StorageError {
    /// Returns true for failures worth retrying with backoff.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Unavailable(_))
    }

    /// Machine-readable error kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "storage_not_found",
            Self::DuplicateKey(_) => "duplicate_key",
            Self::VersionConflict { .. } => "storage_version_conflict",
            Self::Timeout(_) => "storage_timeout",
            Self::Unavailable(_) => "storage_unavailable",
            Self::BackendError(_) => "storage_backend",
            Self::SerializationError(_) => "storage_serialization",
            Self::InvalidQuery(_) => "invalid_query",
        }
    }

    /// Suggested fix for the operator.
    #[must_use]
    pub fn remediation(&self) -> String {
        match self {
            Self::Timeout(_) | Self::Unavailable(_) => "retry later; check backend health".to_string(),
            Self::VersionConflict { .. } => "reload the record and retry".to_string(),
            Self::InvalidQuery(_) => "correct the query filters".to_string(),
            _ => "inspect the storage backend logs".to_string(),
        }
    }
}

/// Read-only access to versioned references and assumptions.
///
/// # Bitemporal Semantics
/// Each id/key has non-overlapping versions; `*_at` returns the version whose
/// effective window contains `as_of`.
pub trait RuleStore: Send + Sync {
    /// Reference version in force at `as_of`.
    fn reference_at(&self, id: &str, as_of: NaiveDate) -> Result<Option<Reference>, StorageError>;

    /// Exact reference version.
    fn reference_version(&self, id: &str, version: u32) -> Result<Option<Reference>, StorageError>;

    /// All versions of a reference (ascending by version).
    fn reference_versions(&self, id: &str) -> Result<Vec<Reference>, StorageError>;

    /// Assumption version in force at `as_of`.
    fn assumption_at(&self, key: &str, as_of: NaiveDate) -> Result<Option<Assumption>, StorageError>;

    /// Exact assumption version.
    fn assumption_version(&self, key: &str, version: u32) -> Result<Option<Assumption>, StorageError>;

    /// All versions of an assumption (ascending by version).
    fn assumption_versions(&self, key: &str) -> Result<Vec<Assumption>, StorageError>;
}

/// Registry of ruleset snapshots.
///
/// Every mutation bumps a single registry revision. Writers pass the revision
/// they read; a stale revision fails with `VersionConflict`.
pub trait RulesetStore: Send + Sync {
    /// Current registry revision.
    fn revision(&self) -> Result<u64, StorageError>;

    /// Insert a new snapshot. Returns the new revision.
    ///
    /// # Errors
    /// - `DuplicateKey` if the id is taken.
    fn insert(&self, snapshot: RulesetSnapshot) -> Result<u64, StorageError>;

    /// Get a snapshot by id.
    fn get(&self, id: &RulesetId) -> Result<Option<RulesetSnapshot>, StorageError>;

    /// All snapshots, sorted by id.
    fn list(&self) -> Result<Vec<RulesetSnapshot>, StorageError>;

    /// Atomically replace existing snapshots. Returns the new revision.
    ///
    /// # Errors
    /// - `VersionConflict` if `expected_revision` is stale.
    /// - `NotFound` if any snapshot does not exist.
    fn commit(&self, expected_revision: u64, updates: Vec<RulesetSnapshot>) -> Result<u64, StorageError>;

    /// Remove a snapshot. Returns the new revision.
    fn remove(&self, expected_revision: u64, id: &RulesetId) -> Result<u64, StorageError>;
}

/// Append-only fact storage.
pub trait FactStore: Send + Sync {
    /// Write a new fact.
    ///
    /// # Errors
    /// - `DuplicateKey` if a fact with the same id exists.
    fn put(&self, fact: Fact) -> Result<(), StorageError>;

    /// Get a fact by id.
    fn get(&self, id: FactId) -> Result<Option<Fact>, StorageError>;

    /// Filtered, paginated retrieval sorted by `(as_of, topic, id)`.
    fn query(&self, query: &FactQuery) -> Result<FactPage, StorageError>;

    /// Total number of stored facts.
    fn count(&self) -> Result<usize, StorageError>;
}

/// Append-only provenance edge storage.
pub trait ProvenanceStore: Send + Sync {
    /// Insert edges; edges whose id already exists are skipped.
    /// Returns the number of edges newly written.
    fn insert_edges(&self, edges: Vec<ProvenanceEdge>) -> Result<usize, StorageError>;

    /// Edges leaving `node`, in insertion order.
    fn edges_from(&self, node: &NodeRef) -> Result<Vec<ProvenanceEdge>, StorageError>;

    /// Edges entering `node`, in insertion order.
    fn edges_to(&self, node: &NodeRef) -> Result<Vec<ProvenanceEdge>, StorageError>;
}

/// Scenario registry.
pub trait ScenarioStore: Send + Sync {
    /// Insert a new scenario.
    ///
    /// # Errors
    /// - `DuplicateKey` if the id is taken.
    fn insert(&self, scenario: Scenario) -> Result<(), StorageError>;

    /// Get a scenario by id.
    fn get(&self, id: &ScenarioId) -> Result<Option<Scenario>, StorageError>;

    /// Replace a scenario if its stored version equals `expected_version`.
    ///
    /// # Errors
    /// - `NotFound` if the scenario does not exist.
    /// - `VersionConflict` if the stored version differs.
    fn update(&self, scenario: Scenario, expected_version: u64) -> Result<(), StorageError>;

    /// All scenarios, sorted by id.
    fn list(&self) -> Result<Vec<Scenario>, StorageError>;
}

/// Ledger of completed `run` calls keyed by idempotency key.
pub trait IdempotencyStore: Send + Sync {
    /// Look up a record.
    fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, StorageError>;

    /// Insert unless a record for the key exists; returns the existing record
    /// in that case.
    fn insert_if_absent(&self, record: IdempotencyRecord) -> Result<Option<IdempotencyRecord>, StorageError>;
}

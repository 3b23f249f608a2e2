//! Storage traits and backends for factforge.
//!
//! The engine talks to storage only through the traits re-exported here.
//! [`memory`] holds the in-memory reference backend; the `persistent` feature
//! adds a durable fact and provenance ledger.

pub mod memory;
#[cfg(feature = "persistent")]
pub mod persistent;
mod traits;

pub use traits::{
    FactStore, IdempotencyStore, ProvenanceStore, RuleStore, RulesetStore, ScenarioStore, StorageError,
};

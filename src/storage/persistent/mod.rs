//! Durable storage for facts, provenance and idempotency records.
//!
//! ```text
//! <dir>/
//!   .ledger.lock    exclusive lock (flock / LockFileEx)
//!   facts.ledger    [header][record][record]...
//! ```
//!
//! The ledger is the only durable state: indexes are rebuilt in memory by
//! replaying it on open. Rulesets, scenarios and the reference catalogue are
//! not persisted here.

mod codec;
mod file_lock;
mod ledger;

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use file_lock::FileLock;
pub use ledger::{LedgerEntry, LedgerRecord, PersistentLedger, ReplayStats, LEDGER_FILE};

use crate::engine::EngineStores;
use crate::error::CalcResult;
use crate::storage::memory::InMemoryRuleStore;

/// Ledger settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// fsync after every append (slower but survives power loss).
    pub sync_on_write: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self { sync_on_write: true }
    }
}

/// Opens or creates a ledger at `path`.
///
/// # Errors
///
/// Fails if the directory cannot be created or locked, or the ledger is
/// corrupted before its last record.
///
/// # Example
/// ```rust,ignore
/// let ledger = Arc::new(open_ledger("./ledger", None)?);
/// let stores = EngineStores {
///     facts: ledger.clone(),
///     provenance: ledger.clone(),
///     idempotency: ledger,
///     ..EngineStores::in_memory(rules)
/// };
/// ```
pub fn open_ledger(path: impl AsRef<Path>, config: Option<LedgerConfig>) -> CalcResult<PersistentLedger> {
    let config = config.unwrap_or_default();
    Ok(PersistentLedger::open(path.as_ref(), &config)?)
}

/// Engine stores whose facts, edges and idempotency records live in the
/// ledger at `path`.
///
/// # Errors
///
/// See [`open_ledger`].
pub fn persistent_stores(
    path: impl AsRef<Path>,
    config: Option<LedgerConfig>,
    rules: Arc<InMemoryRuleStore>,
) -> CalcResult<EngineStores> {
    let ledger = Arc::new(open_ledger(path, config)?);
    Ok(EngineStores {
        facts: ledger.clone(),
        provenance: ledger.clone(),
        idempotency: ledger,
        ..EngineStores::in_memory(rules)
    })
}

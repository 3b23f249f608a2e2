//! Append-only ledger of facts, provenance edges and idempotency records.
//!
//! Every write appends one framed record and then updates the in-memory
//! indexes. Opening a ledger replays the file into those indexes. A record cut
//! short by a crash at the end of the file is truncated away; damage anywhere
//! else fails the open.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::fact::{Fact, FactId, FactPage, FactQuery};
use crate::provenance::{NodeRef, ProvenanceEdge};
use crate::request::{IdempotencyKey, IdempotencyRecord};
use crate::storage::memory::{InMemoryFactStore, InMemoryIdempotencyStore, InMemoryProvenanceStore};
use crate::storage::{FactStore, IdempotencyStore, ProvenanceStore, StorageError};

use super::codec;
use super::file_lock::FileLock;
use super::LedgerConfig;

/// Name of the ledger file inside the ledger directory.
pub const LEDGER_FILE: &str = "facts.ledger";

/// One appended record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerRecord {
    /// Monotonic sequence number, starting at 1.
    pub sequence: u64,
    pub recorded_at: DateTime<Utc>,
    pub entry: LedgerEntry,
}

/// Payload of a ledger record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum LedgerEntry {
    Fact(Fact),
    Edges(Vec<ProvenanceEdge>),
    Idempotency(IdempotencyRecord),
}

struct Writer {
    file: BufWriter<File>,
    sequence: u64,
}

/// What replay found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Records applied.
    pub records: u64,
    /// Bytes dropped from a torn tail.
    pub truncated_bytes: u64,
}

/// Durable fact, provenance and idempotency storage in one ledger file.
pub struct PersistentLedger {
    dir: PathBuf,
    _lock: FileLock,
    writer: Mutex<Writer>,
    sync_on_write: bool,
    facts: InMemoryFactStore,
    edges: InMemoryProvenanceStore,
    idempotency: InMemoryIdempotencyStore,
    replay: ReplayStats,
}

fn io_err(context: &str, err: &std::io::Error) -> StorageError {
    StorageError::BackendError(format!("{context}: {err}"))
}

impl PersistentLedger {
    /// Opens or creates the ledger in `dir`.
    ///
    /// # Errors
    ///
    /// - `BackendError` if the directory cannot be created or locked, or if
    ///   the ledger is corrupted before its last record.
    pub fn open(dir: &Path, config: &LedgerConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(dir).map_err(|e| io_err("failed to create ledger directory", &e))?;
        let lock = FileLock::acquire(dir).map_err(|e| io_err("failed to lock ledger directory", &e))?;
        let path = dir.join(LEDGER_FILE);

        let mut ledger = Self {
            dir: dir.to_path_buf(),
            _lock: lock,
            writer: Mutex::new(Writer {
                file: BufWriter::new(Self::open_file(&path, config.sync_on_write)?),
                sequence: 0,
            }),
            sync_on_write: config.sync_on_write,
            facts: InMemoryFactStore::new(),
            edges: InMemoryProvenanceStore::new(),
            idempotency: InMemoryIdempotencyStore::new(),
            replay: ReplayStats::default(),
        };
        ledger.replay(&path)?;
        info!(
            dir = %dir.display(),
            records = ledger.replay.records,
            truncated_bytes = ledger.replay.truncated_bytes,
            "ledger opened"
        );
        Ok(ledger)
    }

    /// Directory holding the ledger.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Outcome of the replay performed on open.
    #[must_use]
    pub const fn replay_stats(&self) -> ReplayStats {
        self.replay
    }

    /// Sequence number of the last record.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.lock_writer().sequence
    }

    /// Opens the file for appending, writing the header into a new file.
    fn open_file(path: &Path, sync: bool) -> Result<File, StorageError> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
            .map_err(|e| io_err("failed to open ledger", &e))?;
        let len = file.metadata().map_err(|e| io_err("failed to stat ledger", &e))?.len();
        if len == 0 {
            codec::write_header(&mut file).map_err(|e| io_err("failed to write ledger header", &e))?;
            if sync {
                file.sync_all().map_err(|e| io_err("failed to sync ledger", &e))?;
            }
        }
        Ok(file)
    }

    fn replay(&mut self, path: &Path) -> Result<(), StorageError> {
        let file = File::open(path).map_err(|e| io_err("failed to read ledger", &e))?;
        let file_len = file.metadata().map_err(|e| io_err("failed to stat ledger", &e))?.len();
        let mut reader = BufReader::new(file);
        codec::read_header(&mut reader).map_err(|e| io_err("invalid ledger header", &e))?;

        let mut good_end = codec::HEADER_LEN;
        let mut sequence = 0;
        let mut records = 0;
        while good_end < file_len {
            match codec::decode::<LedgerRecord>(&mut reader) {
                Ok(record) => {
                    sequence = record.sequence;
                    self.apply(record.entry)?;
                    records += 1;
                    good_end = reader
                        .stream_position()
                        .map_err(|e| io_err("failed to read ledger", &e))?;
                }
                Err(e) => {
                    let at = reader.stream_position().unwrap_or(file_len);
                    // Only the final record may be damaged by an interrupted append.
                    let torn = e.kind() == ErrorKind::UnexpectedEof || at >= file_len;
                    if !torn {
                        return Err(StorageError::BackendError(format!(
                            "ledger corrupted after record {sequence}: {e}"
                        )));
                    }
                    warn!(
                        sequence,
                        offset = good_end,
                        dropped = file_len - good_end,
                        error = %e,
                        "truncating torn ledger tail"
                    );
                    let file = OpenOptions::new()
                        .write(true)
                        .open(path)
                        .map_err(|e| io_err("failed to open ledger for repair", &e))?;
                    file.set_len(good_end)
                        .map_err(|e| io_err("failed to truncate ledger", &e))?;
                    file.sync_all().map_err(|e| io_err("failed to sync ledger", &e))?;
                    self.replay.truncated_bytes = file_len - good_end;
                    break;
                }
            }
        }

        self.replay.records = records;
        self.writer.get_mut().unwrap_or_else(PoisonError::into_inner).sequence = sequence;
        Ok(())
    }

    fn apply(&self, entry: LedgerEntry) -> Result<(), StorageError> {
        match entry {
            LedgerEntry::Fact(fact) => match self.facts.put(fact) {
                Ok(()) | Err(StorageError::DuplicateKey(_)) => Ok(()),
                Err(e) => Err(e),
            },
            LedgerEntry::Edges(edges) => self.edges.insert_edges(edges).map(|_| ()),
            LedgerEntry::Idempotency(record) => self.idempotency.insert_if_absent(record).map(|_| ()),
        }
    }

    /// Appends a record. Callers hold the writer lock so the check that
    /// precedes an append and the append itself are atomic.
    fn append(&self, writer: &mut Writer, entry: &LedgerEntry) -> Result<(), StorageError> {
        let record = LedgerRecord {
            sequence: writer.sequence + 1,
            recorded_at: Utc::now(),
            entry: entry.clone(),
        };
        let bytes = codec::encode(&record).map_err(|e| StorageError::SerializationError(e.to_string()))?;
        writer
            .file
            .write_all(&bytes)
            .and_then(|()| writer.file.flush())
            .map_err(|e| io_err("ledger append failed", &e))?;
        if self.sync_on_write {
            writer
                .file
                .get_ref()
                .sync_data()
                .map_err(|e| io_err("ledger sync failed", &e))?;
        }
        writer.sequence = record.sequence;
        Ok(())
    }

    fn lock_writer(&self) -> std::sync::MutexGuard<'_, Writer> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FactStore for PersistentLedger {
    fn put(&self, fact: Fact) -> Result<(), StorageError> {
        let mut writer = self.lock_writer();
        if self.facts.get(fact.id)?.is_some() {
            return Err(StorageError::DuplicateKey(fact.id.to_string()));
        }
        let entry = LedgerEntry::Fact(fact);
        self.append(&mut writer, &entry)?;
        self.apply(entry)
    }

    fn get(&self, id: FactId) -> Result<Option<Fact>, StorageError> {
        self.facts.get(id)
    }

    fn query(&self, query: &FactQuery) -> Result<FactPage, StorageError> {
        self.facts.query(query)
    }

    fn count(&self) -> Result<usize, StorageError> {
        self.facts.count()
    }
}

impl ProvenanceStore for PersistentLedger {
    fn insert_edges(&self, edges: Vec<ProvenanceEdge>) -> Result<usize, StorageError> {
        let mut writer = self.lock_writer();
        let mut fresh = Vec::with_capacity(edges.len());
        for edge in edges {
            let known = self.edges.edges_from(&edge.src)?.iter().any(|e| e.id == edge.id)
                || fresh.iter().any(|e: &ProvenanceEdge| e.id == edge.id);
            if !known {
                fresh.push(edge);
            }
        }
        if fresh.is_empty() {
            return Ok(0);
        }
        self.append(&mut writer, &LedgerEntry::Edges(fresh.clone()))?;
        self.edges.insert_edges(fresh)
    }

    fn edges_from(&self, node: &NodeRef) -> Result<Vec<ProvenanceEdge>, StorageError> {
        self.edges.edges_from(node)
    }

    fn edges_to(&self, node: &NodeRef) -> Result<Vec<ProvenanceEdge>, StorageError> {
        self.edges.edges_to(node)
    }
}

impl IdempotencyStore for PersistentLedger {
    fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, StorageError> {
        self.idempotency.get(key)
    }

    fn insert_if_absent(&self, record: IdempotencyRecord) -> Result<Option<IdempotencyRecord>, StorageError> {
        let mut writer = self.lock_writer();
        if let Some(existing) = self.idempotency.get(&record.key)? {
            return Ok(Some(existing));
        }
        let entry = LedgerEntry::Idempotency(record);
        self.append(&mut writer, &entry)?;
        self.apply(entry)?;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::NaiveDate;
    use tempfile::tempdir;

    use crate::decimal::{Quantity, Unit};
    use crate::provenance::Relation;
    use crate::request::ClientData;
    use crate::rule::{RuleVersionRef, Topic};
    use crate::ruleset::RulesetId;
    use crate::scenario::ScenarioId;

    fn fact(amount: i64) -> Fact {
        let ruleset_id = RulesetId::parse("ruleset-20240701").unwrap();
        let as_of = NaiveDate::from_ymd_opt(2024, 7, 1).unwrap();
        let scenario_id = ScenarioId::base();
        let inputs_hash = ClientData::new()
            .with("salary", Quantity::from_int(amount, Unit::Dollars))
            .inputs_hash()
            .unwrap();
        let topic = Topic::new("pit.income_tax");
        Fact {
            id: FactId::derive(&ruleset_id, as_of, &scenario_id, &inputs_hash, &topic),
            topic,
            value: Quantity::from_int(amount / 5, Unit::Dollars),
            ruleset_id,
            as_of,
            scenario_id,
            inputs_hash,
            rules: vec![RuleVersionRef::new("pit.brackets", 1)],
            rounding_steps: Vec::new(),
            created_at: Utc::now(),
        }
    }

    fn config() -> LedgerConfig {
        LedgerConfig { sync_on_write: false }
    }

    #[test]
    fn test_reopen_restores_everything() {
        let dir = tempdir().unwrap();
        let stored = fact(100_000);
        let edge = ProvenanceEdge::new(
            NodeRef::Fact { id: stored.id },
            NodeRef::Rule {
                ruleset_id: stored.ruleset_id.clone(),
                rule_id: "pit.brackets".to_string(),
                version: 1,
            },
            Relation::ComputedBy,
            None,
        );
        {
            let ledger = PersistentLedger::open(dir.path(), &config()).unwrap();
            ledger.put(stored.clone()).unwrap();
            assert_eq!(ledger.insert_edges(vec![edge.clone(), edge.clone()]).unwrap(), 1);
            assert_eq!(ledger.insert_edges(vec![edge.clone()]).unwrap(), 0);
            ledger
                .insert_if_absent(IdempotencyRecord {
                    key: IdempotencyKey::new("k"),
                    fingerprint: IdempotencyKey::new("f"),
                    fact_ids: vec![stored.id],
                    recorded_at: Utc::now(),
                })
                .unwrap();
            assert_eq!(ledger.sequence(), 3);
        }

        let ledger = PersistentLedger::open(dir.path(), &config()).unwrap();
        assert_eq!(ledger.replay_stats().records, 3);
        assert_eq!(FactStore::get(&ledger, stored.id).unwrap(), Some(stored.clone()));
        assert_eq!(ledger.edges_from(&NodeRef::Fact { id: stored.id }).unwrap(), vec![edge]);
        assert!(IdempotencyStore::get(&ledger, &IdempotencyKey::new("k")).unwrap().is_some());
        assert!(matches!(ledger.put(stored), Err(StorageError::DuplicateKey(_))));
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        {
            let ledger = PersistentLedger::open(dir.path(), &config()).unwrap();
            ledger.put(fact(1)).unwrap();
            ledger.put(fact(2)).unwrap();
        }
        let path = dir.path().join(LEDGER_FILE);
        let len = fs::metadata(&path).unwrap().len();
        OpenOptions::new().write(true).open(&path).unwrap().set_len(len - 3).unwrap();

        let ledger = PersistentLedger::open(dir.path(), &config()).unwrap();
        assert_eq!(ledger.replay_stats().records, 1);
        assert!(ledger.replay_stats().truncated_bytes > 0);
        assert_eq!(ledger.count().unwrap(), 1);

        ledger.put(fact(3)).unwrap();
        assert_eq!(ledger.sequence(), 2);
    }

    #[test]
    fn test_second_open_is_locked_out() {
        let dir = tempdir().unwrap();
        let _first = PersistentLedger::open(dir.path(), &config()).unwrap();
        let Err(err) = PersistentLedger::open(dir.path(), &config()) else {
            panic!("expected lock failure");
        };
        assert!(err.to_string().contains("lock"));
    }
}

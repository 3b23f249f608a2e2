//! In-memory storage backend.
//!
//! This module provides thread-safe in-memory implementations of the storage traits.
//! It is intended for embedded usage, tests, and as a reference implementation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use chrono::NaiveDate;

use crate::error::{CalcResult, ValidationError};
use crate::fact::{Fact, FactId, FactPage, FactQuery};
use crate::provenance::{EdgeId, NodeRef, ProvenanceEdge};
use crate::reference::{Assumption, Reference};
use crate::request::{IdempotencyKey, IdempotencyRecord};
use crate::ruleset::{RulesetId, RulesetSnapshot};
use crate::scenario::{Scenario, ScenarioId};
use crate::storage::traits::{
    FactStore, IdempotencyStore, ProvenanceStore, RuleStore, RulesetStore, ScenarioStore, StorageError,
};

/// Key used for registry-wide version conflicts.
const REGISTRY_KEY: &str = "ruleset-registry";

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

#[derive(Debug, Default)]
struct RuleState {
    references: HashMap<String, BTreeMap<u32, Reference>>,
    assumptions: HashMap<String, BTreeMap<u32, Assumption>>,
}

/// In-memory reference and assumption catalogue.
///
/// The engine only reads from it; loading is done through the inherent
/// `insert_*` methods, which enforce non-overlapping version windows.
#[derive(Debug, Default)]
pub struct InMemoryRuleStore {
    state: RwLock<RuleState>,
}

impl InMemoryRuleStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a reference version.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` for a malformed record or a window that
    /// overlaps another version of the same reference.
    pub fn insert_reference(&self, reference: Reference) -> CalcResult<()> {
        reference.validate()?;
        let mut state = self
            .state
            .write()
            .map_err(|_| lock_err("rule.insert_reference"))?;
        let versions = state.references.entry(reference.id.clone()).or_default();
        if versions.contains_key(&reference.version) {
            return Err(StorageError::DuplicateKey(format!("{}@v{}", reference.id, reference.version)).into());
        }
        if let Some(other) = versions.values().find(|v| v.window.overlaps(&reference.window)) {
            return Err(ValidationError::InvalidReference {
                id: reference.id.clone(),
                reason: format!("version {} overlaps version {}", reference.version, other.version),
            }
            .into());
        }
        versions.insert(reference.version, reference);
        Ok(())
    }

    /// Load an assumption version.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` for a malformed record or a window that
    /// overlaps another version of the same key.
    pub fn insert_assumption(&self, assumption: Assumption) -> CalcResult<()> {
        assumption.validate()?;
        let mut state = self
            .state
            .write()
            .map_err(|_| lock_err("rule.insert_assumption"))?;
        let versions = state.assumptions.entry(assumption.key.clone()).or_default();
        if versions.contains_key(&assumption.version) {
            return Err(StorageError::DuplicateKey(format!("{}@v{}", assumption.key, assumption.version)).into());
        }
        if let Some(other) = versions.values().find(|v| v.window.overlaps(&assumption.window)) {
            return Err(ValidationError::InvalidAssumption {
                key: assumption.key.clone(),
                reason: format!("version {} overlaps version {}", assumption.version, other.version),
            }
            .into());
        }
        versions.insert(assumption.version, assumption);
        Ok(())
    }
}

impl RuleStore for InMemoryRuleStore {
    fn reference_at(&self, id: &str, as_of: NaiveDate) -> Result<Option<Reference>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("rule.reference_at"))?;
        Ok(state
            .references
            .get(id)
            .and_then(|versions| versions.values().find(|r| r.window.contains(as_of)).cloned()))
    }

    fn reference_version(&self, id: &str, version: u32) -> Result<Option<Reference>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("rule.reference_version"))?;
        Ok(state.references.get(id).and_then(|v| v.get(&version)).cloned())
    }

    fn reference_versions(&self, id: &str) -> Result<Vec<Reference>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("rule.reference_versions"))?;
        Ok(state
            .references
            .get(id)
            .map(|v| v.values().cloned().collect())
            .unwrap_or_default())
    }

    fn assumption_at(&self, key: &str, as_of: NaiveDate) -> Result<Option<Assumption>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("rule.assumption_at"))?;
        Ok(state
            .assumptions
            .get(key)
            .and_then(|versions| versions.values().find(|a| a.window.contains(as_of)).cloned()))
    }

    fn assumption_version(&self, key: &str, version: u32) -> Result<Option<Assumption>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("rule.assumption_version"))?;
        Ok(state.assumptions.get(key).and_then(|v| v.get(&version)).cloned())
    }

    fn assumption_versions(&self, key: &str) -> Result<Vec<Assumption>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("rule.assumption_versions"))?;
        Ok(state
            .assumptions
            .get(key)
            .map(|v| v.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[derive(Debug, Default)]
struct RulesetState {
    revision: u64,
    by_id: BTreeMap<RulesetId, RulesetSnapshot>,
}

/// In-memory ruleset registry.
#[derive(Debug, Default)]
pub struct InMemoryRulesetStore {
    state: RwLock<RulesetState>,
}

impl InMemoryRulesetStore {
    /// Create an empty registry at revision 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_revision(state: &RulesetState, expected: u64) -> Result<(), StorageError> {
    if state.revision == expected {
        Ok(())
    } else {
        Err(StorageError::VersionConflict {
            key: REGISTRY_KEY.to_string(),
            expected,
            actual: state.revision,
        })
    }
}

impl RulesetStore for InMemoryRulesetStore {
    fn revision(&self) -> Result<u64, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("ruleset.revision"))?;
        Ok(state.revision)
    }

    fn insert(&self, mut snapshot: RulesetSnapshot) -> Result<u64, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("ruleset.insert"))?;
        if state.by_id.contains_key(&snapshot.id) {
            return Err(StorageError::DuplicateKey(snapshot.id.to_string()));
        }
        state.revision += 1;
        snapshot.revision = state.revision;
        state.by_id.insert(snapshot.id.clone(), snapshot);
        Ok(state.revision)
    }

    fn get(&self, id: &RulesetId) -> Result<Option<RulesetSnapshot>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("ruleset.get"))?;
        Ok(state.by_id.get(id).cloned())
    }

    fn list(&self) -> Result<Vec<RulesetSnapshot>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("ruleset.list"))?;
        Ok(state.by_id.values().cloned().collect())
    }

    fn commit(&self, expected_revision: u64, updates: Vec<RulesetSnapshot>) -> Result<u64, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("ruleset.commit"))?;
        check_revision(&state, expected_revision)?;
        if let Some(missing) = updates.iter().find(|s| !state.by_id.contains_key(&s.id)) {
            return Err(StorageError::NotFound(missing.id.to_string()));
        }
        state.revision += 1;
        let revision = state.revision;
        for mut snapshot in updates {
            snapshot.revision = revision;
            state.by_id.insert(snapshot.id.clone(), snapshot);
        }
        Ok(revision)
    }

    fn remove(&self, expected_revision: u64, id: &RulesetId) -> Result<u64, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("ruleset.remove"))?;
        check_revision(&state, expected_revision)?;
        if state.by_id.remove(id).is_none() {
            return Err(StorageError::NotFound(id.to_string()));
        }
        state.revision += 1;
        Ok(state.revision)
    }
}

#[derive(Debug, Default)]
struct FactState {
    by_id: HashMap<FactId, Fact>,
    by_scenario: HashMap<ScenarioId, Vec<FactId>>,
}

/// In-memory append-only fact store.
#[derive(Debug, Default)]
pub struct InMemoryFactStore {
    state: RwLock<FactState>,
}

impl InMemoryFactStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl FactStore for InMemoryFactStore {
    fn put(&self, fact: Fact) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("fact.put"))?;
        if state.by_id.contains_key(&fact.id) {
            return Err(StorageError::DuplicateKey(fact.id.to_string()));
        }
        state
            .by_scenario
            .entry(fact.scenario_id.clone())
            .or_default()
            .push(fact.id);
        state.by_id.insert(fact.id, fact);
        Ok(())
    }

    fn get(&self, id: FactId) -> Result<Option<Fact>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("fact.get"))?;
        Ok(state.by_id.get(&id).cloned())
    }

    fn query(&self, query: &FactQuery) -> Result<FactPage, StorageError> {
        let matcher = query
            .compile()
            .map_err(|e| StorageError::InvalidQuery(e.to_string()))?;
        let state = self.state.read().map_err(|_| lock_err("fact.query"))?;
        let matches: Vec<Fact> = match &query.scenario_id {
            Some(scenario) => state
                .by_scenario
                .get(scenario)
                .into_iter()
                .flatten()
                .filter_map(|id| state.by_id.get(id))
                .filter(|f| matcher.matches(f))
                .cloned()
                .collect(),
            None => state.by_id.values().filter(|f| matcher.matches(f)).cloned().collect(),
        };
        Ok(matcher.paginate(matches))
    }

    fn count(&self) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("fact.count"))?;
        Ok(state.by_id.len())
    }
}

#[derive(Debug, Default)]
struct EdgeState {
    ids: HashSet<EdgeId>,
    edges: Vec<ProvenanceEdge>,
    from: HashMap<NodeRef, Vec<usize>>,
    to: HashMap<NodeRef, Vec<usize>>,
}

impl EdgeState {
    fn collect(&self, index: Option<&Vec<usize>>) -> Vec<ProvenanceEdge> {
        index
            .map(|positions| positions.iter().map(|&i| self.edges[i].clone()).collect())
            .unwrap_or_default()
    }
}

/// In-memory provenance edge store.
#[derive(Debug, Default)]
pub struct InMemoryProvenanceStore {
    state: RwLock<EdgeState>,
}

impl InMemoryProvenanceStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProvenanceStore for InMemoryProvenanceStore {
    fn insert_edges(&self, edges: Vec<ProvenanceEdge>) -> Result<usize, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("provenance.insert_edges"))?;
        let mut written = 0;
        for edge in edges {
            if !state.ids.insert(edge.id) {
                continue;
            }
            let position = state.edges.len();
            state.from.entry(edge.src.clone()).or_default().push(position);
            state.to.entry(edge.dst.clone()).or_default().push(position);
            state.edges.push(edge);
            written += 1;
        }
        Ok(written)
    }

    fn edges_from(&self, node: &NodeRef) -> Result<Vec<ProvenanceEdge>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("provenance.edges_from"))?;
        Ok(state.collect(state.from.get(node)))
    }

    fn edges_to(&self, node: &NodeRef) -> Result<Vec<ProvenanceEdge>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("provenance.edges_to"))?;
        Ok(state.collect(state.to.get(node)))
    }
}

/// In-memory scenario registry.
#[derive(Debug, Default)]
pub struct InMemoryScenarioStore {
    state: RwLock<BTreeMap<ScenarioId, Scenario>>,
}

impl InMemoryScenarioStore {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ScenarioStore for InMemoryScenarioStore {
    fn insert(&self, scenario: Scenario) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("scenario.insert"))?;
        if state.contains_key(&scenario.id) {
            return Err(StorageError::DuplicateKey(scenario.id.to_string()));
        }
        state.insert(scenario.id.clone(), scenario);
        Ok(())
    }

    fn get(&self, id: &ScenarioId) -> Result<Option<Scenario>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("scenario.get"))?;
        Ok(state.get(id).cloned())
    }

    fn update(&self, scenario: Scenario, expected_version: u64) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("scenario.update"))?;
        let Some(current) = state.get(&scenario.id) else {
            return Err(StorageError::NotFound(scenario.id.to_string()));
        };
        if current.version != expected_version {
            return Err(StorageError::VersionConflict {
                key: scenario.id.to_string(),
                expected: expected_version,
                actual: current.version,
            });
        }
        state.insert(scenario.id.clone(), scenario);
        Ok(())
    }

    fn list(&self) -> Result<Vec<Scenario>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("scenario.list"))?;
        Ok(state.values().cloned().collect())
    }
}

/// In-memory idempotency ledger.
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    state: RwLock<HashMap<IdempotencyKey, IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdempotencyStore for InMemoryIdempotencyStore {
    fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("idempotency.get"))?;
        Ok(state.get(key).cloned())
    }

    fn insert_if_absent(&self, record: IdempotencyRecord) -> Result<Option<IdempotencyRecord>, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("idempotency.insert"))?;
        if let Some(existing) = state.get(&record.key) {
            return Ok(Some(existing.clone()));
        }
        state.insert(record.key.clone(), record);
        Ok(None)
    }
}

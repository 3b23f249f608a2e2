//! Scenarios: named tags that group the facts of one hypothetical.
//!
//! Isolation is structural. Every fact carries its scenario id and queries
//! filter on it; nothing is copied or merged between scenarios.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::decimal::Quantity;
use crate::error::{CalcResult, ConflictError, ValidationError};
use crate::fact::{FactId, FactQuery, MAX_PAGE_SIZE};
use crate::reference::validate_identifier;
use crate::rule::Topic;
use crate::ruleset::RulesetId;
use crate::storage::{FactStore, ScenarioStore, StorageError};

/// Id of the base-reality scenario.
pub const BASE_SCENARIO: &str = "base";

/// Scenario identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScenarioId(String);

impl ScenarioId {
    /// Creates an id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The base-reality scenario.
    #[must_use]
    pub fn base() -> Self {
        Self(BASE_SCENARIO.to_string())
    }

    /// Returns true for the base scenario.
    #[must_use]
    pub fn is_base(&self) -> bool {
        self.0 == BASE_SCENARIO
    }

    /// Returns the id string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ScenarioId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Scenario lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioStatus {
    /// Accepts new facts.
    Open,
    /// Read-only; existing facts stay queryable.
    Archived,
}

/// A scenario record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: ScenarioId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Optimistic-concurrency version, bumped on every update.
    pub version: u64,
    pub status: ScenarioStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Scenario {
    /// Creates an open scenario at version 1.
    #[must_use]
    pub fn new(id: ScenarioId, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            description: None,
            version: 1,
            status: ScenarioStatus::Open,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets a description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Returns true if new facts may be written.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.status == ScenarioStatus::Open
    }

    /// Validates identifiers.
    ///
    /// # Errors
    ///
    /// Returns the identifier error for an empty or oversized id or name.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_identifier("scenario.id", self.id.as_str())?;
        validate_identifier("scenario.name", &self.name)
    }
}

/// Changes applied by [`ScenarioManager::update`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
}

/// One cell of a comparison row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonCell {
    pub fact_id: FactId,
    pub value: Quantity,
}

/// Facts sharing `(topic, as_of, ruleset_id)` across the compared scenarios.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonRow {
    pub topic: Topic,
    pub as_of: NaiveDate,
    pub ruleset_id: RulesetId,
    /// One entry per compared scenario, in request order. A scenario can hold
    /// several facts for the same key when computed from different inputs.
    pub cells: Vec<Vec<ComparisonCell>>,
}

/// Side-by-side view of several scenarios. Nothing is merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioComparison {
    /// Column order of every row.
    pub scenarios: Vec<ScenarioId>,
    /// Rows sorted by `(as_of, topic, ruleset_id)`.
    pub rows: Vec<ComparisonRow>,
}

/// Creates, updates and compares scenarios.
#[derive(Clone)]
pub struct ScenarioManager {
    scenarios: Arc<dyn ScenarioStore>,
    facts: Arc<dyn FactStore>,
}

impl ScenarioManager {
    /// Creates a manager over the given stores.
    #[must_use]
    pub fn new(scenarios: Arc<dyn ScenarioStore>, facts: Arc<dyn FactStore>) -> Self {
        Self { scenarios, facts }
    }

    /// Creates the base scenario if it is missing.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn ensure_base(&self) -> CalcResult<Scenario> {
        if let Some(existing) = self.scenarios.get(&ScenarioId::base())? {
            return Ok(existing);
        }
        let base = Scenario::new(ScenarioId::base(), "Base reality");
        match self.scenarios.insert(base.clone()) {
            Ok(()) => Ok(base),
            // Lost a race with another initializer.
            Err(StorageError::DuplicateKey(_)) => self.get(&ScenarioId::base()),
            Err(e) => Err(e.into()),
        }
    }

    /// Registers a new scenario.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateScenario` if the id is taken.
    pub fn create(&self, scenario: Scenario) -> CalcResult<Scenario> {
        scenario.validate()?;
        let id = scenario.id.clone();
        match self.scenarios.insert(scenario.clone()) {
            Ok(()) => {
                info!(scenario_id = %id, "scenario created");
                Ok(scenario)
            }
            Err(StorageError::DuplicateKey(_)) => Err(ConflictError::DuplicateScenario { id: id.to_string() }.into()),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetches a scenario.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub fn get(&self, id: &ScenarioId) -> CalcResult<Scenario> {
        self.scenarios.get(id)?.ok_or_else(|| {
            ValidationError::NotFound {
                resource: "scenario",
                id: id.to_string(),
            }
            .into()
        })
    }

    /// Fetches a scenario that accepts new facts.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id and `ScenarioArchived` for an
    /// archived one.
    pub fn require_writable(&self, id: &ScenarioId) -> CalcResult<Scenario> {
        let scenario = self.get(id)?;
        if !scenario.is_open() {
            return Err(ValidationError::ScenarioArchived { id: id.to_string() }.into());
        }
        Ok(scenario)
    }

    /// Renames or re-describes a scenario.
    ///
    /// # Errors
    ///
    /// Returns `VersionConflict` if `expected_version` is stale.
    pub fn update(&self, id: &ScenarioId, expected_version: u64, changes: ScenarioUpdate) -> CalcResult<Scenario> {
        let mut scenario = self.get(id)?;
        if let Some(name) = changes.name {
            scenario.name = name;
        }
        if let Some(description) = changes.description {
            scenario.description = Some(description);
        }
        scenario.validate()?;
        self.write(scenario, expected_version)
    }

    /// Archives a scenario. Its facts stay queryable.
    ///
    /// # Errors
    ///
    /// Returns `BaseScenarioImmutable` for the base scenario and
    /// `VersionConflict` if `expected_version` is stale.
    pub fn archive(&self, id: &ScenarioId, expected_version: u64) -> CalcResult<Scenario> {
        if id.is_base() {
            return Err(ValidationError::BaseScenarioImmutable.into());
        }
        let mut scenario = self.get(id)?;
        scenario.status = ScenarioStatus::Archived;
        self.write(scenario, expected_version)
    }

    /// All scenarios sorted by id.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn list(&self) -> CalcResult<Vec<Scenario>> {
        Ok(self.scenarios.list()?)
    }

    /// Compares facts across scenarios.
    ///
    /// `filters.scenario_id` and pagination are ignored; every matching fact
    /// of each listed scenario is read.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown scenario and `InvalidQuery` for bad
    /// filters.
    pub fn compare(&self, ids: &[ScenarioId], filters: &FactQuery) -> CalcResult<ScenarioComparison> {
        if ids.is_empty() {
            return Err(ValidationError::InvalidQuery {
                reason: "comparison needs at least one scenario".to_string(),
            }
            .into());
        }
        let mut rows: BTreeMap<(NaiveDate, Topic, RulesetId), Vec<Vec<ComparisonCell>>> = BTreeMap::new();
        for (column, id) in ids.iter().enumerate() {
            self.get(id)?;
            let mut query = FactQuery {
                scenario_id: Some(id.clone()),
                ..filters.clone()
            }
            .page(0, MAX_PAGE_SIZE);
            loop {
                let page = self.facts.query(&query)?;
                for fact in page.facts {
                    let cells = rows
                        .entry((fact.as_of, fact.topic.clone(), fact.ruleset_id.clone()))
                        .or_insert_with(|| vec![Vec::new(); ids.len()]);
                    cells[column].push(ComparisonCell {
                        fact_id: fact.id,
                        value: fact.value,
                    });
                }
                match page.next_offset {
                    Some(next) => query.offset = next,
                    None => break,
                }
            }
        }
        Ok(ScenarioComparison {
            scenarios: ids.to_vec(),
            rows: rows
                .into_iter()
                .map(|((as_of, topic, ruleset_id), cells)| ComparisonRow {
                    topic,
                    as_of,
                    ruleset_id,
                    cells,
                })
                .collect(),
        })
    }

    fn write(&self, mut scenario: Scenario, expected_version: u64) -> CalcResult<Scenario> {
        scenario.version = expected_version + 1;
        scenario.updated_at = Utc::now();
        match self.scenarios.update(scenario.clone(), expected_version) {
            Ok(()) => {
                info!(scenario_id = %scenario.id, version = scenario.version, "scenario updated");
                Ok(scenario)
            }
            Err(StorageError::VersionConflict { key, expected, actual }) => {
                warn!(scenario_id = %key, expected, actual, "scenario version conflict");
                Err(ConflictError::VersionConflict {
                    resource: "scenario",
                    id: key,
                    expected,
                    actual,
                }
                .into())
            }
            Err(StorageError::NotFound(_)) => Err(ValidationError::NotFound {
                resource: "scenario",
                id: scenario.id.to_string(),
            }
            .into()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::storage::memory::{InMemoryFactStore, InMemoryScenarioStore};

    fn manager() -> ScenarioManager {
        ScenarioManager::new(
            Arc::new(InMemoryScenarioStore::new()),
            Arc::new(InMemoryFactStore::new()),
        )
    }

    #[test]
    fn base_scenario_is_created_once() {
        let m = manager();
        let a = m.ensure_base().unwrap();
        let b = m.ensure_base().unwrap();
        assert_eq!(a, b);
        assert_eq!(m.list().unwrap().len(), 1);
    }

    #[test]
    fn duplicate_scenario_is_a_conflict() {
        let m = manager();
        m.create(Scenario::new("retire-at-60".into(), "Retire at 60")).unwrap();
        let err = m
            .create(Scenario::new("retire-at-60".into(), "Again"))
            .unwrap_err();
        assert_eq!(err.kind(), "duplicate_scenario");
    }

    #[test]
    fn stale_update_is_retryable_conflict() {
        let m = manager();
        let id = ScenarioId::new("salary-sacrifice");
        m.create(Scenario::new(id.clone(), "Salary sacrifice")).unwrap();

        let renamed = m
            .update(
                &id,
                1,
                ScenarioUpdate {
                    name: Some("Sacrifice 10k".to_string()),
                    description: None,
                },
            )
            .unwrap();
        assert_eq!(renamed.version, 2);

        let err = m.update(&id, 1, ScenarioUpdate::default()).unwrap_err();
        assert_eq!(err.kind(), "version_conflict");
        assert!(err.is_retryable());
    }

    #[test]
    fn base_cannot_be_archived_but_others_can() {
        let m = manager();
        m.ensure_base().unwrap();
        let err = m.archive(&ScenarioId::base(), 1).unwrap_err();
        assert_eq!(err.kind(), "base_scenario_immutable");

        let id = ScenarioId::new("downsize");
        m.create(Scenario::new(id.clone(), "Downsize home")).unwrap();
        m.archive(&id, 1).unwrap();
        let err = m.require_writable(&id).unwrap_err();
        assert_eq!(err.kind(), "scenario_archived");
    }

    #[test]
    fn compare_requires_known_scenarios() {
        let m = manager();
        m.ensure_base().unwrap();
        let err = m
            .compare(&[ScenarioId::base(), ScenarioId::new("nope")], &FactQuery::default())
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");

        let empty = m.compare(&[ScenarioId::base()], &FactQuery::default()).unwrap();
        assert!(empty.rows.is_empty());
    }
}

//! Calculation engine.
//!
//! `CalcEngine` wires the publisher, resolver, executor, fact store,
//! provenance builder and scenario manager together. A run has two phases:
//!
//! - [`CalcEngine::prepare`] is read-only: it resolves, evaluates and builds
//!   the facts and provenance edges a request would produce.
//! - [`CalcEngine::commit`] writes them. Edges go first, then facts, then the
//!   idempotency record, so a failed commit can be retried as a whole.
//!
//! The job queue relies on this split to evaluate a whole batch before
//! writing any of it.

pub mod jobs;
pub mod retry;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::{CalcError, CalcResult, ConflictError, ErrorReport, ExecutionError, ValidationError};
use crate::executor::{self, AssumptionSnapshot, Execution, TraceEntry};
use crate::fact::{Fact, FactId, FactPage, FactQuery};
use crate::provenance::{NodeRef, ProvenanceBuilder, ProvenanceChain, ProvenanceEdge, Relation};
use crate::request::{CalculationRequest, IdempotencyKey, IdempotencyRecord};
use crate::resolver::{self, ExecutionPlan};
use crate::rule::Topic;
use crate::ruleset::{RulesetArtifact, RulesetId, RulesetPublisher, RulesetSnapshot, ValidationReport};
use crate::scenario::{ScenarioComparison, ScenarioId, ScenarioManager};
use crate::storage::memory::{
    InMemoryFactStore, InMemoryIdempotencyStore, InMemoryProvenanceStore, InMemoryRuleStore, InMemoryRulesetStore,
    InMemoryScenarioStore,
};
use crate::storage::{
    FactStore, IdempotencyStore, ProvenanceStore, RuleStore, RulesetStore, ScenarioStore, StorageError,
};

use self::retry::{DeadLetter, DeadLetterQueue, Retrier};

/// The storage backends an engine runs on.
#[derive(Clone)]
pub struct EngineStores {
    /// References and assumptions (read-only to the engine).
    pub rules: Arc<dyn RuleStore>,
    /// Ruleset registry.
    pub rulesets: Arc<dyn RulesetStore>,
    /// Facts.
    pub facts: Arc<dyn FactStore>,
    /// Provenance edges.
    pub provenance: Arc<dyn ProvenanceStore>,
    /// Scenarios.
    pub scenarios: Arc<dyn ScenarioStore>,
    /// Idempotency ledger.
    pub idempotency: Arc<dyn IdempotencyStore>,
}

impl EngineStores {
    /// In-memory stores around a caller-loaded rule store.
    #[must_use]
    pub fn in_memory(rules: Arc<InMemoryRuleStore>) -> Self {
        Self {
            rules,
            rulesets: Arc::new(InMemoryRulesetStore::new()),
            facts: Arc::new(InMemoryFactStore::new()),
            provenance: Arc::new(InMemoryProvenanceStore::new()),
            scenarios: Arc::new(InMemoryScenarioStore::new()),
            idempotency: Arc::new(InMemoryIdempotencyStore::new()),
        }
    }
}

/// Result of a `run`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Facts in dependency order.
    pub facts: Vec<Fact>,
    /// One entry per executed rule; empty on replay.
    pub trace: Vec<TraceEntry>,
    pub idempotency_key: IdempotencyKey,
    /// True when the facts were returned from an earlier run with the same key.
    pub replayed: bool,
}

/// Per-item result of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchItemResult {
    Succeeded { facts: Vec<Fact> },
    Failed { error: ErrorReport },
}

/// One item of a batch, by its position in the submitted list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItemOutcome {
    pub index: usize,
    pub result: BatchItemResult,
}

/// Result of a batch, in submission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub items: Vec<BatchItemOutcome>,
}

impl BatchOutcome {
    /// Number of successful items.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.items
            .iter()
            .filter(|i| matches!(i.result, BatchItemResult::Succeeded { .. }))
            .count()
    }

    /// Number of failed items.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.items.len() - self.succeeded()
    }
}

/// A request evaluated but not yet written.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    request: CalculationRequest,
    key: IdempotencyKey,
    fingerprint: IdempotencyKey,
    work: PreparedWork,
}

#[derive(Debug, Clone)]
enum PreparedWork {
    Replay(Vec<Fact>),
    Fresh {
        facts: Vec<Fact>,
        edges: Vec<ProvenanceEdge>,
        trace: Vec<TraceEntry>,
    },
}

impl PreparedRun {
    /// The request this run was prepared from.
    #[must_use]
    pub fn request(&self) -> &CalculationRequest {
        &self.request
    }

    /// Facts the run will return.
    #[must_use]
    pub fn facts(&self) -> &[Fact] {
        match &self.work {
            PreparedWork::Replay(facts) | PreparedWork::Fresh { facts, .. } => facts,
        }
    }

    /// Provenance edges the commit will write; empty for a replay.
    #[must_use]
    pub fn edges(&self) -> &[ProvenanceEdge] {
        match &self.work {
            PreparedWork::Replay(_) => &[],
            PreparedWork::Fresh { edges, .. } => edges,
        }
    }
}

struct EngineInner {
    stores: EngineStores,
    config: EngineConfig,
    publisher: RulesetPublisher,
    scenarios: ScenarioManager,
    provenance: ProvenanceBuilder,
    retrier: Retrier,
}

/// The calculation engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CalcEngine {
    inner: Arc<EngineInner>,
}

impl CalcEngine {
    /// Creates an engine and makes sure the base scenario exists.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for a bad config and propagates storage
    /// failures.
    pub fn new(stores: EngineStores, config: EngineConfig) -> CalcResult<Self> {
        let config = config.validate()?;
        let publisher = RulesetPublisher::new(Arc::clone(&stores.rulesets), Arc::clone(&stores.rules));
        let scenarios = ScenarioManager::new(Arc::clone(&stores.scenarios), Arc::clone(&stores.facts));
        let provenance = ProvenanceBuilder::new(
            Arc::clone(&stores.facts),
            Arc::clone(&stores.provenance),
            Arc::clone(&stores.rulesets),
            Arc::clone(&stores.rules),
            config.max_provenance_depth,
        );
        let retrier = Retrier::new(config.retry, Arc::new(DeadLetterQueue::default()));
        scenarios.ensure_base()?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                stores,
                config,
                publisher,
                scenarios,
                provenance,
                retrier,
            }),
        })
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Ruleset publisher.
    #[must_use]
    pub fn publisher(&self) -> &RulesetPublisher {
        &self.inner.publisher
    }

    /// Scenario manager.
    #[must_use]
    pub fn scenarios(&self) -> &ScenarioManager {
        &self.inner.scenarios
    }

    /// Operations that exhausted their retries, oldest first.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.retrier.dead_letters().list()
    }

    /// Evaluates a request without writing anything.
    ///
    /// # Errors
    ///
    /// - `IdempotencyMismatch` if the key was used for a different request.
    /// - `NotFound` / `ScenarioArchived` for an unusable scenario.
    /// - `RulesetNotActive` for a snapshot that was never activated.
    /// - Resolution and execution failures.
    pub fn prepare(&self, request: &CalculationRequest) -> CalcResult<PreparedRun> {
        request.validate()?;
        let key = request.effective_idempotency_key()?;
        let fingerprint = request.fingerprint()?;
        let retrier = &self.inner.retrier;
        let stores = &self.inner.stores;

        let recorded = retrier.run(
            "idempotency.get",
            || json!({ "key": key.as_str() }),
            || stores.idempotency.get(&key),
        )?;
        if let Some(record) = recorded {
            if record.fingerprint != fingerprint {
                return Err(ConflictError::IdempotencyMismatch { key: key.to_string() }.into());
            }
            let facts = self.load_facts(&record.fact_ids)?;
            return Ok(PreparedRun {
                request: request.clone(),
                key,
                fingerprint,
                work: PreparedWork::Replay(facts),
            });
        }

        self.inner.scenarios.require_writable(&request.scenario_id)?;
        let snapshot = self.inner.publisher.usable(&request.ruleset_id)?;
        let plan = resolver::plan(&snapshot, request.as_of, &request.targets)?;
        let keys = AssumptionSnapshot::required_keys(&plan);
        let assumptions = AssumptionSnapshot::load(&keys, request.as_of, |k| {
            retrier.run(
                "assumption.load",
                || json!({ "key": k, "as_of": request.as_of }),
                || stores.rules.assumption_at(k, request.as_of),
            )
        })?;
        let execution = executor::execute(&plan, &request.client_data, &assumptions)?;
        let (facts, edges) = self.materialize(request, &snapshot, &plan, &execution)?;
        let trace = execution.outputs.into_iter().map(|o| o.trace).collect();

        Ok(PreparedRun {
            request: request.clone(),
            key,
            fingerprint,
            work: PreparedWork::Fresh { facts, edges, trace },
        })
    }

    /// Writes a prepared run.
    ///
    /// When a concurrent run with the same key records first, this run
    /// returns that run's facts marked as replayed.
    ///
    /// # Errors
    ///
    /// - `FactAlreadyExists` if a stored fact with the same id differs.
    /// - `IdempotencyMismatch` if another request claimed the key meanwhile.
    /// - `RetriesExhausted` if storage stays unavailable.
    pub fn commit(&self, prepared: PreparedRun) -> CalcResult<RunOutcome> {
        let PreparedRun {
            request,
            key,
            fingerprint,
            work,
        } = prepared;
        let (facts, edges, trace) = match work {
            PreparedWork::Replay(facts) => {
                info!(
                    idempotency_key = %key,
                    ruleset_id = %request.ruleset_id,
                    scenario_id = %request.scenario_id,
                    facts = facts.len(),
                    "run replayed"
                );
                return Ok(RunOutcome {
                    facts,
                    trace: Vec::new(),
                    idempotency_key: key,
                    replayed: true,
                });
            }
            PreparedWork::Fresh { facts, edges, trace } => (facts, edges, trace),
        };

        let retrier = &self.inner.retrier;
        let stores = &self.inner.stores;
        retrier.run(
            "provenance.insert_edges",
            || json!({ "edges": edges.len(), "idempotency_key": key.as_str() }),
            || stores.provenance.insert_edges(edges.clone()),
        )?;

        let mut stored = Vec::with_capacity(facts.len());
        for fact in facts {
            let put = retrier.run(
                "fact.put",
                || json!({ "fact_id": fact.id.to_string(), "topic": fact.topic.as_str() }),
                || stores.facts.put(fact.clone()),
            );
            match put {
                Ok(()) => stored.push(fact),
                Err(CalcError::Storage(StorageError::DuplicateKey(_))) => {
                    // Same parameter tuple computed earlier under another key.
                    let existing = self.fact(fact.id)?;
                    if !existing.same_content(&fact) {
                        warn!(fact_id = %fact.id, topic = %fact.topic, "stored fact differs from recomputation");
                        return Err(ConflictError::FactAlreadyExists { id: fact.id.to_string() }.into());
                    }
                    stored.push(existing);
                }
                Err(e) => return Err(e),
            }
        }

        let record = IdempotencyRecord {
            key: key.clone(),
            fingerprint: fingerprint.clone(),
            fact_ids: stored.iter().map(|f| f.id).collect(),
            recorded_at: Utc::now(),
        };
        let existing = retrier.run(
            "idempotency.insert",
            || json!({ "key": key.as_str() }),
            || stores.idempotency.insert_if_absent(record.clone()),
        )?;
        if let Some(existing) = existing {
            if existing.fingerprint != fingerprint {
                return Err(ConflictError::IdempotencyMismatch { key: key.to_string() }.into());
            }
            // A concurrent run with the same key committed first.
            info!(idempotency_key = %key, facts = existing.fact_ids.len(), "run joined a concurrent commit");
            return Ok(RunOutcome {
                facts: self.load_facts(&existing.fact_ids)?,
                trace: Vec::new(),
                idempotency_key: key,
                replayed: true,
            });
        }

        info!(
            ruleset_id = %request.ruleset_id,
            as_of = %request.as_of,
            scenario_id = %request.scenario_id,
            facts = stored.len(),
            idempotency_key = %key,
            "run committed"
        );
        Ok(RunOutcome {
            facts: stored,
            trace,
            idempotency_key: key,
            replayed: false,
        })
    }

    /// Computes and stores the facts for one request.
    ///
    /// Repeating a request with the same idempotency key returns the facts
    /// of the first run.
    ///
    /// # Errors
    ///
    /// See [`CalcEngine::prepare`] and [`CalcEngine::commit`].
    pub fn run(&self, request: &CalculationRequest) -> CalcResult<RunOutcome> {
        self.commit(self.prepare(request)?)
    }

    /// Runs up to `max_sync_batch` requests inline. Items succeed or fail
    /// independently.
    ///
    /// # Errors
    ///
    /// Returns `BatchTooLarge` for bigger batches; submit those through
    /// [`jobs::JobQueue::submit_batch`].
    pub fn run_batch(&self, requests: &[CalculationRequest]) -> CalcResult<BatchOutcome> {
        let max = self.inner.config.max_sync_batch;
        if requests.len() > max {
            return Err(ValidationError::BatchTooLarge {
                max,
                actual: requests.len(),
            }
            .into());
        }
        let items = requests
            .iter()
            .enumerate()
            .map(|(index, request)| BatchItemOutcome {
                index,
                result: match self.run(request) {
                    Ok(outcome) => BatchItemResult::Succeeded { facts: outcome.facts },
                    Err(err) => BatchItemResult::Failed { error: err.report() },
                },
            })
            .collect();
        Ok(BatchOutcome { items })
    }

    /// Paginated fact retrieval.
    ///
    /// # Errors
    ///
    /// Returns `InvalidQuery` for malformed filters.
    pub fn facts(&self, query: &FactQuery) -> CalcResult<FactPage> {
        query.compile()?;
        let stores = &self.inner.stores;
        self.inner.retrier.run(
            "fact.query",
            || serde_json::to_value(query).unwrap_or_default(),
            || stores.facts.query(query),
        )
    }

    /// Fetches one fact.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub fn fact(&self, id: FactId) -> CalcResult<Fact> {
        let stores = &self.inner.stores;
        self.inner
            .retrier
            .run("fact.get", || json!({ "fact_id": id.to_string() }), || stores.facts.get(id))?
            .ok_or_else(|| {
                ValidationError::NotFound {
                    resource: "fact",
                    id: id.to_string(),
                }
                .into()
            })
    }

    /// Reconstructs the provenance chain of a fact.
    ///
    /// # Errors
    ///
    /// See [`ProvenanceBuilder::explain`].
    pub fn explain(&self, id: FactId) -> CalcResult<ProvenanceChain> {
        self.inner.provenance.explain(id)
    }

    /// Explains several facts; each result stands alone.
    #[must_use]
    pub fn explain_batch(&self, ids: &[FactId]) -> BTreeMap<FactId, CalcResult<ProvenanceChain>> {
        self.inner.provenance.explain_batch(ids)
    }

    /// Registers a ruleset artifact as a draft.
    ///
    /// # Errors
    ///
    /// See [`RulesetPublisher::publish`].
    pub fn publish_ruleset(&self, artifact: RulesetArtifact) -> CalcResult<RulesetSnapshot> {
        self.inner.publisher.publish(artifact)
    }

    /// Validates a draft.
    ///
    /// # Errors
    ///
    /// See [`RulesetPublisher::validate`].
    pub fn validate_ruleset(&self, id: &RulesetId) -> CalcResult<ValidationReport> {
        self.inner.publisher.validate(id)
    }

    /// Activates a validated snapshot.
    ///
    /// # Errors
    ///
    /// See [`RulesetPublisher::activate`].
    pub fn activate_ruleset(&self, id: &RulesetId, expected_revision: Option<u64>) -> CalcResult<RulesetSnapshot> {
        self.inner.publisher.activate(id, expected_revision)
    }

    /// Re-activates a superseded snapshot.
    ///
    /// # Errors
    ///
    /// See [`RulesetPublisher::rollback`].
    pub fn rollback_ruleset(&self, target: &RulesetId, expected_revision: Option<u64>) -> CalcResult<RulesetSnapshot> {
        self.inner.publisher.rollback(target, expected_revision)
    }

    /// Side-by-side comparison across scenarios.
    ///
    /// # Errors
    ///
    /// See [`ScenarioManager::compare`].
    pub fn compare_scenarios(&self, ids: &[ScenarioId], filters: &FactQuery) -> CalcResult<ScenarioComparison> {
        self.inner.scenarios.compare(ids, filters)
    }

    fn load_facts(&self, ids: &[FactId]) -> CalcResult<Vec<Fact>> {
        ids.iter()
            .map(|id| {
                self.fact(*id).map_err(|e| match e {
                    CalcError::Validation(ValidationError::NotFound { .. }) => {
                        CalcError::internal(format!("idempotency record points at missing fact {id}"))
                    }
                    other => other,
                })
            })
            .collect()
    }

    /// Turns rule outputs into facts and the edges that explain them.
    fn materialize(
        &self,
        request: &CalculationRequest,
        snapshot: &RulesetSnapshot,
        plan: &ExecutionPlan,
        execution: &Execution,
    ) -> CalcResult<(Vec<Fact>, Vec<ProvenanceEdge>)> {
        let inputs_hash = request.client_data.inputs_hash()?;
        let fact_id = |topic: &Topic| {
            FactId::derive(
                &request.ruleset_id,
                request.as_of,
                &request.scenario_id,
                &inputs_hash,
                topic,
            )
        };
        let created_at = Utc::now();
        let mut facts = Vec::with_capacity(execution.outputs.len());
        let mut edges = Vec::new();
        let mut cited = BTreeSet::new();

        for output in &execution.outputs {
            let id = fact_id(&output.topic);
            let fact_node = NodeRef::Fact { id };
            let rule_node = NodeRef::Rule {
                ruleset_id: snapshot.id.clone(),
                rule_id: output.rule.rule_id.clone(),
                version: output.rule.version,
            };
            edges.push(ProvenanceEdge::new(fact_node.clone(), rule_node.clone(), Relation::ComputedBy, None));
            for topic in &output.upstream {
                edges.push(ProvenanceEdge::new(
                    fact_node.clone(),
                    NodeRef::Fact { id: fact_id(topic) },
                    Relation::DerivedFrom,
                    None,
                ));
            }
            for assumption in &output.assumptions_used {
                edges.push(ProvenanceEdge::new(
                    fact_node.clone(),
                    NodeRef::Assumption {
                        key: assumption.key.clone(),
                        version: assumption.version,
                    },
                    Relation::Uses,
                    None,
                ));
            }
            if cited.insert(output.rule.clone()) {
                self.cite(&mut edges, &rule_node, plan, output, request)?;
            }

            let fact = Fact {
                id,
                topic: output.topic.clone(),
                value: output.value.clone(),
                ruleset_id: request.ruleset_id.clone(),
                as_of: request.as_of,
                scenario_id: request.scenario_id.clone(),
                inputs_hash: inputs_hash.clone(),
                rules: vec![output.rule.clone()],
                rounding_steps: output.rounding_steps.clone(),
                created_at,
            };
            fact.validate()?;
            facts.push(fact);
        }
        Ok((facts, edges))
    }

    fn cite(
        &self,
        edges: &mut Vec<ProvenanceEdge>,
        rule_node: &NodeRef,
        plan: &ExecutionPlan,
        output: &executor::RuleOutput,
        request: &CalculationRequest,
    ) -> CalcResult<()> {
        let Some(step) = plan.steps.iter().find(|s| s.rule.version_ref() == output.rule) else {
            return Err(CalcError::internal(format!("rule {} missing from plan", output.rule)));
        };
        let stores = &self.inner.stores;
        for citation in &step.rule.citations {
            let reference = self.inner.retrier.run(
                "reference.load",
                || json!({ "reference_id": citation.reference_id, "as_of": request.as_of }),
                || stores.rules.reference_at(&citation.reference_id, request.as_of),
            )?;
            let Some(reference) = reference else {
                return Err(ExecutionError::DanglingProvenance {
                    node: format!("reference:{} as of {}", citation.reference_id, request.as_of),
                }
                .into());
            };
            edges.push(ProvenanceEdge::new(
                rule_node.clone(),
                NodeRef::Reference {
                    id: reference.id,
                    version: reference.version,
                },
                Relation::Cites,
                Some(citation.pinpoint.clone()),
            ));
        }
        Ok(())
    }
}

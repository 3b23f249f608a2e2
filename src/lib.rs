//! # factforge - deterministic financial calculation engine
//!
//! factforge evaluates versioned rules against client data and records every
//! result as an immutable, explainable fact.
//!
//! ## Core Concepts
//!
//! - **Rule**: a versioned formula for one topic, with an effective window and
//!   a precedence tier, citing the references it implements
//! - **Ruleset snapshot**: a published, validated and activated set of rules
//!   identified as `ruleset-YYYYMMDD[-suffix]`
//! - **Fact**: one computed value, keyed by `(ruleset, as_of, scenario,
//!   inputs, topic)` and never updated
//! - **Provenance**: edges from each fact to its rule, upstream facts,
//!   assumptions and cited references
//! - **Scenario**: an isolated what-if namespace for facts
//!
//! ## Usage
//!
//! ```rust,ignore
//! use factforge::{CalcEngine, CalculationRequest, ClientData, EngineConfig, EngineStores};
//!
//! let engine = CalcEngine::new(EngineStores::in_memory(rules), EngineConfig::default())?;
//! engine.publish_ruleset(artifact)?;
//! engine.validate_ruleset(&ruleset_id)?;
//! engine.activate_ruleset(&ruleset_id, None)?;
//!
//! let outcome = engine.run(&CalculationRequest::new(client_data, ruleset_id, as_of, ScenarioId::base()))?;
//! let chain = engine.explain(outcome.facts[0].id)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Value types
pub mod decimal;
pub mod digest;
pub mod error;
pub mod time;

// Rules and rulesets
pub mod expr;
pub mod reference;
pub mod rule;
pub mod ruleset;

// Calculation
pub mod config;
pub mod engine;
pub mod executor;
pub mod fact;
pub mod provenance;
pub mod request;
pub mod resolver;
pub mod scenario;
pub mod storage;

pub use config::EngineConfig;
pub use decimal::{Quantity, RoundingMethod, RoundingPoint, RoundingPolicy, Unit};
pub use engine::jobs::{JobId, JobQueue, JobQueueConfig, JobRecord, JobResult, JobStatus};
pub use engine::retry::{DeadLetter, RetryPolicy};
pub use engine::{BatchItemOutcome, BatchItemResult, BatchOutcome, CalcEngine, EngineStores, PreparedRun, RunOutcome};
pub use error::{CalcError, CalcResult, ConflictError, ErrorReport, ExecutionError, ValidationError};
pub use executor::TraceEntry;
pub use expr::{Comparison, Expr};
pub use fact::{Fact, FactId, FactPage, FactQuery, RoundingStep};
pub use provenance::{NodeRef, ProvenanceChain, ProvenanceEdge, Relation};
pub use reference::{Assumption, AssumptionValue, Bracket, BracketSchedule, Reference};
pub use request::{CalculationRequest, ClientData, IdempotencyKey};
pub use resolver::{ExecutionPlan, ResolvedRule};
pub use rule::{PrecedenceTier, Rule, RuleBuilder, RuleVersionRef, Topic};
pub use ruleset::{RulesetArtifact, RulesetId, RulesetPublisher, RulesetSnapshot, RulesetStatus, ValidationReport};
pub use scenario::{Scenario, ScenarioId, ScenarioManager, ScenarioStatus};
pub use storage::{FactStore, IdempotencyStore, ProvenanceStore, RuleStore, RulesetStore, ScenarioStore, StorageError};
pub use time::EffectiveWindow;

//! Bounded background job queue.
//!
//! Batches too large for [`CalcEngine::run_batch`] and ruleset publication
//! run on a small pool of worker threads fed by a bounded crossbeam channel.
//! Submission never blocks: a full queue is reported as `QueueFull`.
//!
//! A batch job evaluates every item before writing any of them. If the job
//! budget runs out during evaluation the job fails and nothing is stored.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::invalid;
use crate::error::{CalcError, CalcResult, ErrorReport, ExecutionError};
use crate::request::CalculationRequest;
use crate::ruleset::{RulesetArtifact, RulesetId, RulesetSnapshot, ValidationReport};

use super::{BatchItemOutcome, BatchItemResult, BatchOutcome, CalcEngine, PreparedRun};

/// Job queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobQueueConfig {
    /// Worker threads.
    pub workers: usize,
    /// Maximum queued (not yet running) jobs.
    pub queue_capacity: usize,
    /// Wall-clock budget per job.
    pub job_timeout_ms: u64,
    /// How long finished job records are kept.
    pub retention_secs: u64,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 1024,
            job_timeout_ms: 30_000,
            retention_secs: 3_600,
        }
    }
}

impl JobQueueConfig {
    const MAX_WORKERS: usize = 64;
    const MAX_QUEUE_CAPACITY: usize = 65_536;

    /// Checks the bounds.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the offending field.
    pub fn validate(&self) -> Result<(), CalcError> {
        if self.workers == 0 || self.workers > Self::MAX_WORKERS {
            return Err(invalid(format!(
                "jobs.workers must be in 1..={} (got {})",
                Self::MAX_WORKERS,
                self.workers
            )));
        }
        if self.queue_capacity == 0 || self.queue_capacity > Self::MAX_QUEUE_CAPACITY {
            return Err(invalid(format!(
                "jobs.queue_capacity must be in 1..={} (got {})",
                Self::MAX_QUEUE_CAPACITY,
                self.queue_capacity
            )));
        }
        if self.job_timeout_ms == 0 {
            return Err(invalid("jobs.job_timeout_ms must be positive".to_string()));
        }
        Ok(())
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }
}

/// Job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// True for `Completed` and `Failed`.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// What a job does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    Batch { items: usize },
    PublishRuleset { ruleset_id: RulesetId, activate: bool },
}

/// Output of a completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobResult {
    Batch(BatchOutcome),
    Ruleset {
        snapshot: RulesetSnapshot,
        report: ValidationReport,
    },
}

/// Pollable state of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Set once the job completed.
    pub result: Option<JobResult>,
    /// Set once the job failed.
    pub error: Option<ErrorReport>,
}

enum Job {
    Batch {
        id: JobId,
        requests: Vec<CalculationRequest>,
    },
    Publish {
        id: JobId,
        artifact: Box<RulesetArtifact>,
        activate: bool,
    },
}

impl Job {
    const fn id(&self) -> JobId {
        match self {
            Self::Batch { id, .. } | Self::Publish { id, .. } => *id,
        }
    }
}

#[derive(Default)]
struct JobRegistry {
    records: Mutex<HashMap<JobId, JobRecord>>,
    changed: Condvar,
}

impl JobRegistry {
    fn insert(&self, record: JobRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.id, record);
    }

    fn remove(&self, id: JobId) {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
    }

    fn get(&self, id: JobId) -> Option<JobRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    fn update(&self, id: JobId, f: impl FnOnce(&mut JobRecord)) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = records.get_mut(&id) {
            f(record);
        }
        drop(records);
        self.changed.notify_all();
    }

    fn wait_finished(&self, id: JobId, timeout: Duration) -> Option<JobRecord> {
        let deadline = Instant::now() + timeout;
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            let record = records.get(&id)?.clone();
            let now = Instant::now();
            if record.status.is_finished() || now >= deadline {
                return Some(record);
            }
            records = self
                .changed
                .wait_timeout(records, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let before = records.len();
        records.retain(|_, r| r.finished_at.map_or(true, |at| at >= cutoff));
        before - records.len()
    }
}

struct WorkerPool {
    tx: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
    queue_capacity: usize,
}

impl WorkerPool {
    fn start(
        name: &'static str,
        config: &JobQueueConfig,
        engine: &CalcEngine,
        registry: &Arc<JobRegistry>,
    ) -> CalcResult<Self> {
        let (tx, rx) = bounded::<Job>(config.queue_capacity);
        let mut pool = Self {
            tx,
            workers: Vec::with_capacity(config.workers),
            queue_capacity: config.queue_capacity,
        };
        for idx in 0..config.workers {
            let rx: Receiver<Job> = rx.clone();
            let engine = engine.clone();
            let registry = Arc::clone(registry);
            let timeout = config.timeout();
            let spawned = thread::Builder::new()
                .name(format!("factforge-{name}-{idx}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        process(&engine, &registry, job, timeout);
                    }
                });
            match spawned {
                Ok(handle) => pool.workers.push(handle),
                Err(e) => {
                    pool.shutdown();
                    return Err(CalcError::internal(format!("failed to spawn job worker: {e}")));
                }
            }
        }
        Ok(pool)
    }

    fn try_submit(&self, job: Job) -> CalcResult<()> {
        match self.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ExecutionError::QueueFull {
                capacity: self.queue_capacity,
            }
            .into()),
            Err(TrySendError::Disconnected(_)) => Err(ExecutionError::Disconnected.into()),
        }
    }

    fn shutdown(self) {
        // Workers drain queued jobs, then see the closed channel and exit.
        drop(self.tx);
        for handle in self.workers {
            let _ = handle.join();
        }
    }
}

/// Background queue for batches and ruleset publication.
pub struct JobQueue {
    pool: WorkerPool,
    registry: Arc<JobRegistry>,
    config: JobQueueConfig,
}

impl JobQueue {
    const MAX_RETENTION_SECS: u64 = 100 * 365 * 24 * 3_600;

    /// Starts the workers with the engine's job settings.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if a worker thread cannot be spawned.
    pub fn start(engine: &CalcEngine) -> CalcResult<Self> {
        Self::with_config(engine, engine.config().jobs.clone())
    }

    /// Starts the workers with explicit settings.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for a bad config and `Internal` if a worker
    /// thread cannot be spawned.
    pub fn with_config(engine: &CalcEngine, config: JobQueueConfig) -> CalcResult<Self> {
        config.validate()?;
        let registry = Arc::new(JobRegistry::default());
        let pool = WorkerPool::start("jobs", &config, engine, &registry)?;
        Ok(Self { pool, registry, config })
    }

    /// Queues a batch of any size.
    ///
    /// # Errors
    ///
    /// Returns `QueueFull` (retryable) when the queue is at capacity.
    pub fn submit_batch(&self, requests: Vec<CalculationRequest>) -> CalcResult<JobId> {
        let id = JobId::new();
        let kind = JobKind::Batch { items: requests.len() };
        self.submit(kind, Job::Batch { id, requests })
    }

    /// Queues publication of an artifact: publish, validate, and activate
    /// when `activate` is set and validation passes.
    ///
    /// # Errors
    ///
    /// Returns `QueueFull` (retryable) when the queue is at capacity.
    pub fn submit_publish(&self, artifact: RulesetArtifact, activate: bool) -> CalcResult<JobId> {
        let id = JobId::new();
        let kind = JobKind::PublishRuleset {
            ruleset_id: artifact.id.clone(),
            activate,
        };
        self.submit(
            kind,
            Job::Publish {
                id,
                artifact: Box::new(artifact),
                activate,
            },
        )
    }

    /// Current state of a job.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown or purged jobs.
    pub fn status(&self, id: JobId) -> CalcResult<JobRecord> {
        self.registry.get(id).ok_or_else(|| not_found(id))
    }

    /// Blocks until the job finishes or `timeout` elapses, returning the
    /// latest record either way.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown or purged jobs.
    pub fn wait(&self, id: JobId, timeout: Duration) -> CalcResult<JobRecord> {
        self.registry.wait_finished(id, timeout).ok_or_else(|| not_found(id))
    }

    /// Drops finished records older than the retention window. Returns how
    /// many were removed.
    pub fn purge_expired(&self) -> usize {
        let secs = self.config.retention_secs.min(Self::MAX_RETENTION_SECS);
        let retention = chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX));
        let cutoff = Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.registry.purge_finished_before(cutoff)
    }

    fn submit(&self, kind: JobKind, job: Job) -> CalcResult<JobId> {
        self.purge_expired();
        let id = job.id();
        self.registry.insert(JobRecord {
            id,
            kind: kind.clone(),
            status: JobStatus::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
        });
        if let Err(err) = self.pool.try_submit(job) {
            self.registry.remove(id);
            warn!(error = %err, "job rejected");
            return Err(err);
        }
        info!(job_id = %id, ?kind, "job queued");
        Ok(id)
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        let pool = std::mem::replace(
            &mut self.pool,
            WorkerPool {
                tx: bounded::<Job>(1).0,
                workers: Vec::new(),
                queue_capacity: 1,
            },
        );
        pool.shutdown();
    }
}

fn not_found(id: JobId) -> CalcError {
    crate::error::ValidationError::NotFound {
        resource: "job",
        id: id.to_string(),
    }
    .into()
}

fn process(engine: &CalcEngine, registry: &JobRegistry, job: Job, timeout: Duration) {
    let id = job.id();
    registry.update(id, |r| {
        r.status = JobStatus::Running;
        r.started_at = Some(Utc::now());
    });
    let deadline = Instant::now() + timeout;
    let outcome = match job {
        Job::Batch { requests, .. } => run_batch_job(engine, &requests, deadline, timeout).map(JobResult::Batch),
        Job::Publish { artifact, activate, .. } => publish_job(engine, *artifact, activate),
    };
    match outcome {
        Ok(result) => {
            info!(job_id = %id, "job completed");
            registry.update(id, |r| {
                r.status = JobStatus::Completed;
                r.finished_at = Some(Utc::now());
                r.result = Some(result);
            });
        }
        Err(err) => {
            warn!(job_id = %id, kind = err.kind(), error = %err, "job failed");
            registry.update(id, |r| {
                r.status = JobStatus::Failed;
                r.finished_at = Some(Utc::now());
                r.error = Some(err.report());
            });
        }
    }
}

/// Evaluates every item, then commits. The deadline is checked before each
/// evaluation and once more before the first commit; running out of time at
/// any of those points fails the whole job with nothing written. Once
/// committing starts it runs to completion, since each item's commit is
/// atomic and stopping midway would leave the batch partially applied.
fn run_batch_job(
    engine: &CalcEngine,
    requests: &[CalculationRequest],
    deadline: Instant,
    budget: Duration,
) -> CalcResult<BatchOutcome> {
    let timed_out = || ExecutionError::Timeout {
        duration_ms: u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
    };

    let mut prepared: Vec<Result<PreparedRun, CalcError>> = Vec::with_capacity(requests.len());
    for request in requests {
        if Instant::now() >= deadline {
            warn!(items = requests.len(), evaluated = prepared.len(), "batch job ran out of time");
            return Err(timed_out().into());
        }
        prepared.push(engine.prepare(request));
    }
    if Instant::now() >= deadline {
        warn!(items = requests.len(), "batch job ran out of time before commit");
        return Err(timed_out().into());
    }

    let items = prepared
        .into_iter()
        .enumerate()
        .map(|(index, run)| BatchItemOutcome {
            index,
            result: match run.and_then(|p| engine.commit(p)) {
                Ok(outcome) => BatchItemResult::Succeeded { facts: outcome.facts },
                Err(err) => BatchItemResult::Failed { error: err.report() },
            },
        })
        .collect();
    Ok(BatchOutcome { items })
}

fn publish_job(engine: &CalcEngine, artifact: RulesetArtifact, activate: bool) -> CalcResult<JobResult> {
    let id = artifact.id.clone();
    engine.publish_ruleset(artifact)?;
    let report = engine.validate_ruleset(&id)?;
    let snapshot = if activate {
        engine.activate_ruleset(&id, None)?
    } else {
        engine.publisher().get(&id)?
    };
    Ok(JobResult::Ruleset { snapshot, report })
}

//! Bounded retries for transient storage failures, and the dead-letter queue
//! that receives operations which never succeeded.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

use crate::config::invalid;
use crate::error::{CalcError, CalcResult, ExecutionError};
use crate::storage::StorageError;

/// Exponential backoff settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay_ms: u64,
    /// Upper bound on any single delay.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 10,
            max_delay_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    const MAX_ATTEMPTS: u32 = 16;

    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(30);
        let millis = self.base_delay_ms.saturating_mul(1u64 << shift).min(self.max_delay_ms);
        Duration::from_millis(millis)
    }

    /// Checks the bounds.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for zero or excessive attempts, or a base delay
    /// above the maximum.
    pub fn validate(&self) -> Result<(), CalcError> {
        if self.max_attempts == 0 || self.max_attempts > Self::MAX_ATTEMPTS {
            return Err(invalid(format!(
                "retry.max_attempts must be in 1..={} (got {})",
                Self::MAX_ATTEMPTS,
                self.max_attempts
            )));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(invalid(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }
}

/// An operation that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub operation: String,
    /// Kind of the last error.
    pub kind: String,
    /// Message of the last error.
    pub message: String,
    pub attempts: u32,
    /// Operation-specific context for operator review.
    pub context: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// Bounded in-memory dead-letter queue. The oldest entries are evicted once
/// the capacity is reached.
#[derive(Debug)]
pub struct DeadLetterQueue {
    entries: Mutex<VecDeque<DeadLetter>>,
    capacity: usize,
}

impl Default for DeadLetterQueue {
    fn default() -> Self {
        Self::with_capacity(1024)
    }
}

impl DeadLetterQueue {
    /// Creates a queue holding at most `capacity` entries.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Appends an entry.
    pub fn push(&self, letter: DeadLetter) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(letter);
    }

    /// Copies the current entries, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<DeadLetter> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.iter().cloned().collect()
    }

    /// Removes and returns every entry.
    pub fn drain(&self) -> Vec<DeadLetter> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.drain(..).collect()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns true if empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Runs storage operations under a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct Retrier {
    policy: RetryPolicy,
    dead_letters: Arc<DeadLetterQueue>,
}

impl Retrier {
    /// Creates a retrier writing exhausted operations to `dead_letters`.
    #[must_use]
    pub fn new(policy: RetryPolicy, dead_letters: Arc<DeadLetterQueue>) -> Self {
        Self { policy, dead_letters }
    }

    /// The dead-letter queue.
    #[must_use]
    pub fn dead_letters(&self) -> &Arc<DeadLetterQueue> {
        &self.dead_letters
    }

    /// Calls `op` until it succeeds, fails permanently, or runs out of
    /// attempts. Only transient storage errors are retried.
    ///
    /// # Errors
    ///
    /// Returns the first permanent error unchanged, or `RetriesExhausted`
    /// after the last attempt (the failure is dead-lettered with `context`).
    pub fn run<T>(
        &self,
        operation: &str,
        context: impl FnOnce() -> serde_json::Value,
        mut op: impl FnMut() -> Result<T, StorageError>,
    ) -> CalcResult<T> {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() => return Err(err.into()),
                Err(err) if attempt >= self.policy.max_attempts => {
                    let letter = DeadLetter {
                        id: Uuid::new_v4(),
                        operation: operation.to_string(),
                        kind: err.kind().to_string(),
                        message: err.to_string(),
                        attempts: attempt,
                        context: context(),
                        recorded_at: Utc::now(),
                    };
                    error!(
                        operation,
                        attempts = attempt,
                        dead_letter = %letter.id,
                        error = %err,
                        "retries exhausted; operation dead-lettered"
                    );
                    self.dead_letters.push(letter);
                    return Err(ExecutionError::RetriesExhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                        last_error: err.to_string(),
                    }
                    .into());
                }
                Err(err) => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "transient storage failure; retrying"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

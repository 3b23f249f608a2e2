//! Engine configuration.

use serde::{Deserialize, Serialize};

use crate::engine::jobs::JobQueueConfig;
use crate::engine::retry::RetryPolicy;
use crate::error::{CalcError, ValidationError};
use crate::provenance::MAX_PROVENANCE_DEPTH;

/// Top-level configuration for [`crate::CalcEngine`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Largest batch `run_batch` evaluates inline; larger batches must go
    /// through the job queue.
    pub max_sync_batch: usize,
    /// Provenance traversal depth cap (at most 15).
    pub max_provenance_depth: usize,
    /// Backoff for transient storage failures.
    pub retry: RetryPolicy,
    /// Background job queue.
    pub jobs: JobQueueConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_sync_batch: 64,
            max_provenance_depth: MAX_PROVENANCE_DEPTH,
            retry: RetryPolicy::default(),
            jobs: JobQueueConfig::default(),
        }
    }
}

impl EngineConfig {
    const MAX_SYNC_BATCH: usize = 10_000;

    /// Checks every bound, returning the config unchanged on success.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidConfig` naming the offending field.
    pub fn validate(self) -> Result<Self, CalcError> {
        if self.max_sync_batch == 0 || self.max_sync_batch > Self::MAX_SYNC_BATCH {
            return Err(invalid(format!(
                "max_sync_batch must be in 1..={} (got {})",
                Self::MAX_SYNC_BATCH,
                self.max_sync_batch
            )));
        }
        if self.max_provenance_depth == 0 || self.max_provenance_depth > MAX_PROVENANCE_DEPTH {
            return Err(invalid(format!(
                "max_provenance_depth must be in 1..={MAX_PROVENANCE_DEPTH} (got {})",
                self.max_provenance_depth
            )));
        }
        self.retry.validate()?;
        self.jobs.validate()?;
        Ok(self)
    }

    /// Parses and validates a JSON config document. Missing fields take
    /// their defaults.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for malformed JSON or out-of-range values.
    pub fn from_json_str(json: &str) -> Result<Self, CalcError> {
        let config: Self = serde_json::from_str(json).map_err(|e| invalid(format!("malformed config: {e}")))?;
        config.validate()
    }
}

pub(crate) fn invalid(reason: String) -> CalcError {
    ValidationError::InvalidConfig { reason }.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config = EngineConfig::from_json_str(r#"{"max_sync_batch": 8, "retry": {"max_attempts": 5}}"#).unwrap();
        assert_eq!(config.max_sync_batch, 8);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.max_provenance_depth, MAX_PROVENANCE_DEPTH);
        assert_eq!(config.jobs, JobQueueConfig::default());
    }

    #[test]
    fn depth_above_hard_cap_is_rejected() {
        let err = EngineConfig::from_json_str(r#"{"max_provenance_depth": 16}"#).unwrap_err();
        assert_eq!(err.kind(), "invalid_config");
        let err = EngineConfig::from_json_str("{not json").unwrap_err();
        assert_eq!(err.kind(), "invalid_config");
    }
}

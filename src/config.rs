//! Replicator configuration
//!
//! Byte thresholds driving group commit, indexing, checkpointing, head
//! truncation and write throttling. Loaded from JSON; every field has a
//! default so a partial file is valid.
//!
//! Thresholds relate as follows:
//! - a checkpoint is due every `checkpoint_threshold_bytes` of log growth
//! - the head is truncated once the log exceeds
//!   `checkpoint_threshold_bytes * truncation_threshold_factor`
//! - writes are throttled once the log exceeds
//!   `checkpoint_threshold_bytes * throttling_threshold_factor`
//! - the log is never truncated below `min_log_size_bytes`

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{LogError, LogResult};

const MIB: u64 = 1024 * 1024;

/// Configuration of one replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicatorConfig {
    /// Identity of this replica, recorded in UpdateEpoch records
    pub replica_id: Uuid,

    /// Unflushed bytes above which the commit pipeline reports backpressure.
    ///
    /// A flush is started once half of this is buffered.
    pub max_pending_flush_bytes: u64,

    /// Log growth between checkpoints
    pub checkpoint_threshold_bytes: u64,

    /// Log size never truncated below
    pub min_log_size_bytes: u64,

    /// Multiple of the checkpoint threshold that triggers head truncation
    pub truncation_threshold_factor: u64,

    /// Multiple of the checkpoint threshold that throttles writes
    pub throttling_threshold_factor: u64,

    /// Log growth between Indexing records
    pub index_interval_bytes: u64,

    /// Minimum interval between repeated warnings of the same kind
    pub warning_interval_ms: u64,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            replica_id: Uuid::new_v4(),
            max_pending_flush_bytes: 4 * MIB,
            checkpoint_threshold_bytes: 50 * MIB,
            min_log_size_bytes: 10 * MIB,
            truncation_threshold_factor: 2,
            throttling_threshold_factor: 4,
            index_interval_bytes: MIB,
            warning_interval_ms: 5_000,
        }
    }
}

impl ReplicatorConfig {
    /// Parse a JSON document and validate it
    pub fn from_json_str(json: &str) -> LogResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| LogError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON file and validate it
    pub fn from_json_file(path: &Path) -> LogResult<Self> {
        let json = fs::read_to_string(path).map_err(|e| {
            LogError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    /// Log size at which head truncation starts
    pub fn truncation_threshold_bytes(&self) -> u64 {
        self.checkpoint_threshold_bytes
            .saturating_mul(self.truncation_threshold_factor)
    }

    /// Log size at which writes are throttled
    pub fn throttling_threshold_bytes(&self) -> u64 {
        self.checkpoint_threshold_bytes
            .saturating_mul(self.throttling_threshold_factor)
    }

    /// Buffered bytes that start a flush
    pub fn flush_trigger_bytes(&self) -> u64 {
        (self.max_pending_flush_bytes / 2).max(1)
    }

    pub fn warning_interval(&self) -> Duration {
        Duration::from_millis(self.warning_interval_ms)
    }

    /// Reject inconsistent thresholds
    pub fn validate(&self) -> LogResult<()> {
        if self.max_pending_flush_bytes == 0 {
            return Err(LogError::Config(
                "max_pending_flush_bytes must be positive".into(),
            ));
        }
        if self.checkpoint_threshold_bytes == 0 {
            return Err(LogError::Config(
                "checkpoint_threshold_bytes must be positive".into(),
            ));
        }
        if self.index_interval_bytes == 0 {
            return Err(LogError::Config(
                "index_interval_bytes must be positive".into(),
            ));
        }
        if self.truncation_threshold_factor < 1 {
            return Err(LogError::Config(
                "truncation_threshold_factor must be at least 1".into(),
            ));
        }
        if self.throttling_threshold_factor < self.truncation_threshold_factor {
            return Err(LogError::Config(format!(
                "throttling_threshold_factor {} is below truncation_threshold_factor {}",
                self.throttling_threshold_factor, self.truncation_threshold_factor
            )));
        }
        if self.min_log_size_bytes > self.truncation_threshold_bytes() {
            return Err(LogError::Config(format!(
                "min_log_size_bytes {} exceeds the truncation threshold {}",
                self.min_log_size_bytes,
                self.truncation_threshold_bytes()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_is_valid() {
        let config = ReplicatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.truncation_threshold_bytes(), 100 * MIB);
        assert_eq!(config.throttling_threshold_bytes(), 200 * MIB);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = ReplicatorConfig::from_json_str(r#"{"checkpoint_threshold_bytes": 67108864}"#)
            .unwrap();
        assert_eq!(config.checkpoint_threshold_bytes, 64 * MIB);
        assert_eq!(config.truncation_threshold_factor, 2);
    }

    #[test]
    fn test_rejects_throttle_below_truncation() {
        let config = ReplicatorConfig {
            truncation_threshold_factor: 4,
            throttling_threshold_factor: 2,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(LogError::Config(_))));
    }

    #[test]
    fn test_rejects_zero_thresholds() {
        let config = ReplicatorConfig {
            checkpoint_threshold_bytes: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ReplicatorConfig {
            max_pending_flush_bytes: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_min_log_size_above_truncation_threshold() {
        let config = ReplicatorConfig {
            min_log_size_bytes: 500 * MIB,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("replicator.json");
        fs::write(&path, r#"{"warning_interval_ms": 250}"#).unwrap();

        let config = ReplicatorConfig::from_json_file(&path).unwrap();
        assert_eq!(config.warning_interval(), Duration::from_millis(250));

        assert!(ReplicatorConfig::from_json_file(&temp_dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_malformed_json_rejected() {
        assert!(matches!(
            ReplicatorConfig::from_json_str("{not json"),
            Err(LogError::Config(_))
        ));
    }
}

//! Checkpoint, indexing and head truncation policy
//!
//! All decisions are made from byte positions in the log stream. The
//! coordinator asks the policy while holding its ordering lock, so
//! implementations must not block.

use crate::config::ReplicatorConfig;

/// Decides when the coordinator inserts chain records and when the log is
/// too large to accept more writes
pub trait TruncationPolicy: Send + Sync {
    /// Insert an Indexing record
    fn should_index(&self, tail_position: u64, last_index_position: u64) -> bool;

    /// Begin a checkpoint
    fn should_checkpoint(&self, tail_position: u64, last_checkpoint_position: u64) -> bool;

    /// Look for a new log head
    fn should_truncate_head(&self, head_position: u64, tail_position: u64) -> bool;

    /// Whether an Indexing record at `candidate_position` may become the head
    fn is_good_log_head_candidate(&self, candidate_position: u64, tail_position: u64) -> bool;

    /// Refuse new transactional writes until the head moves
    fn should_throttle_writes(&self, head_position: u64, tail_position: u64) -> bool;
}

/// Byte-threshold policy built from `ReplicatorConfig`
#[derive(Debug, Clone)]
pub struct ThresholdTruncationPolicy {
    index_interval_bytes: u64,
    checkpoint_threshold_bytes: u64,
    min_log_size_bytes: u64,
    truncation_threshold_bytes: u64,
    throttling_threshold_bytes: u64,
}

impl ThresholdTruncationPolicy {
    pub fn from_config(config: &ReplicatorConfig) -> Self {
        Self {
            index_interval_bytes: config.index_interval_bytes,
            checkpoint_threshold_bytes: config.checkpoint_threshold_bytes,
            min_log_size_bytes: config.min_log_size_bytes,
            truncation_threshold_bytes: config.truncation_threshold_bytes(),
            throttling_threshold_bytes: config.throttling_threshold_bytes(),
        }
    }
}

impl TruncationPolicy for ThresholdTruncationPolicy {
    fn should_index(&self, tail_position: u64, last_index_position: u64) -> bool {
        tail_position.saturating_sub(last_index_position) >= self.index_interval_bytes
    }

    fn should_checkpoint(&self, tail_position: u64, last_checkpoint_position: u64) -> bool {
        tail_position.saturating_sub(last_checkpoint_position) >= self.checkpoint_threshold_bytes
    }

    fn should_truncate_head(&self, head_position: u64, tail_position: u64) -> bool {
        let size = tail_position.saturating_sub(head_position);
        size >= self.truncation_threshold_bytes && size > self.min_log_size_bytes
    }

    fn is_good_log_head_candidate(&self, candidate_position: u64, tail_position: u64) -> bool {
        tail_position.saturating_sub(candidate_position) >= self.min_log_size_bytes
    }

    fn should_throttle_writes(&self, head_position: u64, tail_position: u64) -> bool {
        tail_position.saturating_sub(head_position) >= self.throttling_threshold_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ThresholdTruncationPolicy {
        ThresholdTruncationPolicy::from_config(&ReplicatorConfig {
            index_interval_bytes: 100,
            checkpoint_threshold_bytes: 1_000,
            min_log_size_bytes: 500,
            truncation_threshold_factor: 2,
            throttling_threshold_factor: 4,
            ..Default::default()
        })
    }

    #[test]
    fn test_index_and_checkpoint_thresholds() {
        let policy = policy();
        assert!(!policy.should_index(199, 100));
        assert!(policy.should_index(200, 100));
        assert!(!policy.should_checkpoint(999, 0));
        assert!(policy.should_checkpoint(1_000, 0));
    }

    #[test]
    fn test_head_truncation_keeps_min_log_size() {
        let policy = policy();
        assert!(!policy.should_truncate_head(0, 1_999));
        assert!(policy.should_truncate_head(0, 2_000));

        assert!(policy.is_good_log_head_candidate(400, 900));
        assert!(!policy.is_good_log_head_candidate(401, 900));
    }

    #[test]
    fn test_throttling_threshold() {
        let policy = policy();
        assert!(!policy.should_throttle_writes(1_000, 4_999));
        assert!(policy.should_throttle_writes(1_000, 5_000));
    }
}

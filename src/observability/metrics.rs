//! Log metrics
//!
//! - Counters only, monotonic
//! - Reset only when the log is opened
//! - Thread-safe and lock-free

use std::sync::atomic::{AtomicU64, Ordering};

/// Operational counters of one replicated log
///
/// All counters use Relaxed ordering; a snapshot is not a consistent cut.
#[derive(Debug, Default)]
pub struct LogMetrics {
    /// Records made durable
    records_flushed: AtomicU64,
    /// Bytes made durable
    bytes_flushed: AtomicU64,
    /// Group-commit batches completed
    flush_batches: AtomicU64,
    /// Group-commit batches that failed
    failed_batches: AtomicU64,
    /// Writes refused by throttling
    throttled_writes: AtomicU64,
    /// Checkpoints completed
    checkpoints: AtomicU64,
    /// Head truncations applied
    head_truncations: AtomicU64,
    /// Tail truncations applied
    tail_truncations: AtomicU64,
    /// Records undone by tail truncation
    records_undone: AtomicU64,
}

impl LogMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed flush batch
    pub fn record_flush_batch(&self, records: u64, bytes: u64) {
        self.flush_batches.fetch_add(1, Ordering::Relaxed);
        self.records_flushed.fetch_add(records, Ordering::Relaxed);
        self.bytes_flushed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn increment_failed_batches(&self) {
        self.failed_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_throttled_writes(&self) {
        self.throttled_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_checkpoints(&self) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_head_truncations(&self) {
        self.head_truncations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a tail truncation and the number of records it undid
    pub fn record_tail_truncation(&self, records_undone: u64) {
        self.tail_truncations.fetch_add(1, Ordering::Relaxed);
        self.records_undone.fetch_add(records_undone, Ordering::Relaxed);
    }

    /// Get all counters as a snapshot
    pub fn snapshot(&self) -> LogMetricsSnapshot {
        LogMetricsSnapshot {
            records_flushed: self.records_flushed.load(Ordering::Relaxed),
            bytes_flushed: self.bytes_flushed.load(Ordering::Relaxed),
            flush_batches: self.flush_batches.load(Ordering::Relaxed),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
            throttled_writes: self.throttled_writes.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
            head_truncations: self.head_truncations.load(Ordering::Relaxed),
            tail_truncations: self.tail_truncations.load(Ordering::Relaxed),
            records_undone: self.records_undone.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogMetricsSnapshot {
    pub records_flushed: u64,
    pub bytes_flushed: u64,
    pub flush_batches: u64,
    pub failed_batches: u64,
    pub throttled_writes: u64,
    pub checkpoints: u64,
    pub head_truncations: u64,
    pub tail_truncations: u64,
    pub records_undone: u64,
}

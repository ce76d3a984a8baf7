//! Crate-level error type
//!
//! Every subsystem has its own error type; `LogError` aggregates them so a
//! single failure can be handed to every completion signal waiting on it.
//!
//! Severity model:
//! - `Error`: the operation fails, the replica continues
//! - `Fatal`: the replica must stop; the log is no longer trustworthy
//!
//! Ordering and protocol violations are not represented here. They are
//! asserted at the call site and abort the process.

use std::fmt;
use std::sync::OnceLock;

use thiserror::Error;

use crate::ordering::ReplicationError;
use crate::record::RecordError;
use crate::storage::StorageError;

/// Severity levels shared by every error in the crate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Operation fails, replica continues
    Error,
    /// Replica must stop serving
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "ERROR"),
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

/// Errors surfaced by the replicated log.
///
/// `Clone` so that one batch failure can resolve many record signals.
#[derive(Debug, Clone, Error)]
pub enum LogError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Format(#[from] RecordError),

    #[error(transparent)]
    Replication(#[from] ReplicationError),

    #[error("log is closed")]
    Closed,

    #[error("replica is not primary")]
    NotPrimary,

    #[error("writes are throttled: {0}")]
    Throttled(String),

    #[error("state provider failed: {0}")]
    StateProvider(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl LogError {
    /// Severity of this error
    pub fn severity(&self) -> Severity {
        match self {
            LogError::Storage(e) => e.severity(),
            LogError::Format(e) => e.severity(),
            LogError::Replication(e) => e.severity(),
            LogError::Closed
            | LogError::NotPrimary
            | LogError::Throttled(_)
            | LogError::StateProvider(_)
            | LogError::InvalidOperation(_)
            | LogError::Config(_) => Severity::Error,
        }
    }

    /// Whether this error must stop the replica
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }

    /// Whether the caller should retry against the new primary
    pub fn is_retryable(&self) -> bool {
        matches!(self, LogError::NotPrimary | LogError::Throttled(_))
    }
}

/// Result type for log operations
pub type LogResult<T> = Result<T, LogError>;

/// First-writer-wins latch for the partition's terminal fault.
///
/// Once a storage or unexpected replication failure is captured, every later
/// apply or flush completion fails with it instead of retrying work on a
/// replica that is known to be bad.
#[derive(Debug, Default)]
pub struct FaultLatch {
    fault: OnceLock<LogError>,
}

impl FaultLatch {
    /// Create an empty latch
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch `error` if nothing is latched yet.
    ///
    /// Returns `true` if this call captured the fault.
    pub fn latch(&self, error: LogError) -> bool {
        self.fault.set(error).is_ok()
    }

    /// The latched fault, if any
    pub fn get(&self) -> Option<LogError> {
        self.fault.get().cloned()
    }

    /// Whether a fault has been latched
    pub fn is_faulted(&self) -> bool {
        self.fault.get().is_some()
    }
}

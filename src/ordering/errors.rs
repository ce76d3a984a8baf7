//! Replication Error Types
//!
//! Failures reported by the replication transport are sorted into a closed
//! set of kinds:
//! - Expected: the replica lost primary status or the transport refused the
//!   payload. Callers retry against the new primary.
//! - Unexpected: anything else. The partition is faulted.

use std::fmt;

use crate::errors::Severity;

/// Replication error type
#[derive(Debug, Clone)]
pub struct ReplicationError {
    /// Error kind
    pub kind: ReplicationErrorKind,
    /// Error message
    pub message: String,
}

/// Replication error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationErrorKind {
    /// Replica is no longer primary
    NotPrimary,

    /// Temporary transport condition, e.g. no write quorum
    Transient,

    /// Replication was canceled
    Canceled,

    /// Replicator is closed
    Closed,

    /// Payload exceeds the transport limit
    TooLarge,

    /// Anything outside the kinds above
    Unexpected,
}

impl ReplicationError {
    /// Create a new replication error.
    pub fn new(kind: ReplicationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Create a not-primary error.
    pub fn not_primary(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::NotPrimary, message)
    }

    /// Create a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::Transient, message)
    }

    /// Create a canceled error.
    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::Canceled, message)
    }

    /// Create a closed error.
    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::Closed, message)
    }

    /// Create an oversized payload error.
    pub fn too_large(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::TooLarge, message)
    }

    /// Create an unexpected error.
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::Unexpected, message)
    }

    /// Whether the failure is a normal consequence of a role change or load
    pub fn is_expected(&self) -> bool {
        !matches!(self.kind, ReplicationErrorKind::Unexpected)
    }

    pub fn severity(&self) -> Severity {
        if self.is_expected() {
            Severity::Error
        } else {
            Severity::Fatal
        }
    }

    /// Check if this error faults the partition.
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

impl fmt::Display for ReplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicationError({:?}): {}", self.kind, self.message)
    }
}

impl std::error::Error for ReplicationError {}

/// Result type for replication operations
pub type ReplicationResult<T> = Result<T, ReplicationError>;

//! Record format errors
//!
//! The on-disk format has a closed type set and a checksum on every frame.
//! Any violation means an on-disk invariant is broken, so every variant is
//! FATAL. The one exception is a frame cut short at the very end of the log,
//! which recovery treats as a torn write (see `RecordError::is_torn_tail`).

use thiserror::Error;

use crate::errors::Severity;

/// Format and consistency failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    /// Fewer bytes remain than the frame header declares
    #[error("record at position {position} is truncated: need {needed} bytes, have {available}")]
    Truncated {
        position: u64,
        needed: usize,
        available: usize,
    },

    /// Stored CRC32 does not match the frame contents
    #[error("checksum mismatch at position {position}: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        position: u64,
        stored: u32,
        computed: u32,
    },

    /// Leading and trailing length fields disagree
    #[error("length mismatch at position {position}: leading {leading}, trailing {trailing}")]
    LengthMismatch {
        position: u64,
        leading: u32,
        trailing: u32,
    },

    /// Record type tag outside the closed type set
    #[error("unknown record type {0}")]
    UnknownRecordType(u32),

    /// Structurally invalid contents
    #[error("malformed record: {0}")]
    Malformed(String),
}

impl RecordError {
    /// Create a malformed-record error
    pub fn malformed(message: impl Into<String>) -> Self {
        RecordError::Malformed(message.into())
    }

    /// Format errors are always fatal
    pub fn severity(&self) -> Severity {
        Severity::Fatal
    }

    /// Whether this error describes a frame cut off by the end of the log
    pub fn is_torn_tail(&self) -> bool {
        matches!(self, RecordError::Truncated { .. })
    }
}

/// Result type for record encoding and decoding
pub type RecordResult<T> = Result<T, RecordError>;

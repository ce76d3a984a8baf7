//! Storage collaborator errors
//!
//! Error codes:
//! - LOG_STORAGE_APPEND_FAILED (ERROR severity)
//! - LOG_STORAGE_READ_FAILED (ERROR severity)
//! - LOG_STORAGE_FLUSH_FAILED (FATAL severity)
//! - LOG_STORAGE_TRUNCATE_FAILED (FATAL severity)
//! - LOG_STORAGE_ALIAS_FAILED (ERROR severity)
//! - LOG_STORAGE_NOT_FOUND (ERROR severity)
//! - LOG_STORAGE_METADATA_CORRUPT (FATAL severity)

use std::fmt;
use std::io;
use std::sync::Arc;

use crate::errors::Severity;

/// Storage error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorCode {
    /// Appending bytes to a stream failed
    AppendFailed,
    /// Reading back from a stream failed
    ReadFailed,
    /// Making appended bytes durable failed
    FlushFailed,
    /// Head or tail truncation failed
    TruncateFailed,
    /// Create, rename or delete of a log alias failed
    AliasFailed,
    /// No log exists under the alias
    NotFound,
    /// Stream metadata could not be read back
    MetadataCorrupt,
}

impl StorageErrorCode {
    /// Returns the string code
    pub fn code(&self) -> &'static str {
        match self {
            StorageErrorCode::AppendFailed => "LOG_STORAGE_APPEND_FAILED",
            StorageErrorCode::ReadFailed => "LOG_STORAGE_READ_FAILED",
            StorageErrorCode::FlushFailed => "LOG_STORAGE_FLUSH_FAILED",
            StorageErrorCode::TruncateFailed => "LOG_STORAGE_TRUNCATE_FAILED",
            StorageErrorCode::AliasFailed => "LOG_STORAGE_ALIAS_FAILED",
            StorageErrorCode::NotFound => "LOG_STORAGE_NOT_FOUND",
            StorageErrorCode::MetadataCorrupt => "LOG_STORAGE_METADATA_CORRUPT",
        }
    }

    /// Returns the severity level for this error
    pub fn severity(&self) -> Severity {
        match self {
            StorageErrorCode::AppendFailed => Severity::Error,
            StorageErrorCode::ReadFailed => Severity::Error,
            StorageErrorCode::FlushFailed => Severity::Fatal,
            StorageErrorCode::TruncateFailed => Severity::Fatal,
            StorageErrorCode::AliasFailed => Severity::Error,
            StorageErrorCode::NotFound => Severity::Error,
            StorageErrorCode::MetadataCorrupt => Severity::Fatal,
        }
    }
}

impl fmt::Display for StorageErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Storage error with context
#[derive(Debug, Clone)]
pub struct StorageError {
    code: StorageErrorCode,
    message: String,
    source: Option<Arc<io::Error>>,
}

impl StorageError {
    fn new(code: StorageErrorCode, message: impl Into<String>, source: Option<io::Error>) -> Self {
        Self {
            code,
            message: message.into(),
            source: source.map(Arc::new),
        }
    }

    pub fn append_failed(message: impl Into<String>, source: io::Error) -> Self {
        Self::new(StorageErrorCode::AppendFailed, message, Some(source))
    }

    pub fn read_failed(message: impl Into<String>, source: io::Error) -> Self {
        Self::new(StorageErrorCode::ReadFailed, message, Some(source))
    }

    pub fn flush_failed(message: impl Into<String>, source: io::Error) -> Self {
        Self::new(StorageErrorCode::FlushFailed, message, Some(source))
    }

    pub fn truncate_failed(message: impl Into<String>, source: io::Error) -> Self {
        Self::new(StorageErrorCode::TruncateFailed, message, Some(source))
    }

    pub fn alias_failed(message: impl Into<String>, source: io::Error) -> Self {
        Self::new(StorageErrorCode::AliasFailed, message, Some(source))
    }

    pub fn not_found(alias: &str) -> Self {
        Self::new(
            StorageErrorCode::NotFound,
            format!("no log under alias '{}'", alias),
            None,
        )
    }

    pub fn metadata_corrupt(message: impl Into<String>) -> Self {
        Self::new(StorageErrorCode::MetadataCorrupt, message, None)
    }

    /// Returns the error code
    pub fn code(&self) -> StorageErrorCode {
        self.code
    }

    /// Returns the severity level
    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    /// Returns the error message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns whether this error is fatal
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.code.severity(),
            self.code.code(),
            self.message
        )?;
        if let Some(ref source) = self.source {
            write!(f, " ({})", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_levels() {
        assert_eq!(StorageErrorCode::AppendFailed.severity(), Severity::Error);
        assert_eq!(StorageErrorCode::FlushFailed.severity(), Severity::Fatal);
        assert_eq!(StorageErrorCode::TruncateFailed.severity(), Severity::Fatal);
        assert_eq!(StorageErrorCode::NotFound.severity(), Severity::Error);
    }

    #[test]
    fn test_clone_shares_source() {
        let err = StorageError::flush_failed("fsync failed", io::Error::new(io::ErrorKind::Other, "disk error"));
        let copy = err.clone();
        assert!(copy.is_fatal());
        assert!(std::error::Error::source(&copy).is_some());
    }

    #[test]
    fn test_display_contains_code_and_message() {
        let err = StorageError::not_found("copy");
        let display = format!("{}", err);
        assert!(display.contains("LOG_STORAGE_NOT_FOUND"));
        assert!(display.contains("ERROR"));
        assert!(display.contains("'copy'"));
    }
}

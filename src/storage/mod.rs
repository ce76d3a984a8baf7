//! Log storage collaborator
//!
//! The log core does not own a storage driver. It talks to one through two
//! traits:
//! - `LogStore` resolves aliases to logical log streams and manages them
//! - `LogStream` is one append-only byte stream with head/tail truncation
//!
//! Positions are absolute byte offsets. Truncating the head does not shift
//! positions. Appended bytes are durable only once `flush` resolves.
//!
//! Two implementations are provided: `MemoryLogStore` with fault injection,
//! and `FileLogStore` with one file per alias.

mod errors;
mod file;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;

pub use errors::{StorageError, StorageErrorCode, StorageResult};
pub use file::FileLogStore;
pub use memory::{MemoryLogStore, StorageCounters};

/// A single logical log stream
#[async_trait]
pub trait LogStream: Send + Sync {
    /// Append bytes at the current write position
    async fn append(&self, bytes: &[u8]) -> StorageResult<()>;

    /// Make every appended byte durable
    async fn flush(&self) -> StorageResult<()>;

    /// Discard everything before `position`
    async fn truncate_head(&self, position: u64) -> StorageResult<()>;

    /// Discard everything at or after `position`
    async fn truncate_tail(&self, position: u64) -> StorageResult<()>;

    /// Read from `position` up to the write position
    async fn read_from(&self, position: u64) -> StorageResult<Vec<u8>>;

    /// First readable position
    fn head_position(&self) -> u64;

    /// Position the next append lands at
    fn write_position(&self) -> u64;
}

/// Alias-addressed container of log streams
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Open the existing log under `alias`
    async fn open(&self, alias: &str) -> StorageResult<Arc<dyn LogStream>>;

    /// Create an empty log under `alias`, replacing any existing one
    async fn create(&self, alias: &str) -> StorageResult<Arc<dyn LogStream>>;

    async fn exists(&self, alias: &str) -> StorageResult<bool>;

    /// Rename `from` to `to`. `to` must not exist.
    async fn rename(&self, from: &str, to: &str) -> StorageResult<()>;

    /// Delete the log under `alias`. Deleting a missing alias succeeds.
    async fn delete(&self, alias: &str) -> StorageResult<()>;
}

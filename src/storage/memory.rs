//! In-memory log store
//!
//! Backs tests. Supports one-shot fault injection for append and flush,
//! counts every storage call, and can simulate a crash that drops every
//! byte that was appended but never flushed.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::errors::{StorageError, StorageResult};
use super::{LogStore, LogStream};
use crate::sync::lock;

/// Counts of storage calls, across every stream of a store
#[derive(Debug, Default)]
pub struct StorageCounters {
    appends: AtomicU64,
    flushes: AtomicU64,
    head_truncations: AtomicU64,
    tail_truncations: AtomicU64,
}

impl StorageCounters {
    pub fn appends(&self) -> u64 {
        self.appends.load(Ordering::Relaxed)
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn head_truncations(&self) -> u64 {
        self.head_truncations.load(Ordering::Relaxed)
    }

    pub fn tail_truncations(&self) -> u64 {
        self.tail_truncations.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct Shared {
    fail_next_append: AtomicBool,
    fail_next_flush: AtomicBool,
    counters: StorageCounters,
}

fn injected() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "injected fault")
}

fn invalid_position(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message)
}

#[derive(Debug, Default)]
struct StreamState {
    /// First readable position
    head: u64,
    /// Bytes in `[head, head + data.len())`
    data: Vec<u8>,
    /// End of the flushed prefix
    durable_end: u64,
}

impl StreamState {
    fn write_position(&self) -> u64 {
        self.head + self.data.len() as u64
    }
}

struct MemoryLogStream {
    shared: Arc<Shared>,
    state: Mutex<StreamState>,
}

impl MemoryLogStream {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            state: Mutex::new(StreamState::default()),
        }
    }

    fn drop_unflushed(&self) {
        let mut state = lock(&self.state);
        let keep = state.durable_end.saturating_sub(state.head) as usize;
        state.data.truncate(keep);
    }
}

#[async_trait]
impl LogStream for MemoryLogStream {
    async fn append(&self, bytes: &[u8]) -> StorageResult<()> {
        self.shared.counters.appends.fetch_add(1, Ordering::Relaxed);
        if self.shared.fail_next_append.swap(false, Ordering::SeqCst) {
            return Err(StorageError::append_failed("append to memory log", injected()));
        }
        lock(&self.state).data.extend_from_slice(bytes);
        Ok(())
    }

    async fn flush(&self) -> StorageResult<()> {
        self.shared.counters.flushes.fetch_add(1, Ordering::Relaxed);
        if self.shared.fail_next_flush.swap(false, Ordering::SeqCst) {
            return Err(StorageError::flush_failed("flush memory log", injected()));
        }
        let mut state = lock(&self.state);
        state.durable_end = state.write_position();
        Ok(())
    }

    async fn truncate_head(&self, position: u64) -> StorageResult<()> {
        self.shared
            .counters
            .head_truncations
            .fetch_add(1, Ordering::Relaxed);
        let mut state = lock(&self.state);
        if position > state.write_position() {
            return Err(StorageError::truncate_failed(
                "truncate memory log head",
                invalid_position(format!(
                    "head {} beyond write position {}",
                    position,
                    state.write_position()
                )),
            ));
        }
        if position > state.head {
            let drop = (position - state.head) as usize;
            state.data.drain(..drop);
            state.head = position;
        }
        Ok(())
    }

    async fn truncate_tail(&self, position: u64) -> StorageResult<()> {
        self.shared
            .counters
            .tail_truncations
            .fetch_add(1, Ordering::Relaxed);
        let mut state = lock(&self.state);
        if position < state.head {
            return Err(StorageError::truncate_failed(
                "truncate memory log tail",
                invalid_position(format!("tail {} before head {}", position, state.head)),
            ));
        }
        let keep = (position - state.head) as usize;
        state.data.truncate(keep);
        state.durable_end = state.durable_end.min(position);
        Ok(())
    }

    async fn read_from(&self, position: u64) -> StorageResult<Vec<u8>> {
        let state = lock(&self.state);
        if position < state.head || position > state.write_position() {
            return Err(StorageError::read_failed(
                "read memory log",
                invalid_position(format!(
                    "read at {} outside [{}, {}]",
                    position,
                    state.head,
                    state.write_position()
                )),
            ));
        }
        Ok(state.data[(position - state.head) as usize..].to_vec())
    }

    fn head_position(&self) -> u64 {
        lock(&self.state).head
    }

    fn write_position(&self) -> u64 {
        lock(&self.state).write_position()
    }
}

/// Log store kept entirely in memory
#[derive(Default)]
pub struct MemoryLogStore {
    shared: Arc<Shared>,
    streams: Mutex<HashMap<String, Arc<MemoryLogStream>>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next append on any stream fail
    pub fn fail_next_append(&self) {
        self.shared.fail_next_append.store(true, Ordering::SeqCst);
    }

    /// Make the next flush on any stream fail
    pub fn fail_next_flush(&self) {
        self.shared.fail_next_flush.store(true, Ordering::SeqCst);
    }

    pub fn counters(&self) -> &StorageCounters {
        &self.shared.counters
    }

    /// Drop every unflushed byte of every stream
    pub fn simulate_crash(&self) {
        for stream in lock(&self.streams).values() {
            stream.drop_unflushed();
        }
    }

    /// Aliases currently present, sorted
    pub fn aliases(&self) -> Vec<String> {
        let mut aliases: Vec<_> = lock(&self.streams).keys().cloned().collect();
        aliases.sort();
        aliases
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn open(&self, alias: &str) -> StorageResult<Arc<dyn LogStream>> {
        let streams = lock(&self.streams);
        match streams.get(alias) {
            Some(stream) => Ok(Arc::clone(stream) as Arc<dyn LogStream>),
            None => Err(StorageError::not_found(alias)),
        }
    }

    async fn create(&self, alias: &str) -> StorageResult<Arc<dyn LogStream>> {
        let stream = Arc::new(MemoryLogStream::new(Arc::clone(&self.shared)));
        lock(&self.streams).insert(alias.to_string(), Arc::clone(&stream));
        Ok(stream)
    }

    async fn exists(&self, alias: &str) -> StorageResult<bool> {
        Ok(lock(&self.streams).contains_key(alias))
    }

    async fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        let mut streams = lock(&self.streams);
        if streams.contains_key(to) {
            return Err(StorageError::alias_failed(
                format!("rename '{}' to '{}'", from, to),
                io::Error::new(io::ErrorKind::AlreadyExists, "target alias exists"),
            ));
        }
        let stream = streams
            .remove(from)
            .ok_or_else(|| StorageError::not_found(from))?;
        streams.insert(to.to_string(), stream);
        Ok(())
    }

    async fn delete(&self, alias: &str) -> StorageResult<()> {
        lock(&self.streams).remove(alias);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageErrorCode;

    #[tokio::test]
    async fn test_positions_survive_head_truncation() {
        let store = MemoryLogStore::new();
        let stream = store.create("current").await.unwrap();

        stream.append(b"0123456789").await.unwrap();
        stream.truncate_head(4).await.unwrap();

        assert_eq!(stream.head_position(), 4);
        assert_eq!(stream.write_position(), 10);
        assert_eq!(stream.read_from(6).await.unwrap(), b"6789");
        assert!(stream.read_from(2).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_faults_fire_once() {
        let store = MemoryLogStore::new();
        let stream = store.create("current").await.unwrap();

        store.fail_next_flush();
        stream.append(b"abc").await.unwrap();
        let err = stream.flush().await.unwrap_err();
        assert_eq!(err.code(), StorageErrorCode::FlushFailed);
        stream.flush().await.unwrap();

        store.fail_next_append();
        assert!(stream.append(b"d").await.is_err());
        assert_eq!(store.counters().appends(), 2);
        assert_eq!(store.counters().flushes(), 2);
    }

    #[tokio::test]
    async fn test_crash_drops_unflushed_bytes() {
        let store = MemoryLogStore::new();
        let stream = store.create("current").await.unwrap();

        stream.append(b"durable").await.unwrap();
        stream.flush().await.unwrap();
        stream.append(b"lost").await.unwrap();

        store.simulate_crash();
        assert_eq!(stream.read_from(0).await.unwrap(), b"durable");
    }

    #[tokio::test]
    async fn test_rename_requires_free_target() {
        let store = MemoryLogStore::new();
        store.create("current").await.unwrap();
        store.create("copy").await.unwrap();

        assert!(store.rename("copy", "current").await.is_err());
        store.delete("current").await.unwrap();
        store.rename("copy", "current").await.unwrap();
        assert_eq!(store.aliases(), vec!["current".to_string()]);
        assert!(store.open("copy").await.is_err());
    }
}

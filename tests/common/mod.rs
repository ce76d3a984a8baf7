//! Shared collaborators for the integration suites
//!
//! - `SequenceReplicator`: assigns LSNs 1, 2, 3, ... and can be told to fail
//! - `RecordingProvider`: records every apply and unlock, and can be told
//!   to fail one apply
//! - `VecStream`: a replication stream over a fixed list of operations

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use replog::errors::{LogError, LogResult};
use replog::ordering::{
    ReplicationError, ReplicationErrorKind, ReplicationOperation, ReplicationResult,
    ReplicationStream, Replicator,
};
use replog::processor::{ApplyContext, StateProvider};
use replog::record::{encode_logical, LogRecord, Lsn, OperationContext, RecordBody, TransactionId};
use replog::storage::{LogStore, MemoryLogStore};
use replog::{ReplicatedLog, ReplicatorConfig};

// =============================================================================
// Replicator
// =============================================================================

pub struct SequenceReplicator {
    next_lsn: AtomicI64,
    failure: Mutex<Option<ReplicationErrorKind>>,
}

impl SequenceReplicator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(lsn: Lsn) -> Self {
        Self {
            next_lsn: AtomicI64::new(lsn),
            failure: Mutex::new(None),
        }
    }

    pub fn fail_next(&self, kind: ReplicationErrorKind) {
        *self.failure.lock().unwrap() = Some(kind);
    }
}

#[async_trait]
impl Replicator for SequenceReplicator {
    async fn replicate(&self, _bytes: Vec<u8>) -> ReplicationResult<Lsn> {
        if let Some(kind) = self.failure.lock().unwrap().take() {
            return Err(ReplicationError::new(kind, "injected"));
        }
        Ok(self.next_lsn.fetch_add(1, Ordering::SeqCst))
    }
}

// =============================================================================
// State provider
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedOperation {
    pub lsn: Lsn,
    pub transaction_id: TransactionId,
    pub data: Vec<u8>,
    pub context: ApplyContext,
}

#[derive(Default)]
pub struct RecordingProvider {
    applied: Mutex<Vec<AppliedOperation>>,
    unlocked: Mutex<Vec<Lsn>>,
    checkpoints: AtomicU64,
    failure: Mutex<Option<(Lsn, ApplyContext)>>,
}

impl RecordingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied(&self) -> Vec<AppliedOperation> {
        self.applied.lock().unwrap().clone()
    }

    pub fn applied_with(&self, context: ApplyContext) -> Vec<AppliedOperation> {
        self.applied()
            .into_iter()
            .filter(|op| op.context == context)
            .collect()
    }

    /// LSNs of the operations whose locks were released, in release order
    pub fn unlocked(&self) -> Vec<Lsn> {
        self.unlocked.lock().unwrap().clone()
    }

    /// Fail the next apply of `lsn` under `context`; it is not recorded
    pub fn fail_apply(&self, lsn: Lsn, context: ApplyContext) {
        *self.failure.lock().unwrap() = Some((lsn, context));
    }

    pub fn checkpoints(&self) -> u64 {
        self.checkpoints.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StateProvider for RecordingProvider {
    async fn apply(
        &self,
        lsn: Lsn,
        transaction_id: TransactionId,
        _metadata: &[u8],
        data: &[u8],
        context: ApplyContext,
    ) -> LogResult<Option<OperationContext>> {
        {
            let mut failure = self.failure.lock().unwrap();
            if *failure == Some((lsn, context)) {
                failure.take();
                return Err(LogError::StateProvider(format!("injected failure at lsn {}", lsn)));
            }
        }
        self.applied.lock().unwrap().push(AppliedOperation {
            lsn,
            transaction_id,
            data: data.to_vec(),
            context,
        });
        // redo holds a lock until the transaction completes
        if context.is_redo() {
            Ok(Some(Box::new(lsn)))
        } else {
            Ok(None)
        }
    }

    fn unlock(&self, context: OperationContext) {
        if let Ok(lsn) = context.downcast::<Lsn>() {
            self.unlocked.lock().unwrap().push(*lsn);
        }
    }

    async fn prepare_checkpoint(&self, _lsn: Lsn) -> LogResult<()> {
        Ok(())
    }

    async fn perform_checkpoint(&self) -> LogResult<()> {
        self.checkpoints.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn complete_checkpoint(&self) -> LogResult<()> {
        Ok(())
    }
}

// =============================================================================
// Replication stream
// =============================================================================

pub struct VecStream {
    operations: VecDeque<ReplicationOperation>,
    pub acknowledged: Vec<Lsn>,
}

impl VecStream {
    pub fn new(operations: Vec<ReplicationOperation>) -> Self {
        Self {
            operations: operations.into(),
            acknowledged: Vec::new(),
        }
    }
}

#[async_trait]
impl ReplicationStream for VecStream {
    async fn next(&mut self) -> ReplicationResult<Option<ReplicationOperation>> {
        Ok(self.operations.pop_front())
    }

    fn acknowledge(&mut self, lsn: Lsn) {
        self.acknowledged.push(lsn);
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Serialize `body` the way a primary ships it at `lsn`
pub fn shipped(lsn: Lsn, body: RecordBody) -> ReplicationOperation {
    let record = LogRecord::new(lsn, body);
    ReplicationOperation::new(lsn, encode_logical(&record))
}

pub fn small_config() -> ReplicatorConfig {
    ReplicatorConfig {
        max_pending_flush_bytes: 1 << 20,
        checkpoint_threshold_bytes: 1 << 20,
        min_log_size_bytes: 1 << 10,
        index_interval_bytes: 1 << 30,
        ..ReplicatorConfig::default()
    }
}

pub struct TestLog {
    pub log: ReplicatedLog,
    pub store: Arc<MemoryLogStore>,
    pub replicator: Arc<SequenceReplicator>,
    pub provider: Arc<RecordingProvider>,
}

pub async fn open_memory_log() -> TestLog {
    let store = Arc::new(MemoryLogStore::new());
    let replicator = Arc::new(SequenceReplicator::new());
    let provider = Arc::new(RecordingProvider::new());
    let log = ReplicatedLog::open(
        small_config(),
        Arc::clone(&store) as Arc<dyn LogStore>,
        Arc::clone(&replicator) as Arc<dyn Replicator>,
        Arc::clone(&provider) as Arc<dyn StateProvider>,
    )
    .await
    .expect("open log");
    TestLog {
        log,
        store,
        replicator,
        provider,
    }
}

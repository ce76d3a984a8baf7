//! The log record
//!
//! A record is created with a body and an LSN (or `INVALID_LSN` until the
//! replicator assigns one). The commit pipeline assigns its PSN, position,
//! length and physical back-link exactly once when it is buffered. After that
//! the record is immutable apart from its completion signals and the
//! processing state attached by the record processor.
//!
//! Equality is defined by (record type, LSN, PSN).

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use super::body::{LogHead, RecordBody};
use super::completion::CompletionSignal;
use super::types::{Epoch, LogRecordType, Lsn, Psn, INVALID_LSN, INVALID_PSN};
use crate::sync::lock;

/// Opaque lock/context handle returned by the state provider on apply
pub type OperationContext = Box<dyn Any + Send + Sync>;

/// Back-link from a record to the nearest preceding physical record.
///
/// `Unresolved` is distinct from `None`: the former means the pipeline has
/// not linked the record yet, the latter that it has no predecessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysicalLink {
    Unresolved,
    None,
    Psn(Psn),
}

impl PhysicalLink {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, PhysicalLink::Unresolved)
    }

    pub fn psn(&self) -> Option<Psn> {
        match self {
            PhysicalLink::Psn(psn) => Some(*psn),
            _ => None,
        }
    }
}

/// Lifecycle of a BeginCheckpoint record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointState {
    Invalid,
    Ready,
    Applied,
    Faulted,
    Aborted,
    Completed,
}

/// Lifecycle of a TruncateHead record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncationState {
    Invalid,
    Ready,
    Applied,
    Faulted,
    Aborted,
    Completed,
}

impl TruncationState {
    /// No further work will happen for this truncation
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TruncationState::Faulted | TruncationState::Aborted | TruncationState::Completed
        )
    }
}

struct ProcessingState {
    operation_context: Option<OperationContext>,
    /// Undo already applied by the record's aborted transaction
    rolled_back: bool,
    checkpoint_state: CheckpointState,
    truncation_state: TruncationState,
}

/// A single entry of the log
pub struct LogRecord {
    record_type: LogRecordType,
    lsn: AtomicI64,
    psn: AtomicI64,
    position: OnceLock<u64>,
    length: OnceLock<u32>,
    previous_physical: Mutex<PhysicalLink>,
    body: RecordBody,
    flushed: CompletionSignal,
    applied: CompletionSignal,
    processed: CompletionSignal,
    processing: Mutex<ProcessingState>,
}

impl LogRecord {
    /// Create a record that has not been inserted into a log yet
    pub fn new(lsn: Lsn, body: RecordBody) -> Arc<Self> {
        Arc::new(Self::unlinked(lsn, body))
    }

    /// Create a logical record whose LSN is assigned on replication
    pub fn pending(body: RecordBody) -> Arc<Self> {
        Self::new(INVALID_LSN, body)
    }

    /// Rebuild a record read back from durable storage.
    ///
    /// Its flushed signal is already resolved.
    pub fn recovered(
        lsn: Lsn,
        psn: Psn,
        position: u64,
        length: u32,
        previous_physical: PhysicalLink,
        body: RecordBody,
    ) -> Arc<Self> {
        let record = Self::unlinked(lsn, body);
        record.set_psn(psn);
        record.set_placement(position, length);
        record.set_previous_physical(previous_physical);
        record.flushed.resolve(Ok(()));
        Arc::new(record)
    }

    fn unlinked(lsn: Lsn, body: RecordBody) -> Self {
        let record_type = body.record_type();
        let checkpoint_state = if record_type == LogRecordType::BeginCheckpoint {
            CheckpointState::Ready
        } else {
            CheckpointState::Invalid
        };
        let truncation_state = if record_type == LogRecordType::TruncateHead {
            TruncationState::Ready
        } else {
            TruncationState::Invalid
        };
        Self {
            record_type,
            lsn: AtomicI64::new(lsn),
            psn: AtomicI64::new(INVALID_PSN),
            position: OnceLock::new(),
            length: OnceLock::new(),
            previous_physical: Mutex::new(PhysicalLink::Unresolved),
            body,
            flushed: CompletionSignal::new(),
            applied: CompletionSignal::new(),
            processed: CompletionSignal::new(),
            processing: Mutex::new(ProcessingState {
                operation_context: None,
                rolled_back: false,
                checkpoint_state,
                truncation_state,
            }),
        }
    }

    pub fn record_type(&self) -> LogRecordType {
        self.record_type
    }

    pub fn body(&self) -> &RecordBody {
        &self.body
    }

    pub fn lsn(&self) -> Lsn {
        self.lsn.load(Ordering::Acquire)
    }

    /// Assign the LSN.
    ///
    /// Logical records get theirs from the replicator; physical records take
    /// the tail LSN at insertion time.
    pub fn set_lsn(&self, lsn: Lsn) {
        self.lsn.store(lsn, Ordering::Release);
    }

    pub fn psn(&self) -> Psn {
        self.psn.load(Ordering::Acquire)
    }

    pub(crate) fn set_psn(&self, psn: Psn) {
        let previous = self.psn.swap(psn, Ordering::AcqRel);
        assert_eq!(previous, INVALID_PSN, "psn assigned twice to {}", self);
    }

    /// Byte offset of the record in the log stream, once inserted
    pub fn position(&self) -> Option<u64> {
        self.position.get().copied()
    }

    /// Serialized frame length, once inserted
    pub fn length(&self) -> Option<u32> {
        self.length.get().copied()
    }

    /// Offset just past the end of the record
    pub fn end_position(&self) -> Option<u64> {
        Some(self.position()? + u64::from(self.length()?))
    }

    pub(crate) fn set_placement(&self, position: u64, length: u32) {
        assert!(
            self.position.set(position).is_ok(),
            "position assigned twice to {}",
            self
        );
        assert!(
            self.length.set(length).is_ok(),
            "length assigned twice to {}",
            self
        );
    }

    pub fn previous_physical(&self) -> PhysicalLink {
        *lock(&self.previous_physical)
    }

    /// Resolve the back-link. A resolved link never changes.
    pub(crate) fn set_previous_physical(&self, link: PhysicalLink) {
        assert!(link.is_resolved(), "cannot set an unresolved link");
        let mut current = lock(&self.previous_physical);
        assert!(
            !current.is_resolved(),
            "previous physical link resolved twice for {}",
            self
        );
        *current = link;
    }

    /// This record as a log head. Only Indexing records carry an epoch.
    pub fn log_head(&self) -> LogHead {
        let epoch = match &self.body {
            RecordBody::Indexing { current_epoch, .. } => *current_epoch,
            _ => Epoch::ZERO,
        };
        LogHead {
            epoch,
            lsn: self.lsn(),
            psn: self.psn(),
            position: self.position().unwrap_or(0),
        }
    }

    pub fn flushed(&self) -> &CompletionSignal {
        &self.flushed
    }

    pub fn applied(&self) -> &CompletionSignal {
        &self.applied
    }

    pub fn processed(&self) -> &CompletionSignal {
        &self.processed
    }

    pub fn set_operation_context(&self, context: Option<OperationContext>) {
        lock(&self.processing).operation_context = context;
    }

    /// Take the held operation context; a context is released only once
    pub fn take_operation_context(&self) -> Option<OperationContext> {
        lock(&self.processing).operation_context.take()
    }

    pub fn is_rolled_back(&self) -> bool {
        lock(&self.processing).rolled_back
    }

    pub fn set_rolled_back(&self, rolled_back: bool) {
        lock(&self.processing).rolled_back = rolled_back;
    }

    pub fn checkpoint_state(&self) -> CheckpointState {
        lock(&self.processing).checkpoint_state
    }

    pub fn set_checkpoint_state(&self, state: CheckpointState) {
        lock(&self.processing).checkpoint_state = state;
    }

    pub fn truncation_state(&self) -> TruncationState {
        lock(&self.processing).truncation_state
    }

    pub fn set_truncation_state(&self, state: TruncationState) {
        lock(&self.processing).truncation_state = state;
    }
}

impl PartialEq for LogRecord {
    fn eq(&self, other: &Self) -> bool {
        self.record_type == other.record_type
            && self.lsn() == other.lsn()
            && self.psn() == other.psn()
    }
}

impl Eq for LogRecord {}

impl fmt::Debug for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogRecord")
            .field("record_type", &self.record_type)
            .field("lsn", &self.lsn())
            .field("psn", &self.psn())
            .field("position", &self.position())
            .field("length", &self.length())
            .field("previous_physical", &self.previous_physical())
            .finish()
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(lsn={}, psn={})",
            self.record_type,
            self.lsn(),
            self.psn()
        )
    }
}

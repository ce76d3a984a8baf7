//! Replicated order coordinator
//!
//! Presents one gap-free LSN stream to the commit pipeline:
//! - A logical record whose LSN is the tail LSN + 1 is inserted at once
//! - A record further ahead waits in the ordering queue
//! - Every insert drains the now-contiguous front of the queue
//!
//! Physical chain records (Indexing, checkpoint, TruncateHead, Information,
//! TruncateTail) are inserted under the same ordering lock and carry the
//! tail LSN at insertion time.
//!
//! Replication runs outside the ordering lock. The ordering lock is never
//! held together with the log manager's reader lock.

use std::collections::BTreeMap;
use std::mem;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::errors::ReplicationError;
use super::policy::{ThresholdTruncationPolicy, TruncationPolicy};
use super::replicator::Replicator;
use super::role::ReplicaRole;
use super::transactions::TransactionMap;
use crate::config::ReplicatorConfig;
use crate::errors::{FaultLatch, LogError, LogResult};
use crate::log::{LogManager, RecoveryInformation};
use crate::observability::{LogMetrics, RateLimitedWarning};
use crate::pipeline::PhysicalLogWriter;
use crate::record::{
    encode_logical, BeginCheckpointBody, CheckpointState, EndCheckpointBody, Epoch,
    InformationEvent, LogRecord, LogRecordType, Lsn, Psn, RecordBody, INVALID_PSN,
};
use crate::sync::{lock, read, write};

struct OrderingState {
    /// Records waiting for their predecessors, by LSN
    queue: BTreeMap<Lsn, Arc<LogRecord>>,
    tail_lsn: Lsn,
    tail_epoch: Epoch,
    last_linked_physical: Option<Arc<LogRecord>>,
    last_index: Option<Arc<LogRecord>>,
    last_in_progress_checkpoint: Option<Arc<LogRecord>>,
    last_completed_end_checkpoint: Option<Arc<LogRecord>>,
    last_in_progress_truncate_head: Option<Arc<LogRecord>>,
    /// Indexing record at the log head
    current_head: Arc<LogRecord>,
    last_stable_lsn: Lsn,
}

impl OrderingState {
    fn new(info: &RecoveryInformation) -> Self {
        if let Some(begin) = &info.last_in_progress_checkpoint {
            warn!(lsn = begin.lsn(), psn = begin.psn(), "abandoning checkpoint without end record");
            begin.set_checkpoint_state(CheckpointState::Aborted);
        }
        Self {
            queue: BTreeMap::new(),
            tail_lsn: info.tail_lsn,
            tail_epoch: info.tail_epoch,
            last_linked_physical: info.last_linked_physical.clone(),
            last_index: info.last_index.clone(),
            last_in_progress_checkpoint: None,
            last_completed_end_checkpoint: info.last_completed_end_checkpoint.clone(),
            last_in_progress_truncate_head: None,
            current_head: Arc::clone(&info.current_head),
            last_stable_lsn: info.last_stable_lsn,
        }
    }

    fn linked_psn(&self) -> Psn {
        self.last_linked_physical
            .as_ref()
            .map_or(INVALID_PSN, |r| r.psn())
    }
}

/// Orders logical records and drives the physical chain
pub struct ReplicatedLogManager {
    log_manager: Arc<LogManager>,
    replicator: Arc<dyn Replicator>,
    policy: Arc<dyn TruncationPolicy>,
    transactions: Arc<TransactionMap>,
    fault: Arc<FaultLatch>,
    metrics: Arc<LogMetrics>,
    flush_trigger_bytes: u64,
    replication_warning: RateLimitedWarning,
    role: RwLock<ReplicaRole>,
    state: Mutex<OrderingState>,
}

impl ReplicatedLogManager {
    pub fn new(
        log_manager: Arc<LogManager>,
        replicator: Arc<dyn Replicator>,
        transactions: Arc<TransactionMap>,
        fault: Arc<FaultLatch>,
        metrics: Arc<LogMetrics>,
        config: &ReplicatorConfig,
        info: &RecoveryInformation,
    ) -> Self {
        Self {
            log_manager,
            replicator,
            policy: Arc::new(ThresholdTruncationPolicy::from_config(config)),
            transactions,
            fault,
            metrics,
            flush_trigger_bytes: config.flush_trigger_bytes(),
            replication_warning: RateLimitedWarning::new(
                "replication_failure",
                config.warning_interval(),
            ),
            role: RwLock::new(ReplicaRole::Unknown),
            state: Mutex::new(OrderingState::new(info)),
        }
    }

    /// Replace the threshold policy
    pub fn with_policy(mut self, policy: Arc<dyn TruncationPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Insert a logical record in LSN order, or queue it until its
    /// predecessors arrive.
    ///
    /// # Panics
    ///
    /// Panics if the record's LSN is at or below the tail, or already queued.
    ///
    /// If the writer rejects a record, that record and everything still
    /// queued behind it fail with the writer's fault.
    pub fn append(&self, record: Arc<LogRecord>, is_primary: bool) -> LogResult<()> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        let lsn = record.lsn();
        if lsn > state.tail_lsn + 1 {
            let fault = self.log_manager.writer().ok().and_then(|writer| writer.fault());
            if let Some(fault) = fault {
                self.abandon_locked(state, Some(record), &fault);
                return Err(fault);
            }
            debug!(lsn, tail_lsn = state.tail_lsn, "record queued for ordering");
            let previous = state.queue.insert(lsn, record);
            assert!(previous.is_none(), "lsn {} queued twice", lsn);
            return Ok(());
        }

        let mut next = Some(record);
        let outcome = match self.log_manager.writer() {
            Ok(writer) => loop {
                let Some(record) = next.take() else {
                    break Ok(());
                };
                let lsn = record.lsn();
                if let Err(e) = self.append_locked(state, &writer, Arc::clone(&record), is_primary) {
                    if state.tail_lsn < lsn {
                        next = Some(record);
                    }
                    break Err(e);
                }
                let want = state.tail_lsn + 1;
                next = match state.queue.first_entry() {
                    Some(entry) if *entry.key() == want => Some(entry.remove()),
                    _ => None,
                };
            },
            Err(e) => Err(e),
        };
        if let Err(e) = &outcome {
            self.abandon_locked(state, next, e);
        }
        outcome
    }

    /// Fail `rejected` and every queued record. None of them reached the
    /// writer, so nothing else will ever resolve their signals.
    fn abandon_locked(&self, state: &mut OrderingState, rejected: Option<Arc<LogRecord>>, error: &LogError) {
        let fault = self
            .log_manager
            .writer()
            .ok()
            .and_then(|writer| writer.fault())
            .unwrap_or_else(|| error.clone());
        let queued = mem::take(&mut state.queue);
        let abandoned: Vec<_> = rejected.into_iter().chain(queued.into_values()).collect();
        if abandoned.is_empty() {
            return;
        }
        warn!(
            records = abandoned.len(),
            tail_lsn = state.tail_lsn,
            error = %fault,
            "writer rejected records, failing them and the ordering queue"
        );
        for record in abandoned {
            record.flushed().resolve(Err(fault.clone()));
            record.applied().resolve(Err(fault.clone()));
            record.processed().resolve(Err(fault.clone()));
        }
    }

    fn append_locked(
        &self,
        state: &mut OrderingState,
        writer: &Arc<PhysicalLogWriter>,
        record: Arc<LogRecord>,
        is_primary: bool,
    ) -> LogResult<()> {
        assert_eq!(
            record.lsn(),
            state.tail_lsn + 1,
            "{} appended after tail lsn {}",
            record,
            state.tail_lsn
        );
        let buffered = writer.insert(Arc::clone(&record))?;
        state.tail_lsn = record.lsn();
        self.transactions.track(&record);

        let boundary = match record.body() {
            RecordBody::UpdateEpoch { epoch, .. } => {
                state.tail_epoch = *epoch;
                true
            }
            RecordBody::Barrier { .. } => true,
            _ => false,
        };
        if boundary && is_primary {
            self.checkpoint_if_necessary_locked(state, writer)?;
        }
        self.index_if_necessary_locked(state, writer)?;

        if boundary || buffered >= self.flush_trigger_bytes {
            writer.start_flush("append");
        }
        Ok(())
    }

    fn insert_physical_locked(
        &self,
        state: &mut OrderingState,
        writer: &PhysicalLogWriter,
        body: RecordBody,
    ) -> LogResult<Arc<LogRecord>> {
        let record = LogRecord::new(state.tail_lsn, body);
        writer.insert(Arc::clone(&record))?;
        if record.record_type().is_linked_physical() {
            state.last_linked_physical = Some(Arc::clone(&record));
        }
        Ok(record)
    }

    fn index_if_necessary_locked(
        &self,
        state: &mut OrderingState,
        writer: &PhysicalLogWriter,
    ) -> LogResult<()> {
        let last_index_position = state
            .last_index
            .as_ref()
            .and_then(|r| r.position())
            .unwrap_or(0);
        if !self
            .policy
            .should_index(writer.tail_position(), last_index_position)
        {
            return Ok(());
        }
        let body = RecordBody::Indexing {
            current_epoch: state.tail_epoch,
            linked_physical_psn: state.linked_psn(),
        };
        let record = self.insert_physical_locked(state, writer, body)?;
        debug!(lsn = record.lsn(), psn = record.psn(), "indexing record inserted");
        state.last_index = Some(record);
        Ok(())
    }

    fn checkpoint_if_necessary_locked(
        &self,
        state: &mut OrderingState,
        writer: &PhysicalLogWriter,
    ) -> LogResult<()> {
        if state.last_in_progress_checkpoint.is_some() {
            return Ok(());
        }
        let last_checkpoint_position = self
            .completed_begin_locked(state)
            .and_then(|r| r.position())
            .unwrap_or(0);
        if self
            .policy
            .should_checkpoint(writer.tail_position(), last_checkpoint_position)
        {
            self.begin_checkpoint_locked(state, writer, false)?;
        }
        Ok(())
    }

    fn begin_checkpoint_locked(
        &self,
        state: &mut OrderingState,
        writer: &PhysicalLogWriter,
        is_first_checkpoint_on_full_copy: bool,
    ) -> LogResult<Arc<LogRecord>> {
        if let Some(in_progress) = &state.last_in_progress_checkpoint {
            panic!("checkpoint begun while {} is in progress", in_progress);
        }
        let (pending_lsn, pending_psn, pending_position) = match self.transactions.earliest_pending()
        {
            Some(record) => (record.lsn(), record.psn(), record.position().unwrap_or(0)),
            None => {
                let next = writer.position();
                (state.tail_lsn, next.next_psn, next.next_position)
            }
        };
        let body = RecordBody::BeginCheckpoint(BeginCheckpointBody {
            earliest_pending_transaction_lsn: pending_lsn,
            earliest_pending_transaction_psn: pending_psn,
            earliest_pending_transaction_position: pending_position,
            epoch: state.tail_epoch,
            is_first_checkpoint_on_full_copy,
            periodic_checkpoint_time_ms: Utc::now().timestamp_millis(),
            linked_physical_psn: state.linked_psn(),
        });
        let record = self.insert_physical_locked(state, writer, body)?;
        state.last_in_progress_checkpoint = Some(Arc::clone(&record));
        info!(
            phase = "Initiate",
            lsn = record.lsn(),
            psn = record.psn(),
            earliest_pending_lsn = pending_lsn,
            "checkpoint"
        );
        Ok(record)
    }

    /// Insert a BeginCheckpoint record and start flushing it
    pub fn begin_checkpoint(
        &self,
        is_first_checkpoint_on_full_copy: bool,
    ) -> LogResult<Arc<LogRecord>> {
        let mut state = lock(&self.state);
        if let Some(in_progress) = &state.last_in_progress_checkpoint {
            return Err(LogError::InvalidOperation(format!(
                "checkpoint {} is already in progress",
                in_progress
            )));
        }
        let writer = self.log_manager.writer()?;
        let record =
            self.begin_checkpoint_locked(&mut state, &writer, is_first_checkpoint_on_full_copy)?;
        drop(state);
        writer.start_flush("begin_checkpoint");
        Ok(record)
    }

    /// Insert the EndCheckpoint record for the in-progress `begin`
    ///
    /// # Panics
    ///
    /// Panics if `begin` is not the in-progress checkpoint.
    pub fn end_checkpoint(&self, begin: &Arc<LogRecord>) -> LogResult<Arc<LogRecord>> {
        let mut state = lock(&self.state);
        let in_progress = state
            .last_in_progress_checkpoint
            .as_ref()
            .map_or(false, |r| Arc::ptr_eq(r, begin));
        assert!(in_progress, "end checkpoint for {} which is not in progress", begin);

        let writer = self.log_manager.writer()?;
        let body = RecordBody::EndCheckpoint(EndCheckpointBody {
            log_head: state.current_head.log_head(),
            last_stable_lsn: state.last_stable_lsn,
            last_completed_begin_checkpoint_psn: begin.psn(),
            linked_physical_psn: state.linked_psn(),
        });
        let end = self.insert_physical_locked(&mut state, &writer, body)?;
        state.last_completed_end_checkpoint = Some(Arc::clone(&end));
        state.last_in_progress_checkpoint = None;
        drop(state);

        writer.start_flush("end_checkpoint");
        Ok(end)
    }

    /// Insert a CompleteCheckpoint record retiring the last end checkpoint
    pub fn complete_checkpoint(&self) -> LogResult<Arc<LogRecord>> {
        let mut state = lock(&self.state);
        let writer = self.log_manager.writer()?;
        let body = RecordBody::CompleteCheckpoint {
            log_head: state.current_head.log_head(),
            linked_physical_psn: state.linked_psn(),
        };
        let record = self.insert_physical_locked(&mut state, &writer, body)?;
        drop(state);

        writer.start_flush("complete_checkpoint");
        Ok(record)
    }

    /// Give up on the in-progress checkpoint `begin`
    pub fn abort_checkpoint(&self, begin: &Arc<LogRecord>) {
        let mut state = lock(&self.state);
        let in_progress = state
            .last_in_progress_checkpoint
            .as_ref()
            .map_or(false, |r| Arc::ptr_eq(r, begin));
        if in_progress {
            state.last_in_progress_checkpoint = None;
        }
        begin.set_checkpoint_state(CheckpointState::Aborted);
    }

    fn completed_begin_locked(&self, state: &OrderingState) -> Option<Arc<LogRecord>> {
        match state.last_completed_end_checkpoint.as_ref()?.body() {
            RecordBody::EndCheckpoint(body) => self
                .log_manager
                .arena()
                .get(body.last_completed_begin_checkpoint_psn),
            _ => None,
        }
    }

    /// BeginCheckpoint record of the last completed checkpoint
    pub fn last_completed_begin_checkpoint(&self) -> Option<Arc<LogRecord>> {
        let state = lock(&self.state);
        self.completed_begin_locked(&state)
    }

    /// Insert a TruncateHead record if the log is large enough and a new
    /// head can be found
    pub fn truncate_head_if_necessary(&self) -> LogResult<Option<Arc<LogRecord>>> {
        let mut state = lock(&self.state);
        if let Some(in_progress) = &state.last_in_progress_truncate_head {
            if !in_progress.truncation_state().is_terminal() {
                return Ok(None);
            }
        }
        let writer = self.log_manager.writer()?;
        let head_position = state.current_head.position().unwrap_or(0);
        let tail_position = writer.tail_position();
        if !self.policy.should_truncate_head(head_position, tail_position) {
            return Ok(None);
        }
        let candidate = match self.find_head_candidate_locked(&state, tail_position) {
            Some(candidate) => candidate,
            None => {
                debug!(head_position, tail_position, "no head truncation candidate");
                return Ok(None);
            }
        };

        let body = RecordBody::TruncateHead {
            log_head: candidate.log_head(),
            is_stable: true,
            periodic_truncation_time_ms: Utc::now().timestamp_millis(),
            linked_physical_psn: state.linked_psn(),
        };
        let record = self.insert_physical_locked(&mut state, &writer, body)?;
        debug!(
            lsn = record.lsn(),
            new_head_psn = candidate.psn(),
            new_head_position = candidate.position(),
            "head truncation record inserted"
        );
        state.current_head = candidate;
        state.last_in_progress_truncate_head = Some(Arc::clone(&record));
        drop(state);

        writer.start_flush("truncate_head");
        Ok(Some(record))
    }

    /// Walk the physical chain back from the last completed checkpoint for
    /// an Indexing record below the earliest pending transaction
    fn find_head_candidate_locked(
        &self,
        state: &OrderingState,
        tail_position: u64,
    ) -> Option<Arc<LogRecord>> {
        let begin = self.completed_begin_locked(state)?;
        let earliest_pending_position = match begin.body() {
            RecordBody::BeginCheckpoint(body) => body.earliest_pending_transaction_position,
            _ => return None,
        };
        let head_position = state.current_head.position()?;
        let arena = self.log_manager.arena();

        let mut cursor = arena.previous_physical(&begin);
        while let Some(record) = cursor {
            let position = record.position()?;
            if position <= head_position {
                return None;
            }
            if record.record_type() == LogRecordType::Indexing
                && position <= earliest_pending_position
                && self
                    .policy
                    .is_good_log_head_candidate(position, tail_position)
            {
                return Some(record);
            }
            cursor = arena.previous_physical(&record);
        }
        None
    }

    /// Advance the stable LSN once a barrier is processed
    pub fn on_barrier_processed(&self, record: &LogRecord) {
        let recorded = match record.body() {
            RecordBody::Barrier { last_stable_lsn } => *last_stable_lsn,
            _ => return,
        };
        let stable = if self.role().is_primary() {
            record.lsn()
        } else {
            recorded
        };
        {
            let mut state = lock(&self.state);
            if stable <= state.last_stable_lsn {
                return;
            }
            state.last_stable_lsn = stable;
        }
        let released = self.transactions.remove_stable(stable);
        debug!(stable_lsn = stable, released, "stable lsn advanced");
    }

    /// Replicate a logical record and append it with the LSN it was given.
    ///
    /// Expected replication failures become `LogError::NotPrimary`;
    /// unexpected ones fault the partition.
    pub async fn replicate_and_log(&self, record: &Arc<LogRecord>) -> LogResult<Lsn> {
        if !self.role().is_primary() {
            return Err(LogError::NotPrimary);
        }
        if let Some(fault) = self.fault.get() {
            return Err(fault);
        }
        if record.record_type().is_transactional() {
            if let Some(reason) = self.throttle_reason()? {
                self.metrics.increment_throttled_writes();
                return Err(LogError::Throttled(reason));
            }
        }

        let bytes = encode_logical(record);
        match self.replicator.replicate(bytes).await {
            Ok(lsn) => {
                record.set_lsn(lsn);
                self.append(Arc::clone(record), true)?;
                Ok(lsn)
            }
            Err(e) if e.is_expected() => {
                self.replication_warning.warn(format_args!(
                    "replication of {} failed: {}",
                    record.record_type(),
                    e
                ));
                Err(LogError::NotPrimary)
            }
            Err(e) => Err(self.fault_on_replication(record, e)),
        }
    }

    fn fault_on_replication(&self, record: &LogRecord, e: ReplicationError) -> LogError {
        error!(
            record_type = %record.record_type(),
            error = %e,
            "unexpected replication failure, faulting partition"
        );
        let err = LogError::from(e);
        self.fault.latch(err.clone());
        err
    }

    fn throttle_reason(&self) -> LogResult<Option<String>> {
        let writer = self.log_manager.writer()?;
        if writer.should_throttle() {
            return Ok(Some(format!(
                "{} bytes waiting for flush",
                writer.unflushed_bytes()
            )));
        }
        let head_position = writer.stream().head_position();
        let tail_position = writer.tail_position();
        if self
            .policy
            .should_throttle_writes(head_position, tail_position)
        {
            return Ok(Some(format!(
                "log holds {} bytes",
                tail_position - head_position
            )));
        }
        Ok(None)
    }

    /// Insert an Information record and start flushing it
    pub fn log_information(&self, event: InformationEvent) -> LogResult<Arc<LogRecord>> {
        let record = self.insert_and_flush(RecordBody::Information { event }, "information")?;
        info!(event = ?event, lsn = record.lsn(), "information record logged");
        Ok(record)
    }

    /// Insert the TruncateTail record marking a completed tail truncation
    pub fn log_truncate_tail(&self) -> LogResult<Arc<LogRecord>> {
        self.insert_and_flush(RecordBody::TruncateTail, "truncate_tail")
    }

    fn insert_and_flush(
        &self,
        body: RecordBody,
        initiator: &'static str,
    ) -> LogResult<Arc<LogRecord>> {
        let mut state = lock(&self.state);
        let writer = self.log_manager.writer()?;
        let record = self.insert_physical_locked(&mut state, &writer, body)?;
        drop(state);
        writer.start_flush(initiator);
        Ok(record)
    }

    /// Flush everything inserted so far
    pub async fn flush(&self, initiator: &'static str) -> LogResult<()> {
        let writer = self.log_manager.writer()?;
        writer.flush(initiator).await
    }

    /// Adopt the state of a recovered, copied or tail-truncated log
    ///
    /// # Panics
    ///
    /// Panics if records are still queued for ordering.
    pub fn reset(&self, info: &RecoveryInformation) {
        let mut state = lock(&self.state);
        assert!(
            state.queue.is_empty(),
            "coordinator reset with {} records queued",
            state.queue.len()
        );
        *state = OrderingState::new(info);
        debug!(tail_lsn = info.tail_lsn, epoch = %info.tail_epoch, "coordinator reset");
    }

    pub fn role(&self) -> ReplicaRole {
        *read(&self.role)
    }

    pub fn set_role(&self, role: ReplicaRole) {
        let previous = mem::replace(&mut *write(&self.role), role);
        info!(from = %previous, to = %role, "replica role changed");
    }

    pub fn tail_lsn(&self) -> Lsn {
        lock(&self.state).tail_lsn
    }

    pub fn tail_epoch(&self) -> Epoch {
        lock(&self.state).tail_epoch
    }

    pub fn last_stable_lsn(&self) -> Lsn {
        lock(&self.state).last_stable_lsn
    }

    /// Records waiting in the ordering queue
    pub fn queued_len(&self) -> usize {
        lock(&self.state).queue.len()
    }

    pub fn current_head(&self) -> Arc<LogRecord> {
        Arc::clone(&lock(&self.state).current_head)
    }

    pub fn last_linked_physical(&self) -> Option<Arc<LogRecord>> {
        lock(&self.state).last_linked_physical.clone()
    }

    pub fn last_in_progress_checkpoint(&self) -> Option<Arc<LogRecord>> {
        lock(&self.state).last_in_progress_checkpoint.clone()
    }

    pub fn last_completed_end_checkpoint(&self) -> Option<Arc<LogRecord>> {
        lock(&self.state).last_completed_end_checkpoint.clone()
    }

    pub fn last_in_progress_truncate_head(&self) -> Option<Arc<LogRecord>> {
        lock(&self.state).last_in_progress_truncate_head.clone()
    }

    pub fn fault(&self) -> Option<LogError> {
        self.fault.get()
    }

    pub fn log_manager(&self) -> &Arc<LogManager> {
        &self.log_manager
    }
}

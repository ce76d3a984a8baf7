//! Composition root
//!
//! `ReplicatedLog` wires one log instance together:
//! - storage collaborator -> `LogManager` (lifecycle, pipeline, readers)
//! - `ReplicatedLogManager` (ordering, chain records, replication)
//! - `RecordDispatcher` -> `RecordProcessor` (apply, checkpoint, truncation)
//! - `TailTruncator` (false progress)
//!
//! Open sequence:
//! 1. Validate configuration
//! 2. Open or create the live log, recovering its records
//! 3. Start the dispatcher
//! 4. Replay records after the last completed checkpoint under the unknown
//!    role and wait until they are processed

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ReplicatorConfig;
use crate::errors::{FaultLatch, LogError, LogResult};
use crate::log::{LogManager, LogReaderRange, LogReaderType, RecoveryInformation};
use crate::observability::{LogMetrics, LogMetricsSnapshot};
use crate::ordering::{
    ReplicaRole, ReplicatedLogManager, ReplicationOperation, ReplicationStream, Replicator,
    ThresholdTruncationPolicy, TransactionMap, TruncationPolicy,
};
use crate::pipeline::{BatchSink, FlushedBatch, OutstandingRecords};
use crate::processor::{CommitNotification, RecordDispatcher, RecordProcessor, StateProvider};
use crate::record::{
    decode_logical, BackupBody, Epoch, InformationEvent, LogRecord, Lsn, OperationData,
    RecordBody, TransactionId, INVALID_PSN,
};
use crate::storage::LogStore;
use crate::sync::lock;
use crate::truncation::TailTruncator;

/// One replicated log and the machinery around it
pub struct ReplicatedLog {
    config: ReplicatorConfig,
    log_manager: Arc<LogManager>,
    coordinator: Arc<ReplicatedLogManager>,
    processor: Arc<RecordProcessor>,
    truncator: TailTruncator,
    transactions: Arc<TransactionMap>,
    outstanding: Arc<OutstandingRecords>,
    metrics: Arc<LogMetrics>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicatedLog {
    /// Open the log with the threshold truncation policy
    pub async fn open(
        config: ReplicatorConfig,
        store: Arc<dyn LogStore>,
        replicator: Arc<dyn Replicator>,
        provider: Arc<dyn StateProvider>,
    ) -> LogResult<Self> {
        let policy = Arc::new(ThresholdTruncationPolicy::from_config(&config));
        Self::open_with_policy(config, store, replicator, provider, policy).await
    }

    pub async fn open_with_policy(
        config: ReplicatorConfig,
        store: Arc<dyn LogStore>,
        replicator: Arc<dyn Replicator>,
        provider: Arc<dyn StateProvider>,
        policy: Arc<dyn TruncationPolicy>,
    ) -> LogResult<Self> {
        config.validate()?;

        let metrics = Arc::new(LogMetrics::new());
        let (sink, receiver) = BatchSink::channel();
        let outstanding = Arc::clone(sink.outstanding());
        let log_manager = Arc::new(LogManager::new(
            store,
            Arc::clone(&metrics),
            sink,
            config.max_pending_flush_bytes,
        ));
        let opened = log_manager.open_or_create().await?;

        let transactions = Arc::new(TransactionMap::new());
        let fault = Arc::new(FaultLatch::new());
        let coordinator = Arc::new(
            ReplicatedLogManager::new(
                Arc::clone(&log_manager),
                replicator,
                Arc::clone(&transactions),
                Arc::clone(&fault),
                Arc::clone(&metrics),
                &config,
                &opened.info,
            )
            .with_policy(policy),
        );
        let processor = Arc::new(RecordProcessor::new(
            Arc::clone(&coordinator),
            Arc::clone(&provider),
            Arc::clone(&transactions),
            Arc::clone(&outstanding),
            Arc::clone(&fault),
            Arc::clone(&metrics),
        ));
        let dispatcher = RecordDispatcher::new(receiver, Arc::clone(&processor)).spawn();
        let truncator = TailTruncator::new(
            Arc::clone(&coordinator),
            provider,
            Arc::clone(&transactions),
            Arc::clone(&outstanding),
            fault,
            Arc::clone(&metrics),
        );

        let log = Self {
            config,
            log_manager,
            coordinator,
            processor,
            truncator,
            transactions,
            outstanding,
            metrics,
            dispatcher: Mutex::new(Some(dispatcher)),
        };
        if opened.recovered {
            log.replay(&opened.info).await?;
            log.coordinator
                .log_information(InformationEvent::Recovered)?;
            if opened.restored_from_backup {
                log.coordinator
                    .log_information(InformationEvent::RestoredFromBackup)?;
            }
        } else {
            log.outstanding.wait_for_all().await?;
        }
        info!(
            replica_id = %log.config.replica_id,
            tail_lsn = log.coordinator.tail_lsn(),
            recovered = opened.recovered,
            "replicated log opened"
        );
        Ok(log)
    }

    /// Hand the records after the last completed checkpoint to the processor.
    ///
    /// Transactions still open when that checkpoint began are tracked from
    /// their first record so their chains are complete.
    async fn replay(&self, info: &RecoveryInformation) -> LogResult<()> {
        let arena = self.log_manager.arena();
        let begin_psn = match &info.last_completed_begin_checkpoint {
            Some(begin) => begin.psn(),
            None => INVALID_PSN,
        };
        let pending_psn = match info.last_completed_begin_checkpoint.as_ref().map(|b| b.body()) {
            Some(RecordBody::BeginCheckpoint(body)) => body.earliest_pending_transaction_psn,
            _ => INVALID_PSN,
        };
        let track_after = if pending_psn != INVALID_PSN && pending_psn < begin_psn {
            pending_psn - 1
        } else {
            begin_psn
        };
        for record in arena.records_after(track_after) {
            self.transactions.track(&record);
        }

        let records = arena.records_after(begin_psn);
        let count = records.len();
        if count > 0 {
            self.log_manager.sink().send(FlushedBatch {
                records,
                outcome: Ok(()),
            });
        }
        self.outstanding.wait_for_all().await?;
        info!(records = count, begin_checkpoint_psn = begin_psn, "recovery replay complete");
        Ok(())
    }

    async fn replicate(&self, body: RecordBody) -> LogResult<Arc<LogRecord>> {
        let record = LogRecord::pending(body);
        self.coordinator.replicate_and_log(&record).await?;
        Ok(record)
    }

    pub async fn begin_transaction(
        &self,
        transaction_id: TransactionId,
        operation: OperationData,
    ) -> LogResult<Arc<LogRecord>> {
        self.replicate(RecordBody::BeginTransaction {
            transaction_id,
            is_single_operation: false,
            operation,
        })
        .await
    }

    pub async fn add_operation(
        &self,
        transaction_id: TransactionId,
        operation: OperationData,
    ) -> LogResult<Arc<LogRecord>> {
        self.replicate(RecordBody::Operation {
            transaction_id,
            operation,
        })
        .await
    }

    pub async fn end_transaction(
        &self,
        transaction_id: TransactionId,
        is_committed: bool,
    ) -> LogResult<Arc<LogRecord>> {
        self.replicate(RecordBody::EndTransaction {
            transaction_id,
            is_committed,
        })
        .await
    }

    /// A transaction of exactly one operation
    pub async fn atomic_operation(
        &self,
        transaction_id: TransactionId,
        operation: OperationData,
    ) -> LogResult<Arc<LogRecord>> {
        self.replicate(RecordBody::BeginTransaction {
            transaction_id,
            is_single_operation: true,
            operation,
        })
        .await
    }

    pub async fn barrier(&self) -> LogResult<Arc<LogRecord>> {
        let last_stable_lsn = self.coordinator.last_stable_lsn();
        self.replicate(RecordBody::Barrier { last_stable_lsn }).await
    }

    pub async fn update_epoch(&self, epoch: Epoch) -> LogResult<Arc<LogRecord>> {
        self.replicate(RecordBody::UpdateEpoch {
            epoch,
            primary_replica_id: self.config.replica_id,
        })
        .await
    }

    pub async fn backup(&self, body: BackupBody) -> LogResult<Arc<LogRecord>> {
        self.replicate(RecordBody::Backup(body)).await
    }

    /// Append a record received from the primary
    pub fn append_from_stream(&self, operation: ReplicationOperation) -> LogResult<Arc<LogRecord>> {
        if let Some(fault) = self.coordinator.fault() {
            return Err(fault);
        }
        let record = decode_logical(&operation.data)?;
        record.set_lsn(operation.lsn);
        self.coordinator.append(Arc::clone(&record), false)?;
        Ok(record)
    }

    /// Append every record of `stream`, then acknowledge the last one once
    /// it is durable. Returns the number of records appended.
    pub async fn drain_replication_stream<S: ReplicationStream>(
        &self,
        stream: &mut S,
    ) -> LogResult<u64> {
        let mut appended = 0u64;
        let mut last_lsn = None;
        while let Some(operation) = stream.next().await? {
            let record = self.append_from_stream(operation)?;
            last_lsn = Some(record.lsn());
            appended += 1;
        }
        if let Some(lsn) = last_lsn {
            self.coordinator.flush("replication_stream").await?;
            self.wait_for_log_flush_upto_lsn(lsn).await?;
            stream.acknowledge(lsn);
        }
        self.coordinator
            .log_information(InformationEvent::ReplicationFinished)?;
        Ok(appended)
    }

    /// Rebuild this replica from a copy stream: start a copy log at the
    /// primary's epoch and LSN, append the stream, then promote the copy.
    pub async fn build_from_copy_stream<S: ReplicationStream>(
        &self,
        starting_epoch: Epoch,
        starting_lsn: Lsn,
        stream: &mut S,
    ) -> LogResult<u64> {
        self.create_copy_log(starting_epoch, starting_lsn).await?;
        let mut appended = 0u64;
        while let Some(operation) = stream.next().await? {
            let record = self.append_from_stream(operation)?;
            stream.acknowledge(record.lsn());
            appended += 1;
        }
        self.coordinator.log_information(InformationEvent::CopyFinished)?;
        self.coordinator.flush("copy_stream").await?;
        self.rename_copy_log().await?;
        Ok(appended)
    }

    /// Begin a checkpoint and wait until it is processed
    pub async fn checkpoint(&self) -> LogResult<Arc<LogRecord>> {
        let role = self.coordinator.role();
        if matches!(role, ReplicaRole::Unknown | ReplicaRole::None) {
            return Err(LogError::InvalidOperation(format!(
                "cannot checkpoint in role {}",
                role
            )));
        }
        let begin = self.coordinator.begin_checkpoint(false)?;
        begin.processed().wait().await?;
        Ok(begin)
    }

    /// Remove records above `target` and undo their effects
    pub async fn truncate_tail(&self, target: Lsn) -> LogResult<Arc<LogRecord>> {
        self.truncator.truncate_tail(target).await
    }

    /// Wait until every record up to `lsn` is durable
    pub async fn wait_for_log_flush_upto_lsn(&self, lsn: Lsn) -> LogResult<()> {
        self.log_manager.waiters().wait_for(lsn).await
    }

    pub async fn flush(&self) -> LogResult<()> {
        self.coordinator.flush("flush").await
    }

    /// Switch to a fresh log under the copy alias
    pub async fn create_copy_log(&self, starting_epoch: Epoch, starting_lsn: Lsn) -> LogResult<()> {
        self.outstanding.wait_for_all().await?;
        let info = self
            .log_manager
            .create_copy_log(starting_epoch, starting_lsn)
            .await?;
        self.transactions.clear();
        self.coordinator.reset(&info);
        self.outstanding.wait_for_all().await
    }

    pub async fn rename_copy_log(&self) -> LogResult<()> {
        self.log_manager.rename_copy_log_atomically().await
    }

    pub fn add_reader(&self, position: u64, reader_type: LogReaderType) -> LogResult<()> {
        self.log_manager.add_reader(position, reader_type)
    }

    pub async fn remove_reader(&self, position: u64, reader_type: LogReaderType) -> LogResult<()> {
        self.log_manager.remove_reader(position, reader_type).await
    }

    pub fn earliest_reader(&self) -> Option<LogReaderRange> {
        self.log_manager.earliest_reader()
    }

    /// Change role; a secondary promoted to primary logs a PrimarySwap record
    pub fn change_role(&self, role: ReplicaRole) -> LogResult<()> {
        let previous = self.coordinator.role();
        self.coordinator.set_role(role);
        if role.is_primary() && previous.is_secondary() {
            self.coordinator
                .log_information(InformationEvent::PrimarySwap)?;
        }
        Ok(())
    }

    pub fn role(&self) -> ReplicaRole {
        self.coordinator.role()
    }

    pub fn subscribe_commits(&self) -> broadcast::Receiver<CommitNotification> {
        self.processor.subscribe_commits()
    }

    pub fn tail_lsn(&self) -> Lsn {
        self.coordinator.tail_lsn()
    }

    pub fn last_stable_lsn(&self) -> Lsn {
        self.coordinator.last_stable_lsn()
    }

    pub fn fault(&self) -> Option<LogError> {
        self.coordinator.fault()
    }

    pub fn metrics(&self) -> LogMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn coordinator(&self) -> &Arc<ReplicatedLogManager> {
        &self.coordinator
    }

    pub fn log_manager(&self) -> &Arc<LogManager> {
        &self.log_manager
    }

    pub fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    /// Log a Closed record, drain processing and freeze the writer.
    ///
    /// Returns the first failure met on the way; the log is closed either way.
    pub async fn close(&self) -> LogResult<()> {
        let mut first_error = None;
        if let Err(e) = self.coordinator.log_information(InformationEvent::Closed) {
            warn!(error = %e, "could not log close record");
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.coordinator.flush("close").await {
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.outstanding.wait_for_all().await {
            first_error.get_or_insert(e);
        }
        self.log_manager.close().await;
        self.coordinator.set_role(ReplicaRole::None);
        if let Some(dispatcher) = lock(&self.dispatcher).take() {
            dispatcher.abort();
        }
        info!(tail_lsn = self.coordinator.tail_lsn(), "replicated log closed");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Close and delete every log alias
    pub async fn remove_state(&self) -> LogResult<()> {
        if let Err(e) = self
            .coordinator
            .log_information(InformationEvent::RemovingState)
        {
            warn!(error = %e, "could not log removing-state record");
        }
        let closed = self.close().await;
        self.log_manager.delete_log().await?;
        closed
    }
}

impl Drop for ReplicatedLog {
    fn drop(&mut self) {
        if let Some(dispatcher) = lock(&self.dispatcher).take() {
            dispatcher.abort();
        }
    }
}

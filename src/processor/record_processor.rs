//! Record processor
//!
//! Consumes flushed batches in PSN order. For each record:
//! 1. Fail it at once if the partition is faulted
//! 2. Classify it by type and replica role
//! 3. Apply it (state provider redo, checkpoint, head truncation, stable LSN)
//! 4. Resolve its applied and processed signals and release its count
//!
//! Locks taken by a transaction's operations are held until its end record
//! is processed, then released begin first.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, error, info};

use super::classify::{classify, ProcessingMode};
use super::provider::{ApplyContext, StateProvider};
use crate::errors::{FaultLatch, LogError, LogResult};
use crate::observability::{LogMetrics, PhaseScope};
use crate::ordering::{ReplicaRole, ReplicatedLogManager, TransactionMap};
use crate::pipeline::{FlushedBatch, OutstandingRecords};
use crate::record::{CheckpointState, LogRecord, Lsn, OperationData, RecordBody, TransactionId};

const COMMIT_CHANNEL_CAPACITY: usize = 1024;

/// Published when an end-transaction record that commits is processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitNotification {
    pub transaction_id: TransactionId,
    pub commit_lsn: Lsn,
}

pub struct RecordProcessor {
    coordinator: Arc<ReplicatedLogManager>,
    provider: Arc<dyn StateProvider>,
    transactions: Arc<TransactionMap>,
    outstanding: Arc<OutstandingRecords>,
    fault: Arc<FaultLatch>,
    metrics: Arc<LogMetrics>,
    commits: broadcast::Sender<CommitNotification>,
}

impl RecordProcessor {
    pub fn new(
        coordinator: Arc<ReplicatedLogManager>,
        provider: Arc<dyn StateProvider>,
        transactions: Arc<TransactionMap>,
        outstanding: Arc<OutstandingRecords>,
        fault: Arc<FaultLatch>,
        metrics: Arc<LogMetrics>,
    ) -> Self {
        let (commits, _) = broadcast::channel(COMMIT_CHANNEL_CAPACITY);
        Self {
            coordinator,
            provider,
            transactions,
            outstanding,
            fault,
            metrics,
            commits,
        }
    }

    pub fn subscribe_commits(&self) -> broadcast::Receiver<CommitNotification> {
        self.commits.subscribe()
    }

    pub async fn process_batch(&self, batch: FlushedBatch) {
        match batch.outcome {
            Ok(()) => {
                for record in &batch.records {
                    self.process(record).await;
                }
            }
            Err(e) => {
                self.latch(&e);
                for record in &batch.records {
                    self.finish(record, Err(e.clone()));
                }
            }
        }
    }

    async fn process(&self, record: &Arc<LogRecord>) {
        let outcome = match self.fault.get() {
            Some(fault) => Err(fault),
            None => self.apply(record).await,
        };
        if let Err(e) = &outcome {
            self.latch(e);
        }
        self.finish(record, outcome);
    }

    async fn apply(&self, record: &Arc<LogRecord>) -> LogResult<()> {
        let role = self.coordinator.role();
        match classify(record.record_type(), role) {
            ProcessingMode::Normal => self.apply_transactional(record, role).await,
            ProcessingMode::ApplyImmediately => self.apply_immediately(record).await,
            ProcessingMode::ProcessImmediately => Ok(()),
        }
    }

    async fn apply_transactional(&self, record: &Arc<LogRecord>, role: ReplicaRole) -> LogResult<()> {
        let context = match role {
            ReplicaRole::Primary => ApplyContext::PrimaryRedo,
            ReplicaRole::ActiveSecondary | ReplicaRole::IdleSecondary => {
                ApplyContext::SecondaryRedo
            }
            ReplicaRole::Unknown | ReplicaRole::None => ApplyContext::RecoveryRedo,
        };
        match record.body() {
            RecordBody::BeginTransaction {
                transaction_id,
                is_single_operation,
                operation,
            } => {
                let held = self
                    .redo(record.lsn(), *transaction_id, operation, context)
                    .await?;
                if *is_single_operation {
                    if let Some(held) = held {
                        self.provider.unlock(held);
                    }
                    self.notify_commit(*transaction_id, record.lsn());
                } else {
                    record.set_operation_context(held);
                }
            }
            RecordBody::Operation {
                transaction_id,
                operation,
            } => {
                let held = self
                    .redo(record.lsn(), *transaction_id, operation, context)
                    .await?;
                record.set_operation_context(held);
            }
            RecordBody::EndTransaction {
                transaction_id,
                is_committed,
            } => {
                let chain = self
                    .transactions
                    .completed_chain(record.lsn())
                    .unwrap_or_default();
                if !is_committed {
                    self.roll_back(*transaction_id, &chain).await?;
                }
                for member in &chain {
                    if let Some(held) = member.take_operation_context() {
                        self.provider.unlock(held);
                    }
                }
                if *is_committed {
                    self.notify_commit(*transaction_id, record.lsn());
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn redo(
        &self,
        lsn: Lsn,
        transaction_id: TransactionId,
        operation: &OperationData,
        context: ApplyContext,
    ) -> LogResult<Option<crate::record::OperationContext>> {
        self.provider
            .apply(
                lsn,
                transaction_id,
                &operation.metadata,
                &operation.redo,
                context,
            )
            .await
    }

    /// Undo an aborted transaction's operations, newest first
    async fn roll_back(&self, transaction_id: TransactionId, chain: &[Arc<LogRecord>]) -> LogResult<()> {
        for member in chain.iter().rev() {
            let Some(operation) = member.body().operation() else {
                continue;
            };
            let held = self
                .provider
                .apply(
                    member.lsn(),
                    transaction_id,
                    &operation.metadata,
                    &operation.undo,
                    ApplyContext::Undo,
                )
                .await?;
            if let Some(held) = held {
                self.provider.unlock(held);
            }
            member.set_rolled_back(true);
        }
        debug!(transaction_id, operations = chain.len(), "transaction rolled back");
        Ok(())
    }

    async fn apply_immediately(&self, record: &Arc<LogRecord>) -> LogResult<()> {
        match record.body() {
            RecordBody::Barrier { .. } => {
                self.coordinator.on_barrier_processed(record);
                Ok(())
            }
            RecordBody::BeginCheckpoint(_) => self.checkpoint(record).await,
            RecordBody::TruncateHead { .. } => {
                if record.truncation_state().is_terminal() {
                    return Ok(());
                }
                self.coordinator
                    .log_manager()
                    .process_head_truncation(record)
                    .await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn checkpoint(&self, begin: &Arc<LogRecord>) -> LogResult<()> {
        let in_progress = self
            .coordinator
            .last_in_progress_checkpoint()
            .map_or(false, |r| Arc::ptr_eq(&r, begin));
        if begin.checkpoint_state() != CheckpointState::Ready || !in_progress {
            debug!(lsn = begin.lsn(), state = ?begin.checkpoint_state(), "skipping checkpoint");
            return Ok(());
        }

        let scope = PhaseScope::new("CHECKPOINT", begin.lsn());
        match self.perform_checkpoint(begin).await {
            Ok(()) => {
                scope.complete();
                self.coordinator.truncate_head_if_necessary()?;
                Ok(())
            }
            Err(e) => {
                self.coordinator.abort_checkpoint(begin);
                begin.set_checkpoint_state(CheckpointState::Faulted);
                scope.fail(&e);
                Err(e)
            }
        }
    }

    async fn perform_checkpoint(&self, begin: &Arc<LogRecord>) -> LogResult<()> {
        let lsn = begin.lsn();
        info!(phase = "Prepare", lsn, "checkpoint");
        self.provider.prepare_checkpoint(lsn).await?;

        info!(phase = "Perform", lsn, "checkpoint");
        self.provider.perform_checkpoint().await?;
        begin.set_checkpoint_state(CheckpointState::Applied);

        let end = self.coordinator.end_checkpoint(begin)?;
        self.coordinator.flush("end_checkpoint").await?;

        info!(phase = "Complete", lsn, end_psn = end.psn(), "checkpoint");
        self.provider.complete_checkpoint().await?;
        self.coordinator.complete_checkpoint()?;
        begin.set_checkpoint_state(CheckpointState::Completed);
        self.metrics.increment_checkpoints();
        Ok(())
    }

    fn notify_commit(&self, transaction_id: TransactionId, commit_lsn: Lsn) {
        // no subscribers is fine
        let _ = self.commits.send(CommitNotification {
            transaction_id,
            commit_lsn,
        });
    }

    fn latch(&self, e: &LogError) {
        if matches!(e, LogError::Closed) {
            return;
        }
        if self.fault.latch(e.clone()) {
            error!(error = %e, severity = %e.severity(), "record processing failed, faulting partition");
        }
    }

    fn finish(&self, record: &LogRecord, outcome: LogResult<()>) {
        record.applied().resolve(outcome.clone());
        record.processed().resolve(outcome);
        self.outstanding.processed(record);
    }
}

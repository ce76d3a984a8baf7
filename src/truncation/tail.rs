//! Tail truncation
//!
//! Removes false progress: records above a target LSN that the primary never
//! committed.
//!
//! Steps:
//! 1. Flush and wait until every handed-off record is processed
//! 2. Walk back from the tail: undo each transactional record, release its
//!    lock, then unlink it from the arena
//! 3. Cut the stream after the new tail and rewind the writer
//! 4. Reset the coordinator and log a TruncateTail record
//!
//! Operations already rolled back by their aborted transaction are not
//! undone again. A failed undo faults the partition: the arena and the
//! stream no longer agree.

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::errors::{FaultLatch, LogError, LogResult};
use crate::log::RecoveryInformation;
use crate::observability::{LogMetrics, PhaseScope};
use crate::ordering::{ReplicatedLogManager, TransactionMap};
use crate::pipeline::OutstandingRecords;
use crate::processor::{ApplyContext, StateProvider};
use crate::record::{LogRecord, Lsn, Psn, RecordBody, TransactionId};

pub struct TailTruncator {
    coordinator: Arc<ReplicatedLogManager>,
    provider: Arc<dyn StateProvider>,
    transactions: Arc<TransactionMap>,
    outstanding: Arc<OutstandingRecords>,
    fault: Arc<FaultLatch>,
    metrics: Arc<LogMetrics>,
}

impl TailTruncator {
    pub fn new(
        coordinator: Arc<ReplicatedLogManager>,
        provider: Arc<dyn StateProvider>,
        transactions: Arc<TransactionMap>,
        outstanding: Arc<OutstandingRecords>,
        fault: Arc<FaultLatch>,
        metrics: Arc<LogMetrics>,
    ) -> Self {
        Self {
            coordinator,
            provider,
            transactions,
            outstanding,
            fault,
            metrics,
        }
    }

    /// Truncate the log back to the last record at or below `target`.
    ///
    /// Returns the new tail record.
    ///
    /// # Panics
    ///
    /// Panics if a checkpoint is in progress or `target` is below the
    /// stable LSN.
    pub async fn truncate_tail(&self, target: Lsn) -> LogResult<Arc<LogRecord>> {
        if let Some(begin) = self.coordinator.last_in_progress_checkpoint() {
            panic!("tail truncation to {} while checkpoint {} is in progress", target, begin);
        }
        let stable = self.coordinator.last_stable_lsn();
        assert!(
            target >= stable,
            "tail truncation to {} below stable lsn {}",
            target,
            stable
        );
        let tail_lsn = self.coordinator.tail_lsn();
        if target >= tail_lsn {
            return Err(LogError::InvalidOperation(format!(
                "tail truncation to {} at or above tail lsn {}",
                target, tail_lsn
            )));
        }

        let log_manager = Arc::clone(self.coordinator.log_manager());
        if let Some(aborted) = log_manager.abort_pending_head_truncation() {
            debug!(lsn = aborted.lsn(), "head truncation aborted by tail truncation");
        }

        let scope = PhaseScope::new("TRUNCATE_TAIL", target);
        self.coordinator.flush("truncate_tail").await?;
        self.outstanding.wait_for_all().await?;

        let arena = log_manager.arena();
        let new_tail = arena
            .records()
            .into_iter()
            .rev()
            .find(|r| r.lsn() <= target)
            .ok_or_else(|| {
                LogError::InvalidOperation(format!("no record at or below lsn {} in the log", target))
            })?;

        let removed = arena.records_after(new_tail.psn());
        let mut undone = 0u64;
        for record in removed.iter().rev() {
            if let Err(e) = self.undo(record, new_tail.psn()).await {
                error!(
                    lsn = record.lsn(),
                    psn = record.psn(),
                    error = %e,
                    "undo failed during tail truncation, faulting partition"
                );
                self.fault.latch(e.clone());
                scope.fail(&e);
                return Err(e);
            }
            arena.remove_after(record.psn() - 1);
            if record.record_type().is_logical() {
                undone += 1;
            }
        }

        let info = RecoveryInformation::from_arena(arena)?;
        log_manager
            .truncate_tail(&new_tail, info.last_physical.as_deref())
            .await?;
        self.coordinator.reset(&info);
        self.coordinator.log_truncate_tail()?;
        self.coordinator.flush("truncate_tail").await?;

        self.metrics.record_tail_truncation(undone);
        info!(
            target,
            new_tail_lsn = new_tail.lsn(),
            new_tail_psn = new_tail.psn(),
            removed = removed.len(),
            undone,
            "tail truncated"
        );
        scope.complete();
        Ok(new_tail)
    }

    async fn undo(&self, record: &Arc<LogRecord>, new_tail_psn: Psn) -> LogResult<()> {
        let held = record.take_operation_context();
        if let RecordBody::EndTransaction {
            transaction_id,
            is_committed: false,
        } = record.body()
        {
            self.reopen_rolled_back(record, *transaction_id, new_tail_psn)
                .await?;
        }
        if record.is_rolled_back() {
            debug!(lsn = record.lsn(), "operation already rolled back by its transaction");
        } else if let (Some(transaction_id), Some(operation)) =
            (record.body().transaction_id(), record.body().operation())
        {
            let undo_held = self
                .provider
                .apply(
                    record.lsn(),
                    transaction_id,
                    &operation.metadata,
                    &operation.undo,
                    ApplyContext::FalseProgress,
                )
                .await?;
            if let Some(undo_held) = undo_held {
                self.provider.unlock(undo_held);
            }
        }
        if let Some(held) = held {
            self.provider.unlock(held);
        }
        self.transactions.undo(record);
        debug!(
            lsn = record.lsn(),
            psn = record.psn(),
            record_type = %record.record_type(),
            "record removed from tail"
        );
        Ok(())
    }

    /// Removing an aborted transaction's end record opens the transaction
    /// again. Its operations that stay in the log were rolled back, so apply
    /// them again and hold their locks until the transaction ends.
    async fn reopen_rolled_back(
        &self,
        end: &LogRecord,
        transaction_id: TransactionId,
        new_tail_psn: Psn,
    ) -> LogResult<()> {
        let Some(chain) = self.transactions.completed_chain(end.lsn()) else {
            return Ok(());
        };
        for member in chain
            .iter()
            .filter(|m| m.psn() <= new_tail_psn && m.is_rolled_back())
        {
            let Some(operation) = member.body().operation() else {
                continue;
            };
            let held = self
                .provider
                .apply(
                    member.lsn(),
                    transaction_id,
                    &operation.metadata,
                    &operation.redo,
                    ApplyContext::SecondaryRedo,
                )
                .await?;
            member.set_operation_context(held);
            member.set_rolled_back(false);
            debug!(lsn = member.lsn(), transaction_id, "rolled back operation applied again");
        }
        Ok(())
    }
}

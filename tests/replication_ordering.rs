//! Ordering, replication and commit-path tests
//!
//! - Records arriving out of LSN order are written in LSN order
//! - Transactions apply, release their locks in order and notify commits
//! - Expected replication failures surface as NotPrimary; unexpected ones
//!   fault the partition
//! - A failed group commit fails every record of the batch

mod common;

use std::sync::Arc;

use common::{open_memory_log, shipped};
use replog::errors::LogError;
use replog::ordering::{ReplicaRole, ReplicationErrorKind};
use replog::processor::{ApplyContext, CommitNotification};
use replog::record::{LogRecord, OperationData, RecordBody};

fn barrier_body() -> RecordBody {
    RecordBody::Barrier { last_stable_lsn: 0 }
}

fn op(redo: &str, undo: &str) -> OperationData {
    OperationData::new(b"meta".to_vec(), redo.as_bytes().to_vec(), undo.as_bytes().to_vec())
}

fn logical_lsns(records: &[Arc<LogRecord>]) -> Vec<i64> {
    records
        .iter()
        .filter(|r| r.record_type().is_logical())
        .map(|r| r.lsn())
        .collect()
}

// =============================================================================
// LSN ordering
// =============================================================================

#[tokio::test]
async fn test_out_of_order_arrival_is_written_in_order() {
    let t = open_memory_log().await;
    t.log.change_role(ReplicaRole::ActiveSecondary).unwrap();

    for lsn in [1, 3, 2] {
        t.log.append_from_stream(shipped(lsn, barrier_body())).unwrap();
    }
    assert_eq!(t.log.coordinator().queued_len(), 0);
    assert_eq!(t.log.tail_lsn(), 3);

    t.log.flush().await.unwrap();
    t.log.wait_for_log_flush_upto_lsn(3).await.unwrap();

    let records = t.log.log_manager().arena().records();
    assert_eq!(logical_lsns(&records), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_gap_holds_records_back() {
    let t = open_memory_log().await;
    t.log.change_role(ReplicaRole::ActiveSecondary).unwrap();

    t.log.append_from_stream(shipped(2, barrier_body())).unwrap();
    t.log.append_from_stream(shipped(4, barrier_body())).unwrap();
    assert_eq!(t.log.coordinator().queued_len(), 2);
    assert_eq!(t.log.tail_lsn(), 0);

    t.log.append_from_stream(shipped(1, barrier_body())).unwrap();
    assert_eq!(t.log.tail_lsn(), 2);
    assert_eq!(t.log.coordinator().queued_len(), 1);
}

#[tokio::test]
async fn test_drain_replication_stream_acknowledges_durable_tail() {
    let t = open_memory_log().await;
    t.log.change_role(ReplicaRole::IdleSecondary).unwrap();

    let mut stream = common::VecStream::new(
        (1..=5).map(|lsn| shipped(lsn, barrier_body())).collect(),
    );
    let appended = t.log.drain_replication_stream(&mut stream).await.unwrap();
    assert_eq!(appended, 5);
    assert_eq!(stream.acknowledged, vec![5]);
    assert!(t.log.log_manager().waiters().flushed_lsn() >= 5);
}

// =============================================================================
// Transactions
// =============================================================================

#[tokio::test]
async fn test_committed_transaction_releases_locks_in_order() {
    let t = open_memory_log().await;
    t.log.change_role(ReplicaRole::Primary).unwrap();
    let mut commits = t.log.subscribe_commits();

    let begin = t.log.begin_transaction(7, op("r1", "u1")).await.unwrap();
    let operation = t.log.add_operation(7, op("r2", "u2")).await.unwrap();
    let end = t.log.end_transaction(7, true).await.unwrap();
    assert_eq!((begin.lsn(), operation.lsn(), end.lsn()), (1, 2, 3));

    t.log.flush().await.unwrap();
    end.processed().wait().await.unwrap();

    let redo = t.provider.applied_with(ApplyContext::PrimaryRedo);
    let lsns: Vec<_> = redo.iter().map(|op| op.lsn).collect();
    assert_eq!(lsns, vec![1, 2]);
    assert_eq!(redo[1].data, b"r2".to_vec());
    assert_eq!(t.provider.unlocked(), vec![1, 2]);

    assert_eq!(
        commits.recv().await.unwrap(),
        CommitNotification {
            transaction_id: 7,
            commit_lsn: 3
        }
    );
}

#[tokio::test]
async fn test_aborted_transaction_is_undone_newest_first() {
    let t = open_memory_log().await;
    t.log.change_role(ReplicaRole::Primary).unwrap();

    t.log.begin_transaction(9, op("r1", "u1")).await.unwrap();
    t.log.add_operation(9, op("r2", "u2")).await.unwrap();
    let end = t.log.end_transaction(9, false).await.unwrap();
    t.log.flush().await.unwrap();
    end.processed().wait().await.unwrap();

    let undo = t.provider.applied_with(ApplyContext::Undo);
    let undone: Vec<_> = undo.iter().map(|op| (op.lsn, op.data.clone())).collect();
    assert_eq!(undone, vec![(2, b"u2".to_vec()), (1, b"u1".to_vec())]);
    assert_eq!(t.provider.unlocked(), vec![1, 2]);
}

#[tokio::test]
async fn test_atomic_operation_unlocks_at_once() {
    let t = open_memory_log().await;
    t.log.change_role(ReplicaRole::Primary).unwrap();

    let record = t.log.atomic_operation(3, op("r", "u")).await.unwrap();
    t.log.flush().await.unwrap();
    record.applied().wait().await.unwrap();
    record.processed().wait().await.unwrap();

    assert_eq!(t.provider.unlocked(), vec![record.lsn()]);
}

// =============================================================================
// Replication failures
// =============================================================================

#[tokio::test]
async fn test_writes_require_primary() {
    let t = open_memory_log().await;
    t.log.change_role(ReplicaRole::ActiveSecondary).unwrap();
    let err = t.log.barrier().await.unwrap_err();
    assert!(matches!(err, LogError::NotPrimary));
}

#[tokio::test]
async fn test_expected_replication_failure_is_not_primary() {
    let t = open_memory_log().await;
    t.log.change_role(ReplicaRole::Primary).unwrap();

    t.replicator.fail_next(ReplicationErrorKind::Closed);
    let err = t.log.barrier().await.unwrap_err();
    assert!(matches!(err, LogError::NotPrimary));
    assert!(t.log.fault().is_none());

    let record = t.log.barrier().await.unwrap();
    assert_eq!(record.lsn(), 1);
}

#[tokio::test]
async fn test_unexpected_replication_failure_faults_partition() {
    let t = open_memory_log().await;
    t.log.change_role(ReplicaRole::Primary).unwrap();

    t.replicator.fail_next(ReplicationErrorKind::Unexpected);
    let err = t.log.barrier().await.unwrap_err();
    assert!(err.is_fatal());

    let fault = t.log.fault().expect("partition faulted");
    assert!(matches!(fault, LogError::Replication(_)));
    assert!(t.log.barrier().await.is_err());
}

// =============================================================================
// Group commit
// =============================================================================

#[tokio::test]
async fn test_group_commit_failure_fails_whole_batch() {
    let t = open_memory_log().await;
    t.log.change_role(ReplicaRole::Primary).unwrap();

    let first = t.log.atomic_operation(1, op("a", "a")).await.unwrap();
    let second = t.log.atomic_operation(2, op("b", "b")).await.unwrap();

    t.store.fail_next_append();
    let err = t.log.flush().await.unwrap_err();
    assert!(matches!(err, LogError::Storage(_)));

    let first_err = first.flushed().wait().await.unwrap_err().to_string();
    let second_err = second.flushed().wait().await.unwrap_err().to_string();
    assert_eq!(first_err, second_err);

    // the processor latches the batch failure as the partition fault
    assert!(second.processed().wait().await.is_err());
    assert!(matches!(t.log.fault(), Some(LogError::Storage(_))));

    let writer = t.log.log_manager().writer().unwrap();
    let rejected = writer.insert(LogRecord::new(3, barrier_body()));
    assert!(matches!(rejected, Err(LogError::Closed)));
    assert!(t.provider.applied().is_empty());
}

#[tokio::test]
async fn test_wait_for_flush_wakes_on_covering_batch() {
    let t = open_memory_log().await;
    t.log.change_role(ReplicaRole::Primary).unwrap();

    let (waited, written) = tokio::join!(t.log.wait_for_log_flush_upto_lsn(2), async {
        t.log.atomic_operation(1, op("a", "a")).await?;
        t.log.atomic_operation(2, op("b", "b")).await?;
        t.log.flush().await
    });
    written.unwrap();
    waited.unwrap();
    assert_eq!(t.log.metrics().failed_batches, 0);
}

//! Tail truncation tests
//!
//! - False progress above the target LSN is undone newest first, exactly once
//!   per record, and the log continues from the new tail
//! - Operations rolled back by an aborted transaction are not undone again
//! - A failed undo faults the partition and keeps the records not yet undone

mod common;

use common::{open_memory_log, shipped, TestLog};
use replog::errors::LogError;
use replog::ordering::ReplicaRole;
use replog::processor::ApplyContext;
use replog::record::{LogRecordType, OperationData, RecordBody};

fn operation_body(lsn: i64) -> RecordBody {
    let operation = OperationData::new(
        Vec::new(),
        format!("redo-{}", lsn).into_bytes(),
        format!("undo-{}", lsn).into_bytes(),
    );
    if lsn == 1 {
        RecordBody::BeginTransaction {
            transaction_id: 42,
            is_single_operation: false,
            operation,
        }
    } else {
        RecordBody::Operation {
            transaction_id: 42,
            operation,
        }
    }
}

/// Secondary holding one open transaction spanning LSNs 1..=20
async fn secondary_with_twenty_operations() -> TestLog {
    let t = open_memory_log().await;
    t.log.change_role(ReplicaRole::ActiveSecondary).unwrap();
    let mut last = None;
    for lsn in 1..=20 {
        last = Some(t.log.append_from_stream(shipped(lsn, operation_body(lsn))).unwrap());
    }
    t.log.flush().await.unwrap();
    if let Some(last) = last {
        last.processed().wait().await.unwrap();
    }
    t
}

#[tokio::test]
async fn test_tail_truncation_undoes_in_reverse_order() {
    let t = secondary_with_twenty_operations().await;
    assert_eq!(t.provider.applied_with(ApplyContext::SecondaryRedo).len(), 20);

    let new_tail = t.log.truncate_tail(15).await.unwrap();
    assert_eq!(new_tail.lsn(), 15);
    assert_eq!(t.log.tail_lsn(), 15);

    let undone = t.provider.applied_with(ApplyContext::FalseProgress);
    let lsns: Vec<_> = undone.iter().map(|op| op.lsn).collect();
    assert_eq!(lsns, vec![20, 19, 18, 17, 16]);
    for op in &undone {
        assert_eq!(op.data, format!("undo-{}", op.lsn).into_bytes());
    }

    // the locks held by the removed operations are released
    assert_eq!(t.provider.unlocked(), vec![20, 19, 18, 17, 16]);

    let metrics = t.log.metrics();
    assert_eq!(metrics.tail_truncations, 1);
    assert_eq!(metrics.records_undone, 5);
}

#[tokio::test]
async fn test_log_continues_from_new_tail() {
    let t = secondary_with_twenty_operations().await;
    t.log.truncate_tail(15).await.unwrap();

    let records = t.log.log_manager().arena().records();
    assert!(records.iter().all(|r| r.lsn() <= 15));
    assert_eq!(
        records.last().map(|r| r.record_type()),
        Some(LogRecordType::TruncateTail)
    );

    let replacement = t.log.append_from_stream(shipped(16, operation_body(16))).unwrap();
    t.log.flush().await.unwrap();
    replacement.processed().wait().await.unwrap();
    assert_eq!(t.log.tail_lsn(), 16);
    t.log.wait_for_log_flush_upto_lsn(16).await.unwrap();

    let redo = t.provider.applied_with(ApplyContext::SecondaryRedo);
    assert_eq!(redo.len(), 21);
    assert_eq!(redo.last().map(|op| op.lsn), Some(16));
}

#[tokio::test]
async fn test_truncation_at_or_above_tail_is_rejected() {
    let t = secondary_with_twenty_operations().await;
    let err = t.log.truncate_tail(20).await.unwrap_err();
    assert!(matches!(err, LogError::InvalidOperation(_)));
    assert!(t.provider.applied_with(ApplyContext::FalseProgress).is_empty());
}

#[tokio::test]
#[should_panic(expected = "below stable lsn")]
async fn test_truncation_below_stable_lsn_panics() {
    let t = open_memory_log().await;
    t.log.change_role(ReplicaRole::ActiveSecondary).unwrap();
    t.log.append_from_stream(shipped(1, RecordBody::Barrier { last_stable_lsn: 0 })).unwrap();
    let barrier = t
        .log
        .append_from_stream(shipped(2, RecordBody::Barrier { last_stable_lsn: 1 }))
        .unwrap();
    t.log.append_from_stream(shipped(3, RecordBody::Barrier { last_stable_lsn: 1 })).unwrap();
    t.log.flush().await.unwrap();
    barrier.processed().wait().await.unwrap();
    assert_eq!(t.log.last_stable_lsn(), 1);

    let _ = t.log.truncate_tail(0).await;
}

// =============================================================================
// Aborted transactions
// =============================================================================

fn aborted_transaction(lsn: i64) -> RecordBody {
    if lsn == 3 {
        return RecordBody::EndTransaction {
            transaction_id: 9,
            is_committed: false,
        };
    }
    let operation = OperationData::new(
        Vec::new(),
        format!("redo-{}", lsn).into_bytes(),
        format!("undo-{}", lsn).into_bytes(),
    );
    if lsn == 1 {
        RecordBody::BeginTransaction {
            transaction_id: 9,
            is_single_operation: false,
            operation,
        }
    } else {
        RecordBody::Operation {
            transaction_id: 9,
            operation,
        }
    }
}

/// Secondary holding transaction 9: begin(1), op(2), end(3, aborted)
async fn secondary_with_aborted_transaction() -> TestLog {
    let t = open_memory_log().await;
    t.log.change_role(ReplicaRole::ActiveSecondary).unwrap();
    let mut last = None;
    for lsn in 1..=3 {
        last = Some(t.log.append_from_stream(shipped(lsn, aborted_transaction(lsn))).unwrap());
    }
    t.log.flush().await.unwrap();
    if let Some(last) = last {
        last.processed().wait().await.unwrap();
    }
    let undo: Vec<_> = t
        .provider
        .applied_with(ApplyContext::Undo)
        .iter()
        .map(|op| op.lsn)
        .collect();
    assert_eq!(undo, vec![2, 1]);
    t
}

#[tokio::test]
async fn test_rolled_back_transaction_is_not_undone_again() {
    let t = secondary_with_aborted_transaction().await;

    t.log.truncate_tail(0).await.unwrap();
    assert_eq!(t.log.tail_lsn(), 0);
    assert!(t.provider.applied_with(ApplyContext::FalseProgress).is_empty());
    assert_eq!(t.provider.applied_with(ApplyContext::Undo).len(), 2);
    assert_eq!(t.log.metrics().records_undone, 3);
}

#[tokio::test]
async fn test_removing_abort_record_reopens_transaction() {
    let t = secondary_with_aborted_transaction().await;

    t.log.truncate_tail(2).await.unwrap();
    assert!(t.provider.applied_with(ApplyContext::FalseProgress).is_empty());
    let redo: Vec<_> = t
        .provider
        .applied_with(ApplyContext::SecondaryRedo)
        .iter()
        .map(|op| op.lsn)
        .collect();
    assert_eq!(redo, vec![1, 2, 1, 2]);

    // the new primary commits the transaction instead
    let mut commits = t.log.subscribe_commits();
    let end = t
        .log
        .append_from_stream(shipped(
            3,
            RecordBody::EndTransaction {
                transaction_id: 9,
                is_committed: true,
            },
        ))
        .unwrap();
    t.log.flush().await.unwrap();
    end.processed().wait().await.unwrap();

    assert_eq!(t.provider.unlocked(), vec![1, 2, 1, 2]);
    assert_eq!(commits.recv().await.unwrap().commit_lsn, 3);
    assert_eq!(t.provider.applied_with(ApplyContext::Undo).len(), 2);
}

// =============================================================================
// Undo failures
// =============================================================================

#[tokio::test]
async fn test_failed_undo_faults_partition() {
    let t = secondary_with_twenty_operations().await;
    t.provider.fail_apply(18, ApplyContext::FalseProgress);

    let err = t.log.truncate_tail(15).await.unwrap_err();
    assert!(matches!(err, LogError::StateProvider(_)));
    assert!(matches!(t.log.fault(), Some(LogError::StateProvider(_))));

    let undone: Vec<_> = t
        .provider
        .applied_with(ApplyContext::FalseProgress)
        .iter()
        .map(|op| op.lsn)
        .collect();
    assert_eq!(undone, vec![20, 19]);

    // records are unlinked only once undone
    let last = t.log.log_manager().arena().last().unwrap();
    assert_eq!(last.lsn(), 18);
    assert_eq!(last.record_type(), LogRecordType::Operation);
    assert_eq!(t.log.tail_lsn(), 20);
    assert_eq!(t.log.metrics().tail_truncations, 0);

    let rejected = t.log.append_from_stream(shipped(21, operation_body(21)));
    assert!(matches!(rejected, Err(LogError::StateProvider(_))));
}

//! Checkpoint and head truncation tests
//!
//! - A checkpoint links its end record to its begin record and clears the
//!   in-progress slot
//! - Head truncation after a checkpoint moves the log head
//! - Registered readers defer head truncation; removing the last blocking
//!   reader applies it exactly once

mod common;

use std::sync::Arc;

use common::{small_config, RecordingProvider, SequenceReplicator};
use replog::log::LogReaderType;
use replog::ordering::{ReplicaRole, Replicator, TruncationPolicy};
use replog::processor::StateProvider;
use replog::record::{CheckpointState, LogRecordType, RecordBody, TruncationState};
use replog::storage::{LogStore, MemoryLogStore};
use replog::{LogError, ReplicatedLog};

/// Indexes after every record and truncates whenever it can
struct EagerPolicy;

impl TruncationPolicy for EagerPolicy {
    fn should_index(&self, tail_position: u64, last_index_position: u64) -> bool {
        tail_position > last_index_position
    }

    fn should_checkpoint(&self, _tail_position: u64, _last_checkpoint_position: u64) -> bool {
        false
    }

    fn should_truncate_head(&self, _head_position: u64, _tail_position: u64) -> bool {
        true
    }

    fn is_good_log_head_candidate(&self, _candidate_position: u64, _tail_position: u64) -> bool {
        true
    }

    fn should_throttle_writes(&self, _head_position: u64, _tail_position: u64) -> bool {
        false
    }
}

async fn open_eager() -> (ReplicatedLog, Arc<MemoryLogStore>, Arc<RecordingProvider>) {
    let store = Arc::new(MemoryLogStore::new());
    let provider = Arc::new(RecordingProvider::new());
    let log = ReplicatedLog::open_with_policy(
        small_config(),
        Arc::clone(&store) as Arc<dyn LogStore>,
        Arc::new(SequenceReplicator::new()) as Arc<dyn Replicator>,
        Arc::clone(&provider) as Arc<dyn StateProvider>,
        Arc::new(EagerPolicy),
    )
    .await
    .unwrap();
    log.change_role(ReplicaRole::Primary).unwrap();
    (log, store, provider)
}

// =============================================================================
// Checkpoints
// =============================================================================

#[tokio::test]
async fn test_checkpoint_links_end_to_begin() {
    let t = common::open_memory_log().await;
    t.log.change_role(ReplicaRole::Primary).unwrap();
    for _ in 0..10 {
        t.log.barrier().await.unwrap();
    }

    let begin = t.log.checkpoint().await.unwrap();
    assert_eq!(begin.lsn(), 10);
    assert_eq!(begin.checkpoint_state(), CheckpointState::Completed);

    let coordinator = t.log.coordinator();
    assert!(coordinator.last_in_progress_checkpoint().is_none());
    let linked_begin = coordinator.last_completed_begin_checkpoint().unwrap();
    assert!(Arc::ptr_eq(&linked_begin, &begin));

    let end = coordinator.last_completed_end_checkpoint().unwrap();
    match end.body() {
        RecordBody::EndCheckpoint(body) => {
            assert_eq!(body.last_completed_begin_checkpoint_psn, begin.psn());
            assert_eq!(body.last_stable_lsn, 10);
        }
        other => panic!("unexpected end checkpoint body {:?}", other),
    }

    assert_eq!(t.provider.checkpoints(), 1);
    assert_eq!(t.log.metrics().checkpoints, 1);
}

#[tokio::test]
async fn test_checkpoint_requires_established_role() {
    let t = common::open_memory_log().await;
    let err = t.log.checkpoint().await.unwrap_err();
    assert!(matches!(err, LogError::InvalidOperation(_)));
}

#[tokio::test]
async fn test_concurrent_checkpoint_is_rejected() {
    let t = common::open_memory_log().await;
    t.log.change_role(ReplicaRole::Primary).unwrap();
    t.log.barrier().await.unwrap();

    let coordinator = t.log.coordinator();
    let begin = coordinator.begin_checkpoint(false).unwrap();
    assert!(matches!(
        coordinator.begin_checkpoint(false),
        Err(LogError::InvalidOperation(_))
    ));
    begin.processed().wait().await.unwrap();
    assert!(coordinator.last_in_progress_checkpoint().is_none());
}

// =============================================================================
// Head truncation
// =============================================================================

#[tokio::test]
async fn test_head_truncation_follows_checkpoint() {
    let (log, store, _provider) = open_eager().await;
    for _ in 0..5 {
        log.barrier().await.unwrap();
    }
    let head_before = log.log_manager().head_position().unwrap();

    log.checkpoint().await.unwrap();
    let truncate = log
        .coordinator()
        .last_in_progress_truncate_head()
        .expect("head truncation requested");
    truncate.processed().wait().await.unwrap();

    assert_eq!(truncate.truncation_state(), TruncationState::Completed);
    let new_head = log.coordinator().current_head();
    assert_eq!(new_head.record_type(), LogRecordType::Indexing);
    let head_after = log.log_manager().head_position().unwrap();
    assert!(head_after > head_before);
    assert_eq!(Some(head_after), new_head.position());
    assert_eq!(store.counters().head_truncations(), 1);
    assert_eq!(log.metrics().head_truncations, 1);
}

#[tokio::test]
async fn test_readers_defer_head_truncation_until_removed() {
    let (log, store, _provider) = open_eager().await;
    for _ in 0..5 {
        log.barrier().await.unwrap();
    }
    let head = log.log_manager().head_position().unwrap();
    log.add_reader(head, LogReaderType::Backup).unwrap();
    log.add_reader(head, LogReaderType::PartialCopy).unwrap();

    log.checkpoint().await.unwrap();
    let truncate = log.coordinator().last_in_progress_truncate_head().unwrap();
    truncate.processed().wait().await.unwrap();

    let pending = log.log_manager().pending_head_truncation().unwrap();
    assert!(Arc::ptr_eq(&pending, &truncate));
    assert_eq!(log.log_manager().head_position().unwrap(), head);
    assert_eq!(store.counters().head_truncations(), 0);

    log.remove_reader(head, LogReaderType::Backup).await.unwrap();
    assert!(log.log_manager().pending_head_truncation().is_some());
    assert_eq!(store.counters().head_truncations(), 0);

    log.remove_reader(head, LogReaderType::PartialCopy).await.unwrap();
    assert!(log.log_manager().pending_head_truncation().is_none());
    assert_eq!(truncate.truncation_state(), TruncationState::Completed);
    assert_eq!(store.counters().head_truncations(), 1);
    assert!(log.log_manager().head_position().unwrap() > head);
}

#[tokio::test]
async fn test_reader_past_truncation_point_does_not_block() {
    let (log, store, _provider) = open_eager().await;
    for _ in 0..5 {
        log.barrier().await.unwrap();
    }
    let tail = log.log_manager().tail_position().unwrap();
    log.add_reader(tail, LogReaderType::Recovery).unwrap();

    log.checkpoint().await.unwrap();
    let truncate = log.coordinator().last_in_progress_truncate_head().unwrap();
    truncate.processed().wait().await.unwrap();

    assert!(log.log_manager().pending_head_truncation().is_none());
    assert_eq!(truncate.truncation_state(), TruncationState::Completed);
    assert_eq!(store.counters().head_truncations(), 1);
}

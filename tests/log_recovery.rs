//! Recovery tests
//!
//! - Records acknowledged as flushed survive reopen, on disk and in memory
//! - Records after the last completed checkpoint are replayed as recovery redo
//! - A torn record at the tail is cut away
//! - A copy log replaces the live log and the old one is kept as backup

mod common;

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;

use common::{shipped, small_config, RecordingProvider, SequenceReplicator, VecStream};
use replog::log::{BACKUP_ALIAS, CURRENT_ALIAS};
use replog::ordering::{ReplicaRole, Replicator};
use replog::processor::{ApplyContext, StateProvider};
use replog::record::{Epoch, InformationEvent, OperationData, RecordBody};
use replog::storage::{FileLogStore, LogStore, MemoryLogStore};
use replog::ReplicatedLog;
use tempfile::TempDir;

async fn open(
    store: Arc<dyn LogStore>,
    next_lsn: i64,
) -> (ReplicatedLog, Arc<RecordingProvider>) {
    let provider = Arc::new(RecordingProvider::new());
    let log = ReplicatedLog::open(
        small_config(),
        store,
        Arc::new(SequenceReplicator::starting_at(next_lsn)) as Arc<dyn Replicator>,
        Arc::clone(&provider) as Arc<dyn StateProvider>,
    )
    .await
    .expect("open log");
    (log, provider)
}

fn op(tag: &str) -> OperationData {
    OperationData::new(Vec::new(), tag.as_bytes().to_vec(), Vec::new())
}

async fn write_three_and_close(log: &ReplicatedLog) {
    log.change_role(ReplicaRole::Primary).unwrap();
    log.atomic_operation(1, op("a")).await.unwrap();
    log.atomic_operation(2, op("b")).await.unwrap();
    let last = log.atomic_operation(3, op("c")).await.unwrap();
    log.flush().await.unwrap();
    last.processed().wait().await.unwrap();
    log.close().await.unwrap();
}

// =============================================================================
// File-backed recovery
// =============================================================================

#[tokio::test]
async fn test_file_log_survives_reopen() {
    let temp_dir = TempDir::new().expect("temp dir");
    {
        let store = Arc::new(FileLogStore::open_dir(temp_dir.path()).unwrap());
        let (log, _) = open(store, 1).await;
        write_three_and_close(&log).await;
    }

    let store = Arc::new(FileLogStore::open_dir(temp_dir.path()).unwrap());
    let (log, provider) = open(store, 4).await;
    assert_eq!(log.tail_lsn(), 3);

    let replayed = provider.applied_with(ApplyContext::RecoveryRedo);
    let lsns: Vec<_> = replayed.iter().map(|op| op.lsn).collect();
    assert_eq!(lsns, vec![1, 2, 3]);
    assert_eq!(replayed[2].data, b"c".to_vec());

    // a Recovered information record follows the replay
    let last = log.log_manager().arena().last().unwrap();
    assert_eq!(
        last.body(),
        &RecordBody::Information {
            event: InformationEvent::Recovered
        }
    );

    log.change_role(ReplicaRole::Primary).unwrap();
    let next = log.atomic_operation(4, op("d")).await.unwrap();
    assert_eq!(next.lsn(), 4);
    log.close().await.unwrap();
}

#[tokio::test]
async fn test_torn_tail_is_truncated_on_open() {
    let temp_dir = TempDir::new().expect("temp dir");
    {
        let store = Arc::new(FileLogStore::open_dir(temp_dir.path()).unwrap());
        let (log, _) = open(store, 1).await;
        write_three_and_close(&log).await;
    }

    let path = temp_dir.path().join(format!("{}.log", CURRENT_ALIAS));
    let clean_len = std::fs::metadata(&path).unwrap().len();
    {
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0x01, 0x02]).unwrap();
        file.sync_all().unwrap();
    }

    let store = Arc::new(FileLogStore::open_dir(temp_dir.path()).unwrap());
    let (log, provider) = open(store, 4).await;
    assert_eq!(log.tail_lsn(), 3);
    assert_eq!(provider.applied_with(ApplyContext::RecoveryRedo).len(), 3);
    log.close().await.unwrap();
    assert!(std::fs::metadata(&path).unwrap().len() > clean_len);
}

#[tokio::test]
async fn test_replay_starts_after_last_checkpoint() {
    let temp_dir = TempDir::new().expect("temp dir");
    {
        let store = Arc::new(FileLogStore::open_dir(temp_dir.path()).unwrap());
        let (log, _) = open(store, 1).await;
        log.change_role(ReplicaRole::Primary).unwrap();
        log.atomic_operation(1, op("before")).await.unwrap();
        log.barrier().await.unwrap();
        log.checkpoint().await.unwrap();
        let after = log.atomic_operation(2, op("after")).await.unwrap();
        log.flush().await.unwrap();
        after.processed().wait().await.unwrap();
        log.close().await.unwrap();
    }

    let store = Arc::new(FileLogStore::open_dir(temp_dir.path()).unwrap());
    let (log, provider) = open(store, 4).await;
    let replayed: Vec<_> = provider
        .applied_with(ApplyContext::RecoveryRedo)
        .into_iter()
        .map(|op| op.data)
        .collect();
    assert_eq!(replayed, vec![b"after".to_vec()]);
    assert!(log.coordinator().last_completed_end_checkpoint().is_some());
    log.close().await.unwrap();
}

// =============================================================================
// Crash without flush
// =============================================================================

#[tokio::test]
async fn test_unflushed_records_are_lost_on_crash() {
    let store = Arc::new(MemoryLogStore::new());
    {
        let (log, _) = open(Arc::clone(&store) as Arc<dyn LogStore>, 1).await;
        log.change_role(ReplicaRole::Primary).unwrap();
        let durable = log.atomic_operation(1, op("durable")).await.unwrap();
        log.flush().await.unwrap();
        durable.processed().wait().await.unwrap();
        log.atomic_operation(2, op("lost")).await.unwrap();
        store.simulate_crash();
    }

    let (log, provider) = open(Arc::clone(&store) as Arc<dyn LogStore>, 2).await;
    assert_eq!(log.tail_lsn(), 1);
    let replayed: Vec<_> = provider
        .applied_with(ApplyContext::RecoveryRedo)
        .into_iter()
        .map(|op| op.data)
        .collect();
    assert_eq!(replayed, vec![b"durable".to_vec()]);
}

// =============================================================================
// Copy log
// =============================================================================

#[tokio::test]
async fn test_copy_stream_replaces_live_log() {
    let store = Arc::new(MemoryLogStore::new());
    let (log, _) = open(Arc::clone(&store) as Arc<dyn LogStore>, 1).await;
    log.change_role(ReplicaRole::IdleSecondary).unwrap();

    let mut stream = VecStream::new(
        (101..=103)
            .map(|lsn| shipped(lsn, RecordBody::Barrier { last_stable_lsn: 100 }))
            .collect(),
    );
    let copied = log
        .build_from_copy_stream(Epoch::new(1, 2), 100, &mut stream)
        .await
        .unwrap();

    assert_eq!(copied, 3);
    assert_eq!(stream.acknowledged, vec![101, 102, 103]);
    assert_eq!(log.tail_lsn(), 103);
    assert_eq!(log.log_manager().active_alias(), Some(CURRENT_ALIAS));
    assert_eq!(
        store.aliases(),
        vec![BACKUP_ALIAS.to_string(), CURRENT_ALIAS.to_string()]
    );
    assert_eq!(log.coordinator().tail_epoch(), Epoch::new(1, 2));

    log.close().await.unwrap();
    drop(log);

    let (reopened, _) = open(Arc::clone(&store) as Arc<dyn LogStore>, 104).await;
    assert_eq!(reopened.tail_lsn(), 103);
}

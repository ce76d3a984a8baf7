//! Transaction chains
//!
//! Tracks, per transaction, the records appended so far:
//! - pending: begun, not yet ended
//! - completed: ended (or single-operation), keyed by the LSN of the record
//!   that completed them, until a barrier makes them stable. Tail truncation
//!   may still reopen them before then.
//!
//! The earliest pending transaction bounds checkpoints and head truncation:
//! the log head may never move past a transaction that can still be undone.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::record::{LogRecord, Lsn, RecordBody, TransactionId};
use crate::sync::lock;

#[derive(Default)]
struct TransactionState {
    pending: HashMap<TransactionId, Vec<Arc<LogRecord>>>,
    completed: BTreeMap<Lsn, (TransactionId, Vec<Arc<LogRecord>>)>,
}

/// Chains of transactional records by transaction
#[derive(Default)]
pub struct TransactionMap {
    state: Mutex<TransactionState>,
}

impl TransactionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an appended record to its transaction chain.
    ///
    /// Non-transactional records are ignored.
    pub fn track(&self, record: &Arc<LogRecord>) {
        let mut state = lock(&self.state);
        match record.body() {
            RecordBody::BeginTransaction {
                transaction_id,
                is_single_operation: true,
                ..
            } => {
                state
                    .completed
                    .insert(record.lsn(), (*transaction_id, vec![Arc::clone(record)]));
            }
            RecordBody::BeginTransaction { transaction_id, .. } => {
                let previous = state
                    .pending
                    .insert(*transaction_id, vec![Arc::clone(record)]);
                assert!(
                    previous.is_none(),
                    "transaction {} begun twice",
                    transaction_id
                );
            }
            RecordBody::Operation { transaction_id, .. } => {
                state
                    .pending
                    .entry(*transaction_id)
                    .or_default()
                    .push(Arc::clone(record));
            }
            RecordBody::EndTransaction { transaction_id, .. } => {
                let mut chain = state.pending.remove(transaction_id).unwrap_or_default();
                chain.push(Arc::clone(record));
                state
                    .completed
                    .insert(record.lsn(), (*transaction_id, chain));
            }
            _ => {}
        }
    }

    /// First record of the oldest transaction still open
    pub fn earliest_pending(&self) -> Option<Arc<LogRecord>> {
        let state = lock(&self.state);
        state
            .pending
            .values()
            .filter_map(|chain| chain.first())
            .min_by_key(|record| record.lsn())
            .cloned()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// Chain completed by the record at `lsn`, in append order
    pub fn completed_chain(&self, lsn: Lsn) -> Option<Vec<Arc<LogRecord>>> {
        lock(&self.state)
            .completed
            .get(&lsn)
            .map(|(_, chain)| chain.clone())
    }

    pub fn completed_count(&self) -> usize {
        lock(&self.state).completed.len()
    }

    /// Forget completed chains at or below the stable LSN
    pub fn remove_stable(&self, stable_lsn: Lsn) -> usize {
        let mut state = lock(&self.state);
        let unstable = state.completed.split_off(&(stable_lsn + 1));
        let stable = std::mem::replace(&mut state.completed, unstable);
        if !stable.is_empty() {
            debug!(stable_lsn, transactions = stable.len(), "stable transactions released");
        }
        stable.len()
    }

    /// Remove a record undone by tail truncation.
    ///
    /// Records must be undone newest first.
    pub fn undo(&self, record: &Arc<LogRecord>) {
        let mut state = lock(&self.state);
        match record.body() {
            RecordBody::BeginTransaction {
                is_single_operation: true,
                ..
            } => {
                state.completed.remove(&record.lsn());
            }
            RecordBody::BeginTransaction { transaction_id, .. } => {
                state.pending.remove(transaction_id);
            }
            RecordBody::Operation { transaction_id, .. } => {
                if let Some(chain) = state.pending.get_mut(transaction_id) {
                    let last = chain.pop();
                    assert!(
                        last.as_deref() == Some(&**record),
                        "{} undone out of order",
                        record
                    );
                    if chain.is_empty() {
                        state.pending.remove(transaction_id);
                    }
                }
            }
            RecordBody::EndTransaction { transaction_id, .. } => {
                if let Some((_, mut chain)) = state.completed.remove(&record.lsn()) {
                    chain.pop();
                    if !chain.is_empty() {
                        state.pending.insert(*transaction_id, chain);
                    }
                }
            }
            _ => {}
        }
    }

    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.pending.clear();
        state.completed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::OperationData;

    fn begin(lsn: Lsn, tx: TransactionId) -> Arc<LogRecord> {
        LogRecord::new(
            lsn,
            RecordBody::BeginTransaction {
                transaction_id: tx,
                is_single_operation: false,
                operation: OperationData::default(),
            },
        )
    }

    fn operation(lsn: Lsn, tx: TransactionId) -> Arc<LogRecord> {
        LogRecord::new(
            lsn,
            RecordBody::Operation {
                transaction_id: tx,
                operation: OperationData::default(),
            },
        )
    }

    fn end(lsn: Lsn, tx: TransactionId) -> Arc<LogRecord> {
        LogRecord::new(
            lsn,
            RecordBody::EndTransaction {
                transaction_id: tx,
                is_committed: true,
            },
        )
    }

    #[test]
    fn test_earliest_pending_follows_open_transactions() {
        let map = TransactionMap::new();
        map.track(&begin(1, 100));
        map.track(&begin(2, 200));
        assert_eq!(map.earliest_pending().unwrap().lsn(), 1);

        map.track(&end(3, 100));
        assert_eq!(map.earliest_pending().unwrap().lsn(), 2);

        map.track(&end(4, 200));
        assert!(map.earliest_pending().is_none());
    }

    #[test]
    fn test_completed_chain_in_append_order() {
        let map = TransactionMap::new();
        map.track(&begin(1, 7));
        map.track(&operation(2, 7));
        map.track(&operation(3, 7));
        map.track(&end(4, 7));

        let chain = map.completed_chain(4).unwrap();
        let lsns: Vec<_> = chain.iter().map(|r| r.lsn()).collect();
        assert_eq!(lsns, vec![1, 2, 3, 4]);
        assert!(map.completed_chain(3).is_none());
        assert_eq!(map.completed_count(), 1);
    }

    #[test]
    fn test_undo_reopens_ended_transaction() {
        let map = TransactionMap::new();
        let ops = [begin(1, 7), operation(2, 7), end(3, 7)];
        for record in &ops {
            map.track(record);
        }

        map.undo(&ops[2]);
        assert_eq!(map.earliest_pending().unwrap().lsn(), 1);
        map.undo(&ops[1]);
        map.undo(&ops[0]);
        assert_eq!(map.pending_count(), 0);
    }

    #[test]
    fn test_remove_stable() {
        let map = TransactionMap::new();
        map.track(&begin(1, 1));
        map.track(&end(2, 1));
        map.track(&begin(3, 2));
        map.track(&end(4, 2));

        assert_eq!(map.remove_stable(2), 1);
        assert!(map.completed_chain(2).is_none());
        assert!(map.completed_chain(4).is_some());
    }
}

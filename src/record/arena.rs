//! PSN-keyed record arena
//!
//! Records refer to each other by PSN. The arena owns the records that are
//! still part of the live log so that chain walks resolve a link to a record
//! without holding references between records.
//!
//! - Inserted by the commit pipeline, in PSN order
//! - Pruned from the front on head truncation
//! - Pruned from the back on tail truncation

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use super::log_record::{LogRecord, PhysicalLink};
use super::types::Psn;
use crate::sync::lock;

#[derive(Default)]
struct ArenaState {
    records: BTreeMap<Psn, Arc<LogRecord>>,
    positions: BTreeMap<u64, Psn>,
}

/// Live records of one log, by PSN and by position
#[derive(Default)]
pub struct RecordArena {
    state: Mutex<ArenaState>,
}

impl RecordArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an inserted record. PSN and position must be assigned.
    pub fn insert(&self, record: Arc<LogRecord>) {
        let psn = record.psn();
        let position = record
            .position()
            .unwrap_or_else(|| panic!("{} added to arena without a position", record));
        let mut state = lock(&self.state);
        if let Some((&last, _)) = state.records.last_key_value() {
            assert!(psn > last, "{} added to arena after psn {}", record, last);
        }
        state.positions.insert(position, psn);
        state.records.insert(psn, record);
    }

    pub fn get(&self, psn: Psn) -> Option<Arc<LogRecord>> {
        lock(&self.state).records.get(&psn).cloned()
    }

    /// Record starting exactly at `position`
    pub fn at_position(&self, position: u64) -> Option<Arc<LogRecord>> {
        let state = lock(&self.state);
        let psn = state.positions.get(&position)?;
        state.records.get(psn).cloned()
    }

    /// Follow a record's back-link
    pub fn previous_physical(&self, record: &LogRecord) -> Option<Arc<LogRecord>> {
        match record.previous_physical() {
            PhysicalLink::Psn(psn) => self.get(psn),
            PhysicalLink::None | PhysicalLink::Unresolved => None,
        }
    }

    pub fn first(&self) -> Option<Arc<LogRecord>> {
        lock(&self.state).records.values().next().cloned()
    }

    pub fn last(&self) -> Option<Arc<LogRecord>> {
        lock(&self.state).records.values().next_back().cloned()
    }

    /// Records with PSN greater than `psn`, in PSN order
    pub fn records_after(&self, psn: Psn) -> Vec<Arc<LogRecord>> {
        let state = lock(&self.state);
        state
            .records
            .range(psn + 1..)
            .map(|(_, record)| Arc::clone(record))
            .collect()
    }

    /// All records in PSN order
    pub fn records(&self) -> Vec<Arc<LogRecord>> {
        lock(&self.state).records.values().cloned().collect()
    }

    /// Drop every record that starts before `position`
    pub fn prune_before_position(&self, position: u64) -> usize {
        let mut state = lock(&self.state);
        let kept_positions = state.positions.split_off(&position);
        let dropped = std::mem::replace(&mut state.positions, kept_positions);
        for psn in dropped.values() {
            state.records.remove(psn);
        }
        dropped.len()
    }

    /// Drop every record with PSN greater than `psn`.
    ///
    /// Returns the dropped records, newest first.
    pub fn remove_after(&self, psn: Psn) -> Vec<Arc<LogRecord>> {
        let mut state = lock(&self.state);
        let removed = state.records.split_off(&(psn + 1));
        for record in removed.values() {
            if let Some(position) = record.position() {
                state.positions.remove(&position);
            }
        }
        removed.into_values().rev().collect()
    }

    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.records.clear();
        state.positions.clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.state).records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::body::RecordBody;

    fn placed(psn: Psn, position: u64, link: PhysicalLink) -> Arc<LogRecord> {
        LogRecord::recovered(psn, psn, position, 10, link, RecordBody::Barrier { last_stable_lsn: 0 })
    }

    fn arena_of(count: i64) -> RecordArena {
        let arena = RecordArena::new();
        for psn in 1..=count {
            let link = if psn == 1 {
                PhysicalLink::None
            } else {
                PhysicalLink::Psn(psn - 1)
            };
            arena.insert(placed(psn, (psn as u64 - 1) * 10, link));
        }
        arena
    }

    #[test]
    fn test_lookup_by_psn_and_position() {
        let arena = arena_of(5);
        assert_eq!(arena.get(3).unwrap().psn(), 3);
        assert_eq!(arena.at_position(20).unwrap().psn(), 3);
        assert!(arena.at_position(21).is_none());

        let third = arena.get(3).unwrap();
        assert_eq!(arena.previous_physical(&third).unwrap().psn(), 2);
        let first = arena.get(1).unwrap();
        assert!(arena.previous_physical(&first).is_none());
    }

    #[test]
    fn test_prune_and_remove() {
        let arena = arena_of(6);

        assert_eq!(arena.prune_before_position(20), 2);
        assert_eq!(arena.first().unwrap().psn(), 3);

        let removed = arena.remove_after(4);
        let psns: Vec<_> = removed.iter().map(|r| r.psn()).collect();
        assert_eq!(psns, vec![6, 5]);
        assert_eq!(arena.last().unwrap().psn(), 4);
        assert!(arena.at_position(40).is_none());
        assert_eq!(arena.len(), 2);
    }

    #[test]
    #[should_panic(expected = "added to arena after")]
    fn test_out_of_order_insert_panics() {
        let arena = arena_of(3);
        arena.insert(placed(2, 100, PhysicalLink::None));
    }
}

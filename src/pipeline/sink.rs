//! Hand-off of flushed batches to the record processor
//!
//! Every record handed off is counted as outstanding until the processor
//! reports it processed. Logical and physical records are counted
//! separately so that callers can wait for either kind to drain.
//!
//! A counter starts at 1. The extra count is dropped by the first waiter of
//! a drain cycle; the transition to 0 resolves the cycle's signal and the
//! counter is re-armed at 1 for the next cycle.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::FlushedBatch;
use crate::errors::LogResult;
use crate::record::{CompletionSignal, LogRecord};
use crate::sync::lock;

struct CounterState {
    count: u64,
    waiting: bool,
    drained: Arc<CompletionSignal>,
}

impl CounterState {
    fn armed() -> Self {
        Self {
            count: 1,
            waiting: false,
            drained: Arc::new(CompletionSignal::new()),
        }
    }

    fn resolve_if_drained(&mut self) {
        if self.count == 0 {
            let drained = std::mem::replace(self, Self::armed()).drained;
            drained.resolve(Ok(()));
        }
    }
}

/// Records handed off but not yet processed
pub struct OutstandingCounter {
    state: Mutex<CounterState>,
}

impl Default for OutstandingCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl OutstandingCounter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CounterState::armed()),
        }
    }

    pub fn increment(&self, count: u64) {
        lock(&self.state).count += count;
    }

    pub fn decrement(&self, count: u64) {
        let mut state = lock(&self.state);
        assert!(
            state.count >= count,
            "outstanding count {} decremented by {}",
            state.count,
            count
        );
        state.count -= count;
        state.resolve_if_drained();
    }

    /// Outstanding records, excluding the drain sentinel
    pub fn outstanding(&self) -> u64 {
        let state = lock(&self.state);
        if state.waiting {
            state.count
        } else {
            state.count - 1
        }
    }

    /// Wait until every record counted so far is processed
    pub async fn wait_drained(&self) -> LogResult<()> {
        let drained = {
            let mut state = lock(&self.state);
            let drained = Arc::clone(&state.drained);
            if !state.waiting {
                state.waiting = true;
                state.count -= 1;
                state.resolve_if_drained();
            }
            drained
        };
        drained.wait().await
    }
}

/// Outstanding logical and physical records
#[derive(Default)]
pub struct OutstandingRecords {
    logical: OutstandingCounter,
    physical: OutstandingCounter,
}

impl OutstandingRecords {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count `records` as handed off
    pub fn prepare(&self, records: &[Arc<LogRecord>]) {
        let (logical, physical) = Self::split(records);
        self.logical.increment(logical);
        self.physical.increment(physical);
    }

    /// `record` finished processing
    pub fn processed(&self, record: &LogRecord) {
        if record.record_type().is_logical() {
            self.logical.decrement(1);
        } else {
            self.physical.decrement(1);
        }
    }

    fn abandon(&self, records: &[Arc<LogRecord>]) {
        let (logical, physical) = Self::split(records);
        self.logical.decrement(logical);
        self.physical.decrement(physical);
    }

    fn split(records: &[Arc<LogRecord>]) -> (u64, u64) {
        let logical = records
            .iter()
            .filter(|r| r.record_type().is_logical())
            .count() as u64;
        (logical, records.len() as u64 - logical)
    }

    pub fn logical(&self) -> &OutstandingCounter {
        &self.logical
    }

    pub fn physical(&self) -> &OutstandingCounter {
        &self.physical
    }

    pub async fn wait_for_logical_records(&self) -> LogResult<()> {
        self.logical.wait_drained().await
    }

    pub async fn wait_for_physical_records(&self) -> LogResult<()> {
        self.physical.wait_drained().await
    }

    /// Wait until both kinds are drained
    pub async fn wait_for_all(&self) -> LogResult<()> {
        self.wait_for_logical_records().await?;
        self.wait_for_physical_records().await
    }
}

/// Sending half of the flushed-batch channel
#[derive(Clone)]
pub struct BatchSink {
    sender: mpsc::UnboundedSender<FlushedBatch>,
    outstanding: Arc<OutstandingRecords>,
}

impl BatchSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<FlushedBatch>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let sink = Self {
            sender,
            outstanding: Arc::new(OutstandingRecords::new()),
        };
        (sink, receiver)
    }

    /// Count the batch's records as outstanding and hand it off
    pub fn send(&self, batch: FlushedBatch) {
        self.outstanding.prepare(&batch.records);
        if let Err(rejected) = self.sender.send(batch) {
            self.outstanding.abandon(&rejected.0.records);
        }
    }

    pub fn outstanding(&self) -> &Arc<OutstandingRecords> {
        &self.outstanding
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{RecordBody, INVALID_PSN};

    fn barrier() -> Arc<LogRecord> {
        LogRecord::new(1, RecordBody::Barrier { last_stable_lsn: 0 })
    }

    fn indexing() -> Arc<LogRecord> {
        LogRecord::new(
            1,
            RecordBody::Indexing {
                current_epoch: Default::default(),
                linked_physical_psn: INVALID_PSN,
            },
        )
    }

    #[tokio::test]
    async fn test_wait_with_nothing_outstanding_resolves() {
        let counter = OutstandingCounter::new();
        counter.wait_drained().await.unwrap();
        assert_eq!(counter.outstanding(), 0);

        // re-armed for the next cycle
        counter.increment(1);
        assert_eq!(counter.outstanding(), 1);
    }

    #[tokio::test]
    async fn test_drain_cycle_resolves_on_last_decrement() {
        let counter = Arc::new(OutstandingCounter::new());
        counter.increment(2);

        let waiter = tokio::spawn({
            let counter = Arc::clone(&counter);
            async move { counter.wait_drained().await }
        });
        tokio::task::yield_now().await;

        counter.decrement(1);
        assert!(!waiter.is_finished());
        counter.decrement(1);
        waiter.await.unwrap().unwrap();
        assert_eq!(counter.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_sink_counts_by_kind() {
        let (sink, mut receiver) = BatchSink::channel();
        let records = vec![barrier(), indexing(), barrier()];
        sink.send(FlushedBatch {
            records,
            outcome: Ok(()),
        });
        assert_eq!(sink.outstanding().logical().outstanding(), 2);
        assert_eq!(sink.outstanding().physical().outstanding(), 1);

        let batch = receiver.recv().await.unwrap();
        for record in &batch.records {
            sink.outstanding().processed(record);
        }
        sink.outstanding().wait_for_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_batch_is_not_counted() {
        let (sink, receiver) = BatchSink::channel();
        drop(receiver);
        sink.send(FlushedBatch {
            records: vec![barrier()],
            outcome: Ok(()),
        });
        assert_eq!(sink.outstanding().logical().outstanding(), 0);
    }
}

//! Flushed-batch dispatch loop

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::record_processor::RecordProcessor;
use crate::pipeline::FlushedBatch;

/// Receiving half of the flushed-batch channel
pub type BatchReceiver = mpsc::UnboundedReceiver<FlushedBatch>;

/// Feeds flushed batches to the record processor one at a time, in the
/// order the pipeline completed them
pub struct RecordDispatcher {
    receiver: BatchReceiver,
    processor: Arc<RecordProcessor>,
}

impl RecordDispatcher {
    pub fn new(receiver: BatchReceiver, processor: Arc<RecordProcessor>) -> Self {
        Self {
            receiver,
            processor,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until every batch sender is dropped
    pub async fn run(mut self) {
        while let Some(batch) = self.receiver.recv().await {
            debug!(records = batch.records.len(), ok = batch.outcome.is_ok(), "dispatching batch");
            self.processor.process_batch(batch).await;
        }
        debug!("record dispatcher stopped");
    }
}

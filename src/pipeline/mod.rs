//! Commit pipeline
//!
//! Buffers records, writes them to the log stream in group commits, resolves
//! each record's flushed signal with its batch outcome and hands every
//! completed batch to the record dispatcher through a `BatchSink`.
//!
//! Backpressure is signaled, not enforced: `PhysicalLogWriter::should_throttle`
//! reports when unflushed bytes exceed the configured ceiling and the
//! coordinator decides how to react.

mod sink;
mod waiters;
mod writer;

use std::sync::Arc;

use crate::errors::LogResult;
use crate::record::LogRecord;

pub use sink::{BatchSink, OutstandingCounter, OutstandingRecords};
pub use waiters::FlushWaiters;
pub use writer::{PhysicalLogWriter, WriterPosition};

/// A batch of records whose flush completed, in insertion order
#[derive(Debug)]
pub struct FlushedBatch {
    pub records: Vec<Arc<LogRecord>>,
    pub outcome: LogResult<()>,
}

//! Record processor
//!
//! Applies flushed records to the state provider and acts on the log's own
//! chain records:
//! - Transaction records: redo, lock hand-off, unlock on end, commit notices
//! - Barrier: stable LSN
//! - BeginCheckpoint: the checkpoint phases and the follow-up head truncation
//! - TruncateHead: reader-gated head truncation
//!
//! A failure is latched as the partition fault; every later record fails
//! with it without reaching the state provider.

mod classify;
mod dispatcher;
mod provider;
mod record_processor;

pub use classify::{classify, ProcessingMode};
pub use dispatcher::{BatchReceiver, RecordDispatcher};
pub use provider::{ApplyContext, StateProvider};
pub use record_processor::{CommitNotification, RecordProcessor};

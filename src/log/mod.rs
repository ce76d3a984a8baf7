//! Log lifecycle
//!
//! - `LogManager`: active stream and pipeline, alias changes, reader-gated
//!   head truncation, tail truncation
//! - `LogReaderRanges`: positions pinned by active readers
//! - `LogRecordsReader`/`RecoveryInformation`: scanning and summarizing a log

mod manager;
mod readers;
mod recovery;

pub use manager::{
    HeadTruncationOutcome, LogManager, OpenedLog, BACKUP_ALIAS, COPY_ALIAS, CURRENT_ALIAS,
};
pub use readers::{LogReaderRange, LogReaderRanges, LogReaderType};
pub use recovery::{LogRecordsReader, RecoveryInformation, ScannedFrame, ScannedLog};

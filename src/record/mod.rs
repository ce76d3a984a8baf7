//! Log record model
//!
//! - Closed set of record types: logical (replicated, consume an LSN) and
//!   physical (local bookkeeping, consume only a PSN)
//! - Binary framing with length-prefixed sections and a CRC32
//! - Per-record completion signals: flushed, applied, processed
//! - PSN-keyed arena for resolving physical back-links

mod arena;
mod body;
mod checksum;
mod codec;
mod completion;
mod errors;
mod log_record;
mod types;

pub use arena::RecordArena;
pub use body::{BackupBody, BeginCheckpointBody, EndCheckpointBody, LogHead, OperationData, RecordBody};
pub use checksum::compute_checksum;
pub use codec::{decode_frame, decode_logical, encode_frame, encode_logical, DecodedFrame, MIN_FRAME_SIZE};
pub use completion::CompletionSignal;
pub use errors::{RecordError, RecordResult};
pub use log_record::{
    CheckpointState, LogRecord, OperationContext, PhysicalLink, TruncationState,
};
pub use types::{
    Epoch, InformationEvent, LogRecordType, Lsn, Psn, TransactionId, INVALID_LSN, INVALID_PSN,
    ZERO_LSN,
};

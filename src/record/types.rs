//! Record type tags, sequence numbers and epochs

use std::fmt;

use serde::{Deserialize, Serialize};

use super::errors::{RecordError, RecordResult};

/// Logical sequence number. Consumed by logical records only.
pub type Lsn = i64;

/// Physical sequence number. Consumed by every record.
pub type Psn = i64;

/// Application transaction identifier
pub type TransactionId = i64;

/// LSN of the bootstrap records of a new log
pub const ZERO_LSN: Lsn = 0;

/// LSN of a record that has not been assigned one yet
pub const INVALID_LSN: Lsn = -1;

/// PSN of a record that has not been inserted into a log yet
pub const INVALID_PSN: Psn = -1;

/// The closed set of record types.
///
/// Values are persisted; never renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum LogRecordType {
    BeginTransaction = 1,
    Operation = 2,
    EndTransaction = 3,
    Barrier = 4,
    UpdateEpoch = 5,
    Backup = 6,
    Indexing = 7,
    BeginCheckpoint = 8,
    EndCheckpoint = 9,
    CompleteCheckpoint = 10,
    TruncateHead = 11,
    TruncateTail = 12,
    Information = 13,
}

impl LogRecordType {
    /// Decode a persisted type tag.
    ///
    /// An unknown tag is a fatal format error.
    pub fn from_u32(value: u32) -> RecordResult<Self> {
        let record_type = match value {
            1 => LogRecordType::BeginTransaction,
            2 => LogRecordType::Operation,
            3 => LogRecordType::EndTransaction,
            4 => LogRecordType::Barrier,
            5 => LogRecordType::UpdateEpoch,
            6 => LogRecordType::Backup,
            7 => LogRecordType::Indexing,
            8 => LogRecordType::BeginCheckpoint,
            9 => LogRecordType::EndCheckpoint,
            10 => LogRecordType::CompleteCheckpoint,
            11 => LogRecordType::TruncateHead,
            12 => LogRecordType::TruncateTail,
            13 => LogRecordType::Information,
            other => return Err(RecordError::UnknownRecordType(other)),
        };
        Ok(record_type)
    }

    /// Persisted type tag
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Replicated records that consume an LSN
    pub fn is_logical(self) -> bool {
        matches!(
            self,
            LogRecordType::BeginTransaction
                | LogRecordType::Operation
                | LogRecordType::EndTransaction
                | LogRecordType::Barrier
                | LogRecordType::UpdateEpoch
                | LogRecordType::Backup
        )
    }

    /// Local bookkeeping records
    pub fn is_physical(self) -> bool {
        !self.is_logical()
    }

    /// Records that belong to a transaction chain
    pub fn is_transactional(self) -> bool {
        matches!(
            self,
            LogRecordType::BeginTransaction
                | LogRecordType::Operation
                | LogRecordType::EndTransaction
        )
    }

    /// Physical records that form the checkpoint/indexing chain
    pub fn is_linked_physical(self) -> bool {
        matches!(
            self,
            LogRecordType::Indexing
                | LogRecordType::BeginCheckpoint
                | LogRecordType::EndCheckpoint
                | LogRecordType::CompleteCheckpoint
                | LogRecordType::TruncateHead
        )
    }
}

impl fmt::Display for LogRecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Reconfiguration epoch.
///
/// Ordered by data loss version first, then configuration version.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Epoch {
    pub data_loss_version: i64,
    pub configuration_version: i64,
}

impl Epoch {
    /// Epoch of a freshly created log
    pub const ZERO: Epoch = Epoch {
        data_loss_version: 0,
        configuration_version: 0,
    };

    pub fn new(data_loss_version: i64, configuration_version: i64) -> Self {
        Self {
            data_loss_version,
            configuration_version,
        }
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}",
            self.data_loss_version, self.configuration_version
        )
    }
}

/// Events recorded by Information records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum InformationEvent {
    Recovered = 1,
    CopyFinished = 2,
    ReplicationFinished = 3,
    PrimarySwap = 4,
    Closed = 5,
    RemovingState = 6,
    RestoredFromBackup = 7,
}

impl InformationEvent {
    pub fn from_u32(value: u32) -> RecordResult<Self> {
        let event = match value {
            1 => InformationEvent::Recovered,
            2 => InformationEvent::CopyFinished,
            3 => InformationEvent::ReplicationFinished,
            4 => InformationEvent::PrimarySwap,
            5 => InformationEvent::Closed,
            6 => InformationEvent::RemovingState,
            7 => InformationEvent::RestoredFromBackup,
            other => {
                return Err(RecordError::malformed(format!(
                    "unknown information event {}",
                    other
                )))
            }
        };
        Ok(event)
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

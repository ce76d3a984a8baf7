//! Record bodies
//!
//! Each record type carries a fixed body layout. Bodies are encoded
//! little-endian; variable-length payloads are u32 length-prefixed.
//! Physical chain records refer to other records by PSN, never by pointer.

use uuid::Uuid;

use super::errors::{RecordError, RecordResult};
use super::types::{Epoch, InformationEvent, LogRecordType, Lsn, Psn, TransactionId, INVALID_PSN};

/// Redo/undo payload of a transactional record.
///
/// The bytes are opaque to the log; the state provider interprets them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationData {
    pub metadata: Vec<u8>,
    pub redo: Vec<u8>,
    pub undo: Vec<u8>,
}

impl OperationData {
    pub fn new(metadata: impl Into<Vec<u8>>, redo: impl Into<Vec<u8>>, undo: impl Into<Vec<u8>>) -> Self {
        Self {
            metadata: metadata.into(),
            redo: redo.into(),
            undo: undo.into(),
        }
    }
}

/// Position of the log head as recorded by chain records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogHead {
    pub epoch: Epoch,
    pub lsn: Lsn,
    pub psn: Psn,
    pub position: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeginCheckpointBody {
    /// Oldest transaction still open when the checkpoint began
    pub earliest_pending_transaction_lsn: Lsn,
    pub earliest_pending_transaction_psn: Psn,
    pub earliest_pending_transaction_position: u64,
    pub epoch: Epoch,
    pub is_first_checkpoint_on_full_copy: bool,
    pub periodic_checkpoint_time_ms: i64,
    pub linked_physical_psn: Psn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndCheckpointBody {
    pub log_head: LogHead,
    pub last_stable_lsn: Lsn,
    pub last_completed_begin_checkpoint_psn: Psn,
    pub linked_physical_psn: Psn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupBody {
    pub backup_id: Uuid,
    pub highest_backed_up_epoch: Epoch,
    pub highest_backed_up_lsn: Lsn,
    pub backup_log_record_count: u32,
    pub backup_log_size: u64,
}

/// Type-specific contents of a log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordBody {
    BeginTransaction {
        transaction_id: TransactionId,
        is_single_operation: bool,
        operation: OperationData,
    },
    Operation {
        transaction_id: TransactionId,
        operation: OperationData,
    },
    EndTransaction {
        transaction_id: TransactionId,
        is_committed: bool,
    },
    Barrier {
        last_stable_lsn: Lsn,
    },
    UpdateEpoch {
        epoch: Epoch,
        primary_replica_id: Uuid,
    },
    Backup(BackupBody),
    Indexing {
        current_epoch: Epoch,
        linked_physical_psn: Psn,
    },
    BeginCheckpoint(BeginCheckpointBody),
    EndCheckpoint(EndCheckpointBody),
    CompleteCheckpoint {
        log_head: LogHead,
        linked_physical_psn: Psn,
    },
    TruncateHead {
        log_head: LogHead,
        is_stable: bool,
        periodic_truncation_time_ms: i64,
        linked_physical_psn: Psn,
    },
    TruncateTail,
    Information {
        event: InformationEvent,
    },
}

impl RecordBody {
    pub fn record_type(&self) -> LogRecordType {
        match self {
            RecordBody::BeginTransaction { .. } => LogRecordType::BeginTransaction,
            RecordBody::Operation { .. } => LogRecordType::Operation,
            RecordBody::EndTransaction { .. } => LogRecordType::EndTransaction,
            RecordBody::Barrier { .. } => LogRecordType::Barrier,
            RecordBody::UpdateEpoch { .. } => LogRecordType::UpdateEpoch,
            RecordBody::Backup(_) => LogRecordType::Backup,
            RecordBody::Indexing { .. } => LogRecordType::Indexing,
            RecordBody::BeginCheckpoint(_) => LogRecordType::BeginCheckpoint,
            RecordBody::EndCheckpoint(_) => LogRecordType::EndCheckpoint,
            RecordBody::CompleteCheckpoint { .. } => LogRecordType::CompleteCheckpoint,
            RecordBody::TruncateHead { .. } => LogRecordType::TruncateHead,
            RecordBody::TruncateTail => LogRecordType::TruncateTail,
            RecordBody::Information { .. } => LogRecordType::Information,
        }
    }

    /// Transaction the record belongs to, for transactional records
    pub fn transaction_id(&self) -> Option<TransactionId> {
        match self {
            RecordBody::BeginTransaction { transaction_id, .. }
            | RecordBody::Operation { transaction_id, .. }
            | RecordBody::EndTransaction { transaction_id, .. } => Some(*transaction_id),
            _ => None,
        }
    }

    /// Redo/undo payload, for records that carry one
    pub fn operation(&self) -> Option<&OperationData> {
        match self {
            RecordBody::BeginTransaction { operation, .. }
            | RecordBody::Operation { operation, .. } => Some(operation),
            _ => None,
        }
    }

    /// Previous record of the checkpoint/indexing chain
    pub fn linked_physical_psn(&self) -> Option<Psn> {
        let psn = match self {
            RecordBody::Indexing {
                linked_physical_psn,
                ..
            }
            | RecordBody::CompleteCheckpoint {
                linked_physical_psn,
                ..
            }
            | RecordBody::TruncateHead {
                linked_physical_psn,
                ..
            } => *linked_physical_psn,
            RecordBody::BeginCheckpoint(body) => body.linked_physical_psn,
            RecordBody::EndCheckpoint(body) => body.linked_physical_psn,
            _ => return None,
        };
        (psn != INVALID_PSN).then_some(psn)
    }

    pub(crate) fn encode(&self, out: &mut BodyWriter) {
        match self {
            RecordBody::BeginTransaction {
                transaction_id,
                is_single_operation,
                operation,
            } => {
                out.put_i64(*transaction_id);
                out.put_bool(*is_single_operation);
                out.put_operation(operation);
            }
            RecordBody::Operation {
                transaction_id,
                operation,
            } => {
                out.put_i64(*transaction_id);
                out.put_operation(operation);
            }
            RecordBody::EndTransaction {
                transaction_id,
                is_committed,
            } => {
                out.put_i64(*transaction_id);
                out.put_bool(*is_committed);
            }
            RecordBody::Barrier { last_stable_lsn } => out.put_i64(*last_stable_lsn),
            RecordBody::UpdateEpoch {
                epoch,
                primary_replica_id,
            } => {
                out.put_epoch(epoch);
                out.put_uuid(primary_replica_id);
            }
            RecordBody::Backup(body) => {
                out.put_uuid(&body.backup_id);
                out.put_epoch(&body.highest_backed_up_epoch);
                out.put_i64(body.highest_backed_up_lsn);
                out.put_u32(body.backup_log_record_count);
                out.put_u64(body.backup_log_size);
            }
            RecordBody::Indexing {
                current_epoch,
                linked_physical_psn,
            } => {
                out.put_epoch(current_epoch);
                out.put_i64(*linked_physical_psn);
            }
            RecordBody::BeginCheckpoint(body) => {
                out.put_i64(body.earliest_pending_transaction_lsn);
                out.put_i64(body.earliest_pending_transaction_psn);
                out.put_u64(body.earliest_pending_transaction_position);
                out.put_epoch(&body.epoch);
                out.put_bool(body.is_first_checkpoint_on_full_copy);
                out.put_i64(body.periodic_checkpoint_time_ms);
                out.put_i64(body.linked_physical_psn);
            }
            RecordBody::EndCheckpoint(body) => {
                out.put_log_head(&body.log_head);
                out.put_i64(body.last_stable_lsn);
                out.put_i64(body.last_completed_begin_checkpoint_psn);
                out.put_i64(body.linked_physical_psn);
            }
            RecordBody::CompleteCheckpoint {
                log_head,
                linked_physical_psn,
            } => {
                out.put_log_head(log_head);
                out.put_i64(*linked_physical_psn);
            }
            RecordBody::TruncateHead {
                log_head,
                is_stable,
                periodic_truncation_time_ms,
                linked_physical_psn,
            } => {
                out.put_log_head(log_head);
                out.put_bool(*is_stable);
                out.put_i64(*periodic_truncation_time_ms);
                out.put_i64(*linked_physical_psn);
            }
            RecordBody::TruncateTail => {}
            RecordBody::Information { event } => out.put_u32(event.as_u32()),
        }
    }

    pub(crate) fn decode(record_type: LogRecordType, input: &mut BodyReader<'_>) -> RecordResult<Self> {
        let body = match record_type {
            LogRecordType::BeginTransaction => RecordBody::BeginTransaction {
                transaction_id: input.get_i64()?,
                is_single_operation: input.get_bool()?,
                operation: input.get_operation()?,
            },
            LogRecordType::Operation => RecordBody::Operation {
                transaction_id: input.get_i64()?,
                operation: input.get_operation()?,
            },
            LogRecordType::EndTransaction => RecordBody::EndTransaction {
                transaction_id: input.get_i64()?,
                is_committed: input.get_bool()?,
            },
            LogRecordType::Barrier => RecordBody::Barrier {
                last_stable_lsn: input.get_i64()?,
            },
            LogRecordType::UpdateEpoch => RecordBody::UpdateEpoch {
                epoch: input.get_epoch()?,
                primary_replica_id: input.get_uuid()?,
            },
            LogRecordType::Backup => RecordBody::Backup(BackupBody {
                backup_id: input.get_uuid()?,
                highest_backed_up_epoch: input.get_epoch()?,
                highest_backed_up_lsn: input.get_i64()?,
                backup_log_record_count: input.get_u32()?,
                backup_log_size: input.get_u64()?,
            }),
            LogRecordType::Indexing => RecordBody::Indexing {
                current_epoch: input.get_epoch()?,
                linked_physical_psn: input.get_i64()?,
            },
            LogRecordType::BeginCheckpoint => RecordBody::BeginCheckpoint(BeginCheckpointBody {
                earliest_pending_transaction_lsn: input.get_i64()?,
                earliest_pending_transaction_psn: input.get_i64()?,
                earliest_pending_transaction_position: input.get_u64()?,
                epoch: input.get_epoch()?,
                is_first_checkpoint_on_full_copy: input.get_bool()?,
                periodic_checkpoint_time_ms: input.get_i64()?,
                linked_physical_psn: input.get_i64()?,
            }),
            LogRecordType::EndCheckpoint => RecordBody::EndCheckpoint(EndCheckpointBody {
                log_head: input.get_log_head()?,
                last_stable_lsn: input.get_i64()?,
                last_completed_begin_checkpoint_psn: input.get_i64()?,
                linked_physical_psn: input.get_i64()?,
            }),
            LogRecordType::CompleteCheckpoint => RecordBody::CompleteCheckpoint {
                log_head: input.get_log_head()?,
                linked_physical_psn: input.get_i64()?,
            },
            LogRecordType::TruncateHead => RecordBody::TruncateHead {
                log_head: input.get_log_head()?,
                is_stable: input.get_bool()?,
                periodic_truncation_time_ms: input.get_i64()?,
                linked_physical_psn: input.get_i64()?,
            },
            LogRecordType::TruncateTail => RecordBody::TruncateTail,
            LogRecordType::Information => RecordBody::Information {
                event: InformationEvent::from_u32(input.get_u32()?)?,
            },
        };
        Ok(body)
    }
}

/// Little-endian body encoder
#[derive(Debug, Default)]
pub(crate) struct BodyWriter {
    buf: Vec<u8>,
}

impl BodyWriter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub(crate) fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn put_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn put_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    pub(crate) fn put_bytes(&mut self, value: &[u8]) {
        self.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value);
    }

    fn put_uuid(&mut self, value: &Uuid) {
        self.buf.extend_from_slice(value.as_bytes());
    }

    fn put_epoch(&mut self, value: &Epoch) {
        self.put_i64(value.data_loss_version);
        self.put_i64(value.configuration_version);
    }

    fn put_log_head(&mut self, head: &LogHead) {
        self.put_epoch(&head.epoch);
        self.put_i64(head.lsn);
        self.put_i64(head.psn);
        self.put_u64(head.position);
    }

    fn put_operation(&mut self, operation: &OperationData) {
        self.put_bytes(&operation.metadata);
        self.put_bytes(&operation.redo);
        self.put_bytes(&operation.undo);
    }
}

/// Little-endian body decoder over a borrowed slice
#[derive(Debug)]
pub(crate) struct BodyReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> BodyReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub(crate) fn take(&mut self, len: usize) -> RecordResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(RecordError::malformed(format!(
                "body needs {} more bytes at offset {}, {} left",
                len,
                self.offset,
                self.remaining()
            )));
        }
        let slice = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> RecordResult<[u8; N]> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.take(N)?);
        Ok(array)
    }

    pub(crate) fn get_u32(&mut self) -> RecordResult<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub(crate) fn get_u64(&mut self) -> RecordResult<u64> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    pub(crate) fn get_i64(&mut self) -> RecordResult<i64> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    fn get_bool(&mut self) -> RecordResult<bool> {
        match self.take(1)?[0] {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(RecordError::malformed(format!("invalid bool byte {}", other))),
        }
    }

    pub(crate) fn get_bytes(&mut self) -> RecordResult<Vec<u8>> {
        let len = self.get_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn get_uuid(&mut self) -> RecordResult<Uuid> {
        Ok(Uuid::from_bytes(self.take_array()?))
    }

    fn get_epoch(&mut self) -> RecordResult<Epoch> {
        Ok(Epoch {
            data_loss_version: self.get_i64()?,
            configuration_version: self.get_i64()?,
        })
    }

    fn get_log_head(&mut self) -> RecordResult<LogHead> {
        Ok(LogHead {
            epoch: self.get_epoch()?,
            lsn: self.get_i64()?,
            psn: self.get_i64()?,
            position: self.get_u64()?,
        })
    }

    fn get_operation(&mut self) -> RecordResult<OperationData> {
        Ok(OperationData {
            metadata: self.get_bytes()?,
            redo: self.get_bytes()?,
            undo: self.get_bytes()?,
        })
    }
}

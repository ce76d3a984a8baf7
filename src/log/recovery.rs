//! Log scanning and recovery information
//!
//! `LogRecordsReader` walks the frames of a log forward from its head. A frame
//! cut short by the end of the log is a torn write from a crash and ends the
//! scan; any other decoding failure is fatal.
//!
//! `RecoveryInformation` summarizes the live records: the tail, the physical
//! chain and the latest checkpoint boundary. It is computed after recovery
//! and again after a tail truncation rewinds the log.

use std::sync::Arc;

use super::super::record::{
    decode_frame, CheckpointState, DecodedFrame, Epoch, LogRecord, LogRecordType, Lsn, Psn,
    RecordArena, RecordBody, RecordError, RecordResult, ZERO_LSN,
};

/// One decoded frame and where it starts
#[derive(Debug, Clone)]
pub struct ScannedFrame {
    pub position: u64,
    pub frame: DecodedFrame,
}

/// Result of scanning a log
#[derive(Debug, Default)]
pub struct ScannedLog {
    pub frames: Vec<ScannedFrame>,
    /// End of the last complete frame
    pub valid_end: u64,
    /// Whether a partial frame followed the last complete one
    pub torn_tail: bool,
}

/// Forward scanner over the bytes of a log
pub struct LogRecordsReader<'a> {
    bytes: &'a [u8],
    base_position: u64,
    offset: usize,
}

impl<'a> LogRecordsReader<'a> {
    /// `bytes` start at log position `base_position`
    pub fn new(bytes: &'a [u8], base_position: u64) -> Self {
        Self {
            bytes,
            base_position,
            offset: 0,
        }
    }

    fn position(&self) -> u64 {
        self.base_position + self.offset as u64
    }

    /// Decode the next frame.
    ///
    /// `Ok(None)` at the clean end of the log.
    pub fn next_frame(&mut self) -> RecordResult<Option<ScannedFrame>> {
        if self.offset >= self.bytes.len() {
            return Ok(None);
        }
        let position = self.position();
        let frame = decode_frame(&self.bytes[self.offset..], position)?;
        self.offset += frame.length as usize;
        Ok(Some(ScannedFrame { position, frame }))
    }

    /// Decode every complete frame, stopping at a torn tail
    pub fn read_all(mut self) -> RecordResult<ScannedLog> {
        let mut scanned = ScannedLog {
            valid_end: self.base_position,
            ..Default::default()
        };
        loop {
            match self.next_frame() {
                Ok(Some(frame)) => {
                    scanned.valid_end = frame.position + u64::from(frame.frame.length);
                    scanned.frames.push(frame);
                }
                Ok(None) => break,
                Err(e) if e.is_torn_tail() => {
                    scanned.torn_tail = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(scanned)
    }
}

/// State of the log derived from its live records
#[derive(Debug, Clone)]
pub struct RecoveryInformation {
    pub tail: Arc<LogRecord>,
    pub tail_lsn: Lsn,
    pub tail_epoch: Epoch,
    pub last_physical: Option<Arc<LogRecord>>,
    pub last_linked_physical: Option<Arc<LogRecord>>,
    pub last_index: Option<Arc<LogRecord>>,
    pub last_completed_begin_checkpoint: Option<Arc<LogRecord>>,
    pub last_completed_end_checkpoint: Option<Arc<LogRecord>>,
    /// BeginCheckpoint with no matching EndCheckpoint
    pub last_in_progress_checkpoint: Option<Arc<LogRecord>>,
    /// Indexing record at the log head
    pub current_head: Arc<LogRecord>,
    pub last_stable_lsn: Lsn,
}

impl RecoveryInformation {
    /// Summarize the records currently in `arena`
    pub fn from_arena(arena: &RecordArena) -> RecordResult<Self> {
        let records = arena.records();
        let tail = records
            .last()
            .cloned()
            .ok_or_else(|| RecordError::malformed("log has no records"))?;

        let mut tail_epoch = Epoch::ZERO;
        let mut last_physical = None;
        let mut last_linked_physical = None;
        let mut last_index = None;
        let mut last_completed_begin_checkpoint = None;
        let mut last_completed_end_checkpoint = None;
        let mut last_in_progress_checkpoint = None;
        let mut head_psn: Option<Psn> = None;
        let mut last_stable_lsn = ZERO_LSN;

        for record in &records {
            let record_type = record.record_type();
            if record_type.is_physical() {
                last_physical = Some(Arc::clone(record));
            }
            if record_type.is_linked_physical() {
                last_linked_physical = Some(Arc::clone(record));
            }
            match record.body() {
                RecordBody::UpdateEpoch { epoch, .. } => tail_epoch = *epoch,
                RecordBody::Indexing { current_epoch, .. } => {
                    tail_epoch = *current_epoch;
                    last_index = Some(Arc::clone(record));
                }
                RecordBody::Barrier { last_stable_lsn: stable } => {
                    last_stable_lsn = last_stable_lsn.max(*stable);
                }
                RecordBody::BeginCheckpoint(_) => {
                    last_in_progress_checkpoint = Some(Arc::clone(record));
                }
                RecordBody::EndCheckpoint(body) => {
                    let begin = arena.get(body.last_completed_begin_checkpoint_psn).ok_or_else(|| {
                        RecordError::malformed(format!(
                            "end checkpoint {} refers to missing begin psn {}",
                            record, body.last_completed_begin_checkpoint_psn
                        ))
                    })?;
                    if begin.record_type() != LogRecordType::BeginCheckpoint {
                        return Err(RecordError::malformed(format!(
                            "end checkpoint {} refers to {}",
                            record, begin
                        )));
                    }
                    begin.set_checkpoint_state(CheckpointState::Completed);
                    last_completed_begin_checkpoint = Some(begin);
                    last_completed_end_checkpoint = Some(Arc::clone(record));
                    last_in_progress_checkpoint = None;
                    last_stable_lsn = last_stable_lsn.max(body.last_stable_lsn);
                    head_psn = Some(body.log_head.psn);
                }
                RecordBody::CompleteCheckpoint { log_head, .. }
                | RecordBody::TruncateHead { log_head, .. } => head_psn = Some(log_head.psn),
                _ => {}
            }
        }

        let current_head = head_psn
            .and_then(|psn| arena.get(psn))
            .filter(|r| r.record_type() == LogRecordType::Indexing)
            .or_else(|| {
                records
                    .iter()
                    .find(|r| r.record_type() == LogRecordType::Indexing)
                    .cloned()
            })
            .ok_or_else(|| RecordError::malformed("log has no indexing record at its head"))?;

        Ok(Self {
            tail_lsn: tail.lsn(),
            tail,
            tail_epoch,
            last_physical,
            last_linked_physical,
            last_index,
            last_completed_begin_checkpoint,
            last_completed_end_checkpoint,
            last_in_progress_checkpoint,
            current_head,
            last_stable_lsn,
        })
    }
}

//! Record framing
//!
//! On-disk frame layout (all integers little-endian):
//!
//! ```text
//! +-------------+----------------------------+----------------------------------+-------------+--------+-------------+
//! | total (u32) | logical section            | physical section                 | body        | crc32  | total (u32) |
//! |             | len(u32) type(u32) lsn(i64)| len(u32) psn(i64) prev_delta(u64)| len(u32) .. | (u32)  |             |
//! +-------------+----------------------------+----------------------------------+-------------+--------+-------------+
//! ```
//!
//! - `total` is repeated at both ends so the log can be scanned in either
//!   direction.
//! - Each section is length-prefixed; readers skip trailing fields they do
//!   not know.
//! - `prev_delta` is the byte distance back to the previous physical record,
//!   `0` when there is none. A relative delta keeps the frame replay-stable.
//! - Replication ships only the logical section and the body.

use std::sync::Arc;

use super::body::{BodyReader, BodyWriter, RecordBody};
use super::checksum::compute_checksum;
use super::errors::{RecordError, RecordResult};
use super::log_record::LogRecord;
use super::types::{LogRecordType, Lsn, Psn};

const LENGTH_FIELD_SIZE: usize = 4;
const CHECKSUM_SIZE: usize = 4;
const LOGICAL_SECTION_SIZE: usize = 12;
const PHYSICAL_SECTION_SIZE: usize = 16;

/// Smallest possible frame: empty body, no unknown fields
pub const MIN_FRAME_SIZE: usize = LENGTH_FIELD_SIZE
    + (LENGTH_FIELD_SIZE + LOGICAL_SECTION_SIZE)
    + (LENGTH_FIELD_SIZE + PHYSICAL_SECTION_SIZE)
    + LENGTH_FIELD_SIZE
    + CHECKSUM_SIZE
    + LENGTH_FIELD_SIZE;

/// A frame read back from the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub record_type: LogRecordType,
    pub lsn: Lsn,
    pub psn: Psn,
    pub previous_physical_delta: u64,
    pub body: RecordBody,
    pub length: u32,
}

fn encode_logical_section(out: &mut BodyWriter, record_type: LogRecordType, lsn: Lsn) {
    out.put_u32(LOGICAL_SECTION_SIZE as u32);
    out.put_u32(record_type.as_u32());
    out.put_i64(lsn);
}

fn encode_body(body: &RecordBody) -> Vec<u8> {
    let mut out = BodyWriter::new();
    body.encode(&mut out);
    out.into_bytes()
}

/// Serialize `record` into an on-disk frame.
///
/// The record's PSN must already be assigned.
pub fn encode_frame(record: &LogRecord, previous_physical_delta: u64) -> Vec<u8> {
    let mut content = BodyWriter::new();
    encode_logical_section(&mut content, record.record_type(), record.lsn());
    content.put_u32(PHYSICAL_SECTION_SIZE as u32);
    content.put_i64(record.psn());
    content.put_u64(previous_physical_delta);
    content.put_bytes(&encode_body(record.body()));
    let content = content.into_bytes();

    let total = (LENGTH_FIELD_SIZE + content.len() + CHECKSUM_SIZE + LENGTH_FIELD_SIZE) as u32;
    let mut frame = Vec::with_capacity(total as usize);
    frame.extend_from_slice(&total.to_le_bytes());
    frame.extend_from_slice(&content);
    let checksum = compute_checksum(&frame);
    frame.extend_from_slice(&checksum.to_le_bytes());
    frame.extend_from_slice(&total.to_le_bytes());
    frame
}

/// Decode the frame starting at the beginning of `bytes`.
///
/// `position` is the frame's log offset, used for error context only.
/// `bytes` may extend past the frame.
pub fn decode_frame(bytes: &[u8], position: u64) -> RecordResult<DecodedFrame> {
    if bytes.len() < LENGTH_FIELD_SIZE {
        return Err(RecordError::Truncated {
            position,
            needed: LENGTH_FIELD_SIZE,
            available: bytes.len(),
        });
    }
    let total = read_u32(bytes, 0);
    let total_len = total as usize;
    if total_len < MIN_FRAME_SIZE {
        return Err(RecordError::malformed(format!(
            "frame at position {} declares length {}",
            position, total
        )));
    }
    if bytes.len() < total_len {
        return Err(RecordError::Truncated {
            position,
            needed: total_len,
            available: bytes.len(),
        });
    }

    let frame = &bytes[..total_len];
    let trailing = read_u32(frame, total_len - LENGTH_FIELD_SIZE);
    if trailing != total {
        return Err(RecordError::LengthMismatch {
            position,
            leading: total,
            trailing,
        });
    }

    let checksum_offset = total_len - LENGTH_FIELD_SIZE - CHECKSUM_SIZE;
    let stored = read_u32(frame, checksum_offset);
    let computed = compute_checksum(&frame[..checksum_offset]);
    if stored != computed {
        return Err(RecordError::ChecksumMismatch {
            position,
            stored,
            computed,
        });
    }

    let mut content = BodyReader::new(&frame[LENGTH_FIELD_SIZE..checksum_offset]);
    let (record_type, lsn) = decode_logical_section(&mut content)?;

    let section_len = content.get_u32()? as usize;
    if section_len < PHYSICAL_SECTION_SIZE {
        return Err(RecordError::malformed(format!(
            "physical section of {} bytes",
            section_len
        )));
    }
    let mut physical = BodyReader::new(content.take(section_len)?);
    let psn = physical.get_i64()?;
    let previous_physical_delta = physical.get_u64()?;

    let body_bytes = content.get_bytes()?;
    let body = RecordBody::decode(record_type, &mut BodyReader::new(&body_bytes))?;

    Ok(DecodedFrame {
        record_type,
        lsn,
        psn,
        previous_physical_delta,
        body,
        length: total,
    })
}

fn decode_logical_section(content: &mut BodyReader<'_>) -> RecordResult<(LogRecordType, Lsn)> {
    let section_len = content.get_u32()? as usize;
    if section_len < LOGICAL_SECTION_SIZE {
        return Err(RecordError::malformed(format!(
            "logical section of {} bytes",
            section_len
        )));
    }
    let mut logical = BodyReader::new(content.take(section_len)?);
    let record_type = LogRecordType::from_u32(logical.get_u32()?)?;
    let lsn = logical.get_i64()?;
    Ok((record_type, lsn))
}

/// Serialize the replicated form of a logical record
pub fn encode_logical(record: &LogRecord) -> Vec<u8> {
    debug_assert!(record.record_type().is_logical());
    let mut out = BodyWriter::new();
    encode_logical_section(&mut out, record.record_type(), record.lsn());
    out.put_bytes(&encode_body(record.body()));
    out.into_bytes()
}

/// Decode a record received from the replication or copy stream
pub fn decode_logical(bytes: &[u8]) -> RecordResult<Arc<LogRecord>> {
    let mut input = BodyReader::new(bytes);
    let (record_type, lsn) = decode_logical_section(&mut input)?;
    if !record_type.is_logical() {
        return Err(RecordError::malformed(format!(
            "{} is not a replicated record type",
            record_type
        )));
    }
    let body_bytes = input.get_bytes()?;
    let body = RecordBody::decode(record_type, &mut BodyReader::new(&body_bytes))?;
    Ok(LogRecord::new(lsn, body))
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut field = [0u8; LENGTH_FIELD_SIZE];
    field.copy_from_slice(&bytes[offset..offset + LENGTH_FIELD_SIZE]);
    u32::from_le_bytes(field)
}

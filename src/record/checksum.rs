//! CRC32 checksums over record frames
//!
//! Uses CRC32 (IEEE polynomial). The checksum covers the leading length
//! field and every section of the frame; only the checksum itself and the
//! trailing length field are excluded.

use crc32fast::Hasher;

/// Compute the CRC32 of `data`
pub fn compute_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

//! Reader range tracking
//!
//! Every active consumer of the log (recovery, backup, copy builds) pins the
//! position it reads from. Ranges are reference counted: readers of the same
//! type starting at the same position share one range. The lowest pinned
//! position is the floor below which the head may not be truncated.

use std::collections::BTreeMap;

/// Kind of log consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LogReaderType {
    Recovery,
    Backup,
    FullCopy,
    PartialCopy,
    Default,
}

/// One pinned range of the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogReaderRange {
    pub starting_position: u64,
    pub reader_type: LogReaderType,
    pub ref_count: u32,
}

/// Reader ranges sorted by starting position
#[derive(Debug, Default)]
pub struct LogReaderRanges {
    ranges: BTreeMap<(u64, LogReaderType), u32>,
}

impl LogReaderRanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `starting_position` for one more reader
    pub fn add(&mut self, starting_position: u64, reader_type: LogReaderType) {
        *self
            .ranges
            .entry((starting_position, reader_type))
            .or_insert(0) += 1;
    }

    /// Release one reader.
    ///
    /// Returns whether the range itself went away.
    ///
    /// # Panics
    ///
    /// Panics if no such reader was registered.
    pub fn remove(&mut self, starting_position: u64, reader_type: LogReaderType) -> bool {
        let key = (starting_position, reader_type);
        let count = self.ranges.get_mut(&key).unwrap_or_else(|| {
            panic!(
                "removing unregistered {:?} reader at {}",
                reader_type, starting_position
            )
        });
        *count -= 1;
        if *count == 0 {
            self.ranges.remove(&key);
            true
        } else {
            false
        }
    }

    /// The reader with the lowest starting position
    pub fn earliest(&self) -> Option<LogReaderRange> {
        self.ranges
            .iter()
            .next()
            .map(|(&(starting_position, reader_type), &ref_count)| LogReaderRange {
                starting_position,
                reader_type,
                ref_count,
            })
    }

    /// Whether truncating the head at `position` keeps every reader's data
    pub fn permits_head_truncation(&self, position: u64) -> bool {
        self.earliest()
            .map_or(true, |earliest| position <= earliest.starting_position)
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

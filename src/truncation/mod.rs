//! Tail truncation and undo of false progress

mod tail;

pub use tail::TailTruncator;

//! replog - replicated transactional log core
//!
//! Turns an unordered stream of replicated operations into a gap-free,
//! durable, checkpointed log, and applies it to a state provider.
//!
//! Layers, bottom up:
//! - `record`: record model, framing codec, completion signals
//! - `storage`: log stream collaborators (memory, file)
//! - `pipeline`: group-commit writer and flushed-batch hand-off
//! - `log`: log lifecycle, recovery scan, reader-gated head truncation
//! - `ordering`: LSN ordering, chain records, replication
//! - `processor`: applying flushed records
//! - `truncation`: undo of false progress
//! - `replicated_log`: the composition root

pub mod config;
pub mod errors;
pub mod log;
pub mod observability;
pub mod ordering;
pub mod pipeline;
pub mod processor;
pub mod record;
pub mod replicated_log;
pub mod storage;
mod sync;
pub mod truncation;

pub use config::ReplicatorConfig;
pub use errors::{LogError, LogResult, Severity};
pub use replicated_log::ReplicatedLog;

//! PhaseScope for begin/complete tracing of multi-step log operations
//!
//! - Logs `{name}_BEGIN` on creation
//! - Logs `{name}_COMPLETE` with the elapsed time on `complete()`
//! - Logs `{name}_FAILED` on `fail()`
//! - Logs `{name}_INCOMPLETE` if dropped without either

use std::fmt;
use std::time::Instant;

/// A scope that traces the start and end of one phase
///
/// # Usage
///
/// ```ignore
/// let scope = PhaseScope::new("CHECKPOINT_PERFORM", begin.lsn());
/// // ... do work ...
/// scope.complete();
/// ```
pub struct PhaseScope {
    name: &'static str,
    lsn: i64,
    started: Instant,
    finished: bool,
}

impl PhaseScope {
    /// Create a new scope and log `{name}_BEGIN`
    pub fn new(name: &'static str, lsn: i64) -> Self {
        tracing::info!(phase = name, lsn, "{}_BEGIN", name);
        Self {
            name,
            lsn,
            started: Instant::now(),
            finished: false,
        }
    }

    /// Mark the phase as completed
    pub fn complete(mut self) {
        self.finished = true;
        tracing::info!(
            phase = self.name,
            lsn = self.lsn,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "{}_COMPLETE",
            self.name
        );
    }

    /// Mark the phase as failed with a reason
    pub fn fail(mut self, reason: impl fmt::Display) {
        self.finished = true;
        tracing::error!(
            phase = self.name,
            lsn = self.lsn,
            reason = %reason,
            "{}_FAILED",
            self.name
        );
    }
}

impl Drop for PhaseScope {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(
                phase = self.name,
                lsn = self.lsn,
                "{}_INCOMPLETE",
                self.name
            );
        }
    }
}

//! Rate-limited warnings
//!
//! Expected replication failures can arrive in bursts (every in-flight
//! operation fails when the replica loses primary status). Only the first
//! warning inside each interval is emitted; the next emitted warning reports
//! how many were suppressed in between.

use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::sync::lock;

#[derive(Debug, Default)]
struct WarningState {
    last_emitted: Option<Instant>,
    suppressed: u64,
}

/// A warning channel emitting at most once per interval
#[derive(Debug)]
pub struct RateLimitedWarning {
    name: &'static str,
    interval: Duration,
    state: Mutex<WarningState>,
}

impl RateLimitedWarning {
    pub fn new(name: &'static str, interval: Duration) -> Self {
        Self {
            name,
            interval,
            state: Mutex::new(WarningState::default()),
        }
    }

    /// Emit `message` unless a warning was emitted within the interval.
    ///
    /// Returns whether the warning was emitted.
    pub fn warn(&self, message: impl fmt::Display) -> bool {
        self.warn_at(Instant::now(), message)
    }

    fn warn_at(&self, now: Instant, message: impl fmt::Display) -> bool {
        let suppressed = {
            let mut state = lock(&self.state);
            let due = state
                .last_emitted
                .map_or(true, |last| now.duration_since(last) >= self.interval);
            if !due {
                state.suppressed += 1;
                return false;
            }
            state.last_emitted = Some(now);
            std::mem::take(&mut state.suppressed)
        };

        tracing::warn!(
            warning = self.name,
            suppressed,
            "{}",
            message
        );
        true
    }

    /// Warnings suppressed since the last emitted one
    pub fn suppressed(&self) -> u64 {
        lock(&self.state).suppressed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suppresses_within_interval() {
        let warning = RateLimitedWarning::new("replication", Duration::from_secs(60));
        let start = Instant::now();

        assert!(warning.warn_at(start, "not primary"));
        assert!(!warning.warn_at(start + Duration::from_secs(1), "not primary"));
        assert!(!warning.warn_at(start + Duration::from_secs(2), "not primary"));
        assert_eq!(warning.suppressed(), 2);

        assert!(warning.warn_at(start + Duration::from_secs(61), "not primary"));
        assert_eq!(warning.suppressed(), 0);
    }

    #[test]
    fn test_zero_interval_never_suppresses() {
        let warning = RateLimitedWarning::new("replication", Duration::ZERO);
        assert!(warning.warn("first"));
        assert!(warning.warn("second"));
    }
}

//! Observability for the replicated log
//!
//! - Structured logging through `tracing`
//! - Monotonic counters (`LogMetrics`)
//! - Begin/complete phase tracing (`PhaseScope`)
//! - Rate-limited warnings for expected failure bursts
//!
//! Observability is read-only: nothing here changes how the log behaves.

mod metrics;
mod rate_limit;
mod scope;

pub use metrics::{LogMetrics, LogMetricsSnapshot};
pub use rate_limit::RateLimitedWarning;
pub use scope::PhaseScope;

//! Dispatch telemetry for monitoring and the CLI.
//!
//! ```text
//! DispatchEngine::run ─────► DispatchMetrics ─────► TelemetrySnapshot ─────► Views
//!                            (atomic counters)      (point-in-time copy)      (CLI, JSON)
//! ```
//!
//! The snapshot is the only integration point for external reporting; it is
//! `Serialize` and renders as plain text through `Display`.

mod metrics;
mod snapshot;

pub use metrics::{DispatchCounters, DispatchMetrics};
pub use snapshot::{FailureSummary, TelemetrySnapshot};

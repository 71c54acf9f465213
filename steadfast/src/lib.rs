//! Steadfast - resilient adaptive dispatch
//!
//! This library decides, for every unit of work a host submits, whether to
//! run it, how to run it and what to do when it fails. It combines:
//!
//! - a bounded, liveness-aware result cache ([`cache`])
//! - a circuit breaker and a learning error-recovery coordinator
//!   ([`resilience`])
//! - a latency-adaptive probabilistic throttle ([`throttle`])
//! - the orchestrating [`DispatchEngine`] ([`dispatch`])
//!
//! Execution backends are abstract: a unit of work is a ranked list of
//! async strategies, each with an availability flag.

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod random;
pub mod resilience;
pub mod telemetry;
pub mod throttle;

pub use config::{ConfigFile, EngineConfig};
pub use dispatch::{
    DispatchEngine, DispatchOutcome, EngineBuilder, ExecutionStrategy, RunOptions, SkipReason,
    WorkItem, WorkKey,
};
pub use error::{ConfigError, DispatchError, ErrorKind, OperationError};
pub use telemetry::TelemetrySnapshot;

/// Library version, for CLI banners and logs.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

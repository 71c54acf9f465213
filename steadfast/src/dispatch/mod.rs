//! Work dispatch: the orchestrator that ties cache, throttle, breaker and
//! recovery together.
//!
//! - [`work`]: keys, strategies and per-call options
//! - [`outcome`]: everything a run can return
//! - [`engine`]: [`DispatchEngine`] and its builder
//! - [`coalesce`]: opt-in single-flight for concurrent runs of one key
//! - [`maintenance`]: host-spawned periodic cleanup

pub mod coalesce;
pub mod engine;
pub mod maintenance;
pub mod outcome;
pub mod work;

pub use coalesce::{Flight, InFlightRegistry, LeaderGuard};
pub use engine::{DispatchConfig, DispatchEngine, EngineBuilder, ResultProbe, DEFAULT_TIMEOUT_MS};
pub use maintenance::{MaintenanceDaemon, DEFAULT_MAINTENANCE_INTERVAL};
pub use outcome::{DispatchOutcome, SkipReason};
pub use work::{DispatchContext, ExecuteFn, ExecutionStrategy, RunOptions, WorkItem, WorkKey};

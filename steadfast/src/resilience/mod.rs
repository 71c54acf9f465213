//! Failure handling: circuit breaking, retries and recovery strategies.
//!
//! The pieces compose from the outside in:
//!
//! ```text
//! CircuitBreaker::call(
//!     ErrorRecoveryCoordinator::execute_with_recovery(
//!         attempt -> [RecoveryStrategy] -> backoff -> attempt ...
//!     )
//! )
//! ```
//!
//! The breaker sees one outcome per dispatched call: success, degraded
//! (counted as a failure) or cancelled (not counted).

mod circuit_breaker;
mod policy;
mod recovery;
mod strategy;

pub use circuit_breaker::{
    BreakerStats, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState,
    DEFAULT_FAILURE_THRESHOLD, DEFAULT_MONITORING_WINDOW_MS, DEFAULT_RECOVERY_TIMEOUT_MS,
    DEFAULT_SUCCESS_THRESHOLD,
};
pub use policy::{
    RetryPolicy, DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_MAX_BACKOFF_DELAY_MS,
    DEFAULT_MAX_RETRY_ATTEMPTS, DEFAULT_RETRY_DELAY_MS,
};
pub use recovery::{
    DegradedResult, ErrorRecoveryCoordinator, ExecutionLimits, FailureRecord, RecoveryOutcome,
    ScoredStrategy, StrategyScore,
};
pub use strategy::{
    FnStrategy, LoadShedder, RecoveryAction, RecoveryError, RecoveryStrategy, ShedLoadStrategy,
    DEFAULT_SHED_FRACTION, SHED_HINT,
};

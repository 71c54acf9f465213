//! Failure-counting circuit breaker.
//!
//! Guards a shared operation so that sustained failure sheds load instead of
//! repeatedly paying for doomed attempts.
//!
//! # State Machine
//!
//! ```text
//! Closed --[failures in monitoring_window >= failure_threshold]--> Open
//! Open --[recovery_timeout elapsed, next call]--> HalfOpen
//! HalfOpen --[consecutive successes >= success_threshold]--> Closed
//! HalfOpen --[any failure]--> Open (opened_at reset)
//! ```
//!
//! Every failed attempt counts regardless of its [`ErrorKind`]; kind-specific
//! handling belongs to the recovery coordinator. Cancellations are the one
//! exception: they skip both `on_success` and `on_failure`.
//!
//! # Thread Safety
//!
//! State sits behind a `parking_lot::Mutex` held only for bookkeeping, never
//! across the guarded operation's `.await`.
//!
//! [`ErrorKind`]: crate::error::ErrorKind

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::Failure;

/// Default in-window failures that open the circuit.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default time the circuit stays open before allowing a probe (30s).
pub const DEFAULT_RECOVERY_TIMEOUT_MS: u64 = 30_000;

/// Default sliding window over which failures are counted (60s).
pub const DEFAULT_MONITORING_WINDOW_MS: u64 = 60_000;

/// Default consecutive half-open successes needed to close.
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 2;

/// Configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failures within `monitoring_window` that trip the circuit.
    pub failure_threshold: u32,
    /// Minimum time between opening and the first half-open probe.
    pub recovery_timeout: Duration,
    /// Sliding window for failure counting.
    pub monitoring_window: Duration,
    /// Consecutive half-open successes required to close.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout: Duration::from_millis(DEFAULT_RECOVERY_TIMEOUT_MS),
            monitoring_window: Duration::from_millis(DEFAULT_MONITORING_WINDOW_MS),
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls go through.
    Closed,
    /// Failing fast - calls are short-circuited until the recovery timeout.
    Open,
    /// Probing - calls go through; one failure re-opens.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// The circuit is open; the operation was not invoked.
    #[error("circuit breaker {name} is open (retry in {}ms)", retry_in.as_millis())]
    Open { name: String, retry_in: Duration },

    /// The operation ran and failed (or was cancelled).
    #[error("operation failed: {0}")]
    Operation(E),
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// Timestamps of failures inside the monitoring window, oldest first.
    failure_window: VecDeque<Instant>,
    /// Only meaningful while half-open.
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    successes: u64,
    failures: u64,
    short_circuits: u64,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_window: VecDeque::new(),
            consecutive_successes: 0,
            opened_at: None,
            successes: 0,
            failures: 0,
            short_circuits: 0,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.failure_window.front() {
            if now.duration_since(oldest) > window {
                self.failure_window.pop_front();
            } else {
                break;
            }
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.consecutive_successes = 0;
    }
}

/// Counters exposed for telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub failures_in_window: usize,
    pub successes: u64,
    pub failures: u64,
    pub short_circuits: u64,
}

impl BreakerStats {
    /// Lifetime `failures / (successes + failures)`, `0.0` before any call.
    pub fn failure_rate(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            0.0
        } else {
            self.failures as f64 / total as f64
        }
    }
}

/// Three-state failure gate with sliding-window failure counting.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("inner", &self.inner)
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a closed circuit breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        debug!(
            breaker = %name,
            failure_threshold = config.failure_threshold,
            recovery_timeout_ms = config.recovery_timeout.as_millis() as u64,
            success_threshold = config.success_threshold,
            "Circuit breaker initialized"
        );
        Self {
            name,
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, without triggering the timed Open -> HalfOpen move.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// When the circuit last opened.
    pub fn opened_at(&self) -> Option<Instant> {
        self.inner.lock().opened_at
    }

    /// Failures currently inside the monitoring window.
    pub fn failures_in_window(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.prune(Instant::now(), self.config.monitoring_window);
        inner.failure_window.len()
    }

    pub fn stats(&self) -> BreakerStats {
        let mut inner = self.inner.lock();
        inner.prune(Instant::now(), self.config.monitoring_window);
        BreakerStats {
            state: inner.state,
            failures_in_window: inner.failure_window.len(),
            successes: inner.successes,
            failures: inner.failures,
            short_circuits: inner.short_circuits,
        }
    }

    /// Decide whether a call may proceed.
    ///
    /// Performs the Open -> HalfOpen transition once the recovery timeout has
    /// elapsed. Returns the remaining wait when the call must be shed.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if inner.state != CircuitState::Open {
            return Ok(());
        }

        let opened_at = match inner.opened_at {
            Some(at) => at,
            None => {
                warn!(breaker = %self.name, "Circuit open without timestamp, probing");
                inner.state = CircuitState::HalfOpen;
                return Ok(());
            }
        };

        let elapsed = now.duration_since(opened_at);
        if elapsed >= self.config.recovery_timeout {
            inner.state = CircuitState::HalfOpen;
            inner.consecutive_successes = 0;
            info!(
                breaker = %self.name,
                open_ms = elapsed.as_millis() as u64,
                "Circuit breaker half-open, probing recovery"
            );
            Ok(())
        } else {
            inner.short_circuits += 1;
            Err(self.config.recovery_timeout - elapsed)
        }
    }

    /// Record one successful attempt.
    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        inner.successes += 1;

        if inner.state == CircuitState::HalfOpen {
            inner.consecutive_successes += 1;
            if inner.consecutive_successes >= self.config.success_threshold {
                inner.state = CircuitState::Closed;
                inner.failure_window.clear();
                inner.consecutive_successes = 0;
                inner.opened_at = None;
                info!(breaker = %self.name, "Circuit breaker CLOSED");
            }
        }
    }

    /// Record one failed attempt.
    pub fn on_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.failures += 1;
        inner.failure_window.push_back(now);
        inner.prune(now, self.config.monitoring_window);

        let in_window = inner.failure_window.len();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.open(now);
                warn!(
                    breaker = %self.name,
                    "Circuit breaker probe failed, re-opening"
                );
            }
            CircuitState::Closed if in_window >= self.config.failure_threshold as usize => {
                inner.open(now);
                warn!(
                    breaker = %self.name,
                    failures_in_window = in_window,
                    threshold = self.config.failure_threshold,
                    "Circuit breaker OPENED"
                );
            }
            _ => {
                debug!(
                    breaker = %self.name,
                    failures_in_window = in_window,
                    state = %inner.state,
                    "Circuit breaker recorded failure"
                );
            }
        }
    }

    /// Run `operation` under breaker protection.
    ///
    /// While open, the operation is not invoked and
    /// [`CircuitBreakerError::Open`] is returned immediately.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        E: Failure,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Err(retry_in) = self.try_acquire() {
            return Err(CircuitBreakerError::Open {
                name: self.name.clone(),
                retry_in,
            });
        }

        match operation().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(error) if error.is_cancellation() => {
                debug!(breaker = %self.name, "Operation cancelled, not counted");
                Err(CircuitBreakerError::Operation(error))
            }
            Err(error) => {
                self.on_failure();
                Err(CircuitBreakerError::Operation(error))
            }
        }
    }

    /// Like [`call`](Self::call), but answers with `fallback()` while open.
    pub async fn call_with_fallback<T, E, F, Fut, FB>(
        &self,
        operation: F,
        fallback: FB,
    ) -> Result<T, E>
    where
        E: Failure,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce() -> T,
    {
        match self.call(operation).await {
            Ok(value) => Ok(value),
            Err(CircuitBreakerError::Open { .. }) => Ok(fallback()),
            Err(CircuitBreakerError::Operation(error)) => Err(error),
        }
    }

    /// Drop expired failure timestamps.
    pub fn prune(&self) {
        self.inner
            .lock()
            .prune(Instant::now(), self.config.monitoring_window);
    }

    /// Force the breaker back to a fresh closed state.
    pub fn reset(&self) {
        *self.inner.lock() = BreakerInner::new();
        info!(breaker = %self.name, "Circuit breaker reset");
    }
}

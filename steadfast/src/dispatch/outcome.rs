//! Results of `DispatchEngine::run`.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::resilience::DegradedResult;

/// Why work was not attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The throttle's coin flip said no.
    Throttled,
    /// No strategy was marked available.
    Unavailable,
    /// The breaker is open and the caller supplied no fallback.
    CircuitOpen,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Throttled => "throttled",
            SkipReason::Unavailable => "unavailable",
            SkipReason::CircuitOpen => "circuit_open",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Every non-exceptional way a dispatch can end.
///
/// Hosts should treat `Skipped`, `Degraded` and `Cancelled` as "try again
/// next tick", not as errors.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome<R> {
    Completed {
        result: R,
        duration: Duration,
        /// Strategy that produced the result.
        method: String,
        from_cache: bool,
        /// Attempts made; 0 for cache hits.
        attempts: u32,
    },
    /// Breaker open; the caller's fallback value is returned.
    Fallback { result: R, retry_in: Duration },
    Skipped { reason: SkipReason },
    Degraded(DegradedResult),
    Cancelled,
}

impl<R> DispatchOutcome<R> {
    pub fn skipped(reason: SkipReason) -> Self {
        DispatchOutcome::Skipped { reason }
    }

    /// `true` only for `Completed`.
    pub fn is_success(&self) -> bool {
        matches!(self, DispatchOutcome::Completed { .. })
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, DispatchOutcome::Degraded(_))
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            DispatchOutcome::Skipped { reason } => Some(*reason),
            _ => None,
        }
    }

    /// Result from a completion or a fallback.
    pub fn result(&self) -> Option<&R> {
        match self {
            DispatchOutcome::Completed { result, .. }
            | DispatchOutcome::Fallback { result, .. } => Some(result),
            _ => None,
        }
    }

    pub fn into_result(self) -> Option<R> {
        match self {
            DispatchOutcome::Completed { result, .. }
            | DispatchOutcome::Fallback { result, .. } => Some(result),
            _ => None,
        }
    }

    /// Short label for logs and CLI tallies.
    pub fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Completed {
                from_cache: true, ..
            } => "cache_hit",
            DispatchOutcome::Completed { .. } => "completed",
            DispatchOutcome::Fallback { .. } => "fallback",
            DispatchOutcome::Skipped { reason } => reason.as_str(),
            DispatchOutcome::Degraded(_) => "degraded",
            DispatchOutcome::Cancelled => "cancelled",
        }
    }
}

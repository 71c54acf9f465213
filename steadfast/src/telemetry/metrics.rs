//! Lock-free dispatch counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::dispatch::{DispatchOutcome, SkipReason};

/// Counters updated on every `run`.
///
/// All fields are atomics so concurrent runs never contend on a lock.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    dispatched: AtomicU64,
    completed: AtomicU64,
    cache_hits: AtomicU64,
    throttled: AtomicU64,
    unavailable: AtomicU64,
    short_circuited: AtomicU64,
    fallbacks: AtomicU64,
    degraded: AtomicU64,
    cancelled: AtomicU64,
    coalesced: AtomicU64,
}

/// Point-in-time copy of [`DispatchMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchCounters {
    pub dispatched: u64,
    /// Fresh executions that succeeded (cache hits excluded).
    pub completed: u64,
    pub cache_hits: u64,
    pub throttled: u64,
    pub unavailable: u64,
    /// Breaker-open skips without a fallback.
    pub short_circuited: u64,
    pub fallbacks: u64,
    pub degraded: u64,
    pub cancelled: u64,
    /// Runs that shared another caller's in-flight execution. These are
    /// counted here only, never under the outcome counters above.
    pub coalesced: u64,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one finished run by its outcome.
    pub fn record<R>(&self, outcome: &DispatchOutcome<R>) {
        let counter = match outcome {
            DispatchOutcome::Completed {
                from_cache: true, ..
            } => &self.cache_hits,
            DispatchOutcome::Completed { .. } => &self.completed,
            DispatchOutcome::Fallback { .. } => &self.fallbacks,
            DispatchOutcome::Skipped { reason } => match reason {
                SkipReason::Throttled => &self.throttled,
                SkipReason::Unavailable => &self.unavailable,
                SkipReason::CircuitOpen => &self.short_circuited,
            },
            DispatchOutcome::Degraded(_) => &self.degraded,
            DispatchOutcome::Cancelled => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchCounters {
        DispatchCounters {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            unavailable: self.unavailable.load(Ordering::Relaxed),
            short_circuited: self.short_circuited.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_record_by_outcome() {
        let metrics = DispatchMetrics::new();
        metrics.dispatched();
        metrics.dispatched();
        metrics.record(&DispatchOutcome::Completed {
            result: 1u8,
            duration: Duration::ZERO,
            method: "baseline".into(),
            from_cache: true,
            attempts: 0,
        });
        metrics.record::<u8>(&DispatchOutcome::skipped(SkipReason::CircuitOpen));

        let counters = metrics.snapshot();
        assert_eq!(counters.dispatched, 2);
        assert_eq!(counters.cache_hits, 1);
        assert_eq!(counters.completed, 0);
        assert_eq!(counters.short_circuited, 1);
    }
}

//! Retry policy and backoff math.
//!
//! The delay before retry `n` (1-based, where 1 is the first retry) is
//!
//! ```text
//! backoff_delay(n) = min(retry_delay * multiplier^(n-1), max_backoff_delay)
//! ```
//!
//! The computation is deterministic: no jitter is applied, so the same
//! policy always yields the same schedule.

use std::time::Duration;

// =============================================================================
// Retry Policy Constants
// =============================================================================

/// Default total attempts, including the first.
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;

/// Default delay before the first retry (100ms).
pub const DEFAULT_RETRY_DELAY_MS: u64 = 100;

/// Default cap on any single backoff delay (5 seconds).
pub const DEFAULT_MAX_BACKOFF_DELAY_MS: u64 = 5_000;

/// Default multiplier applied per retry.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Growth steps after which the delay is assumed to have reached its cap.
const MAX_BACKOFF_STEPS: u32 = 4096;

/// How failed attempts are retried.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub retry_delay: Duration,
    /// Multiplier applied to the delay after each failure (>= 1.0).
    pub backoff_multiplier: f64,
    /// Cap on any single delay.
    pub max_backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(DEFAULT_MAX_RETRY_ATTEMPTS)
    }
}

impl RetryPolicy {
    /// Exponential backoff with default delay, multiplier and cap.
    pub fn exponential(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_backoff_delay: Duration::from_millis(DEFAULT_MAX_BACKOFF_DELAY_MS),
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Set the base delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set the multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Set the delay cap.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_backoff_delay = max_delay;
        self
    }

    /// Total attempts allowed (never less than one).
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before retry number `attempt` (1-based).
    ///
    /// Attempt `0` is treated as `1`. The delay is grown one step at a time
    /// in whole nanoseconds and stops at the cap, so the schedule is exact
    /// for integral millisecond inputs and never decreases.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let steps = (attempt.max(1) - 1).min(MAX_BACKOFF_STEPS);
        let cap_nanos = self.max_backoff_delay.as_nanos() as f64;
        let mut delay_nanos = self.retry_delay.as_nanos() as f64;

        for _ in 0..steps {
            if delay_nanos >= cap_nanos {
                break;
            }
            delay_nanos *= self.backoff_multiplier;
        }

        if !delay_nanos.is_finite() {
            return self.max_backoff_delay;
        }
        Duration::from_nanos(delay_nanos.min(cap_nanos) as u64).min(self.max_backoff_delay)
    }

    /// Delay to wait after failed attempt `attempt`, or `None` if that was
    /// the last allowed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt < self.max_attempts() {
            Some(self.backoff_delay(attempt))
        } else {
            None
        }
    }
}

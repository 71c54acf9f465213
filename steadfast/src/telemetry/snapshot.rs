//! Read-only telemetry snapshot.

use std::fmt;

use chrono::{DateTime, Local, SecondsFormat};
use serde::Serialize;
use tokio::time::Instant;

use super::metrics::DispatchCounters;
use crate::error::ErrorKind;
use crate::resilience::{CircuitState, FailureRecord, ScoredStrategy};
use crate::throttle::{DeviceClass, ThrottleLevel};

/// Export form of a [`FailureRecord`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureSummary {
    pub kind: ErrorKind,
    /// Milliseconds since the failure.
    pub age_ms: u64,
    pub duration_ms: u64,
    pub attempt: u32,
}

impl FailureSummary {
    pub fn from_record(record: &FailureRecord, now: Instant) -> Self {
        Self {
            kind: record.kind,
            age_ms: now.duration_since(record.timestamp).as_millis() as u64,
            duration_ms: record.duration.as_millis() as u64,
            attempt: record.attempt,
        }
    }
}

/// Everything an external monitor needs, captured at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    /// RFC 3339 local timestamp.
    pub captured_at: String,
    pub breaker_state: CircuitState,
    /// Lifetime share of breaker-observed calls that failed.
    pub failure_rate: f64,
    pub failures_in_window: usize,
    pub cache_hit_rate: f64,
    pub cache_entries: usize,
    pub cache_capacity: usize,
    pub skip_probability: f64,
    pub throttle_level: ThrottleLevel,
    pub device_class: DeviceClass,
    pub recent_failures: Vec<FailureSummary>,
    pub counters: DispatchCounters,
    pub strategy_scores: Vec<ScoredStrategy>,
    pub in_flight: usize,
    pub closed: bool,
}

impl TelemetrySnapshot {
    pub(crate) fn timestamp() -> String {
        let now: DateTime<Local> = Local::now();
        now.to_rfc3339_opts(SecondsFormat::Millis, false)
    }

    /// Pretty-printed JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for TelemetrySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Captured:         {}", self.captured_at)?;
        writeln!(
            f,
            "Circuit breaker:  {} ({} failure(s) in window, {:.1}% failure rate)",
            self.breaker_state,
            self.failures_in_window,
            self.failure_rate * 100.0
        )?;
        writeln!(
            f,
            "Cache:            {}/{} entries, {:.1}% hit rate",
            self.cache_entries,
            self.cache_capacity,
            self.cache_hit_rate * 100.0
        )?;
        writeln!(
            f,
            "Throttle:         {} (skip probability {:.3}, {} device)",
            self.throttle_level, self.skip_probability, self.device_class
        )?;

        let c = &self.counters;
        writeln!(
            f,
            "Dispatched:       {} (completed {}, cache hits {}, coalesced {})",
            c.dispatched, c.completed, c.cache_hits, c.coalesced
        )?;
        writeln!(
            f,
            "Not completed:    throttled {}, unavailable {}, short-circuited {}, fallbacks {}, degraded {}, cancelled {}",
            c.throttled, c.unavailable, c.short_circuited, c.fallbacks, c.degraded, c.cancelled
        )?;

        if !self.strategy_scores.is_empty() {
            writeln!(f, "Recovery strategies:")?;
            for entry in &self.strategy_scores {
                writeln!(
                    f,
                    "  {:<20} {:<20} {} ok / {} failed / {} errored",
                    entry.kind,
                    entry.name,
                    entry.score.successes,
                    entry.score.failures,
                    entry.score.recovery_errors
                )?;
            }
        }
        write!(f, "Recent failures:  {}", self.recent_failures.len())
    }
}

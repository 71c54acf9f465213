//! Probabilistic load shedding driven by observed latency.
//!
//! The throttle keeps a base skip-probability that moves with the mean of
//! the most recent samples:
//!
//! | Recent mean | Change |
//! |---|---|
//! | `> 0.8 × budget` | `+0.05`, capped at 0.99 |
//! | `< 0.3 × budget` | `-0.01`, floored at `skip_floor` |
//!
//! A single sample over budget also adds a one-shot `+0.02` penalty. The
//! effective probability is the base scaled by the device multiplier and
//! clamped to `[0, 0.99]`. `permit()` is a coin flip against it, so bursts
//! are thinned statistically rather than hard-capped.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::capability::DeviceProfile;
use crate::random::RandomSource;
use crate::resilience::LoadShedder;

// =============================================================================
// Throttle Constants
// =============================================================================

/// Default per-operation budget (one 60 Hz frame).
pub const DEFAULT_PERFORMANCE_BUDGET_MS: u64 = 16;

/// Default starting skip-probability.
pub const DEFAULT_THROTTLE_RATE: f64 = 0.0;

/// Default lower bound the base probability relaxes to.
pub const DEFAULT_SKIP_FLOOR: f64 = 0.0;

/// Upper bound on any skip-probability.
pub const MAX_SKIP_PROBABILITY: f64 = 0.99;

/// Rolling buffer size.
pub const DEFAULT_SAMPLE_CAPACITY: usize = 100;

/// Samples averaged for each adaptation step.
pub const ADAPTATION_WINDOW: usize = 10;

/// Upper bound on the buffer allocated up front; larger capacities grow on demand.
const MAX_PREALLOCATED_SAMPLES: usize = 1024;

/// Mean/budget ratio above which the throttle tightens.
pub const OVERLOAD_RATIO: f64 = 0.8;

/// Mean/budget ratio below which the throttle relaxes.
pub const RELAXED_RATIO: f64 = 0.3;

pub const INCREASE_STEP: f64 = 0.05;
pub const DECREASE_STEP: f64 = 0.01;

/// One-shot increase for a sample over budget.
pub const OVER_BUDGET_PENALTY: f64 = 0.02;

/// Throttle configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottleConfig {
    /// Maximum acceptable duration per operation.
    pub performance_budget: Duration,
    /// Starting skip-probability in `[0, 0.99]`.
    pub throttle_rate: f64,
    /// Lowest value relaxation brings the base probability to.
    pub skip_floor: f64,
    /// Rolling sample buffer size.
    pub sample_capacity: usize,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            performance_budget: Duration::from_millis(DEFAULT_PERFORMANCE_BUDGET_MS),
            throttle_rate: DEFAULT_THROTTLE_RATE,
            skip_floor: DEFAULT_SKIP_FLOOR,
            sample_capacity: DEFAULT_SAMPLE_CAPACITY,
        }
    }
}

impl ThrottleConfig {
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.performance_budget = budget;
        self
    }

    pub fn with_throttle_rate(mut self, rate: f64) -> Self {
        self.throttle_rate = rate;
        self
    }

    pub fn with_skip_floor(mut self, floor: f64) -> Self {
        self.skip_floor = floor;
        self
    }
}

/// A recorded operation duration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceSample {
    pub timestamp: Instant,
    pub duration: Duration,
}

/// Decides whether a unit of work should run at all.
///
/// # Implementors
///
/// - [`AdaptiveThrottle`] - latency-driven probabilistic shedding
/// - [`NeverThrottle`] - Testing: always permits
/// - [`AlwaysThrottle`] - Testing: never permits
pub trait Throttler: Send + Sync {
    /// Draw once: `true` means proceed.
    fn permit(&self) -> bool;

    /// Report how long a completed (or degraded) operation took.
    fn record(&self, duration: Duration);

    /// Current effective skip-probability in `[0, 0.99]`.
    fn skip_probability(&self) -> f64;

    /// Apply a new device profile. No-op by default.
    fn set_device_profile(&self, _profile: &DeviceProfile) {}
}

/// Coarse reading of the skip-probability for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleLevel {
    /// Nothing is skipped.
    Open,
    /// Some work is skipped.
    Shedding,
    /// Most work is skipped.
    Saturated,
}

impl ThrottleLevel {
    pub fn from_probability(p: f64) -> Self {
        if p <= 0.0 {
            ThrottleLevel::Open
        } else if p < 0.5 {
            ThrottleLevel::Shedding
        } else {
            ThrottleLevel::Saturated
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ThrottleLevel::Open => "open",
            ThrottleLevel::Shedding => "shedding",
            ThrottleLevel::Saturated => "saturated",
        }
    }
}

impl fmt::Display for ThrottleLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Throttle counters for telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThrottleStats {
    pub permitted: u64,
    pub skipped: u64,
    pub base_rate: f64,
    pub device_multiplier: f64,
    pub skip_probability: f64,
    pub samples: usize,
    /// Mean of the adaptation window, in milliseconds.
    pub recent_mean_ms: Option<f64>,
}

#[derive(Debug)]
struct ThrottleInner {
    base_rate: f64,
    device_multiplier: f64,
    samples: VecDeque<PerformanceSample>,
}

impl ThrottleInner {
    fn effective(&self) -> f64 {
        (self.base_rate * self.device_multiplier).clamp(0.0, MAX_SKIP_PROBABILITY)
    }

    fn recent_mean(&self) -> Option<Duration> {
        let window: Vec<Duration> = self
            .samples
            .iter()
            .rev()
            .take(ADAPTATION_WINDOW)
            .map(|s| s.duration)
            .collect();
        if window.is_empty() {
            return None;
        }
        let total: Duration = window.iter().sum();
        Some(total / window.len() as u32)
    }

    fn raise(&mut self, step: f64) {
        self.base_rate = (self.base_rate + step).min(MAX_SKIP_PROBABILITY);
    }
}

/// Latency-adaptive probabilistic throttle.
pub struct AdaptiveThrottle {
    config: ThrottleConfig,
    random: Arc<dyn RandomSource>,
    inner: Mutex<ThrottleInner>,
    permitted: AtomicU64,
    skipped: AtomicU64,
}

impl fmt::Debug for AdaptiveThrottle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptiveThrottle")
            .field("config", &self.config)
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl AdaptiveThrottle {
    pub fn new(
        config: ThrottleConfig,
        profile: &DeviceProfile,
        random: Arc<dyn RandomSource>,
    ) -> Self {
        let base_rate = config.throttle_rate.clamp(0.0, MAX_SKIP_PROBABILITY);
        let capacity = config.sample_capacity.max(ADAPTATION_WINDOW);
        Self {
            inner: Mutex::new(ThrottleInner {
                base_rate,
                device_multiplier: profile.multiplier(),
                samples: VecDeque::with_capacity(capacity.min(MAX_PREALLOCATED_SAMPLES)),
            }),
            config,
            random,
            permitted: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Alias of [`Throttler::skip_probability`].
    pub fn current_rate(&self) -> f64 {
        self.inner.lock().effective()
    }

    /// Base probability before the device multiplier.
    pub fn base_rate(&self) -> f64 {
        self.inner.lock().base_rate
    }

    pub fn device_multiplier(&self) -> f64 {
        self.inner.lock().device_multiplier
    }

    pub fn sample_count(&self) -> usize {
        self.inner.lock().samples.len()
    }

    pub fn level(&self) -> ThrottleLevel {
        ThrottleLevel::from_probability(self.current_rate())
    }

    /// Raise the base probability by the over-budget penalty.
    pub fn penalize(&self) {
        let mut inner = self.inner.lock();
        inner.raise(OVER_BUDGET_PENALTY);
        debug!(base_rate = inner.base_rate, "Throttle penalized");
    }

    pub fn stats(&self) -> ThrottleStats {
        let inner = self.inner.lock();
        ThrottleStats {
            permitted: self.permitted.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            base_rate: inner.base_rate,
            device_multiplier: inner.device_multiplier,
            skip_probability: inner.effective(),
            samples: inner.samples.len(),
            recent_mean_ms: inner.recent_mean().map(|d| d.as_secs_f64() * 1000.0),
        }
    }
}

impl Throttler for AdaptiveThrottle {
    fn permit(&self) -> bool {
        let p = self.current_rate();
        let allowed = self.random.next_f64() >= p;
        if allowed {
            self.permitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.skipped.fetch_add(1, Ordering::Relaxed);
        }
        allowed
    }

    fn record(&self, duration: Duration) {
        let budget = self.config.performance_budget;
        let capacity = self.config.sample_capacity.max(ADAPTATION_WINDOW);
        let mut inner = self.inner.lock();

        inner.samples.push_back(PerformanceSample {
            timestamp: Instant::now(),
            duration,
        });
        while inner.samples.len() > capacity {
            inner.samples.pop_front();
        }

        if duration > budget {
            inner.raise(OVER_BUDGET_PENALTY);
        }

        let before = inner.base_rate;
        if let Some(mean) = inner.recent_mean() {
            let ratio = mean.as_secs_f64() / budget.as_secs_f64().max(f64::MIN_POSITIVE);
            if ratio > OVERLOAD_RATIO {
                inner.raise(INCREASE_STEP);
            } else if ratio < RELAXED_RATIO && inner.base_rate > self.config.skip_floor {
                inner.base_rate = (inner.base_rate - DECREASE_STEP).max(self.config.skip_floor);
            }
        }

        if inner.base_rate != before {
            debug!(
                mean_ms = inner.recent_mean().map(|d| d.as_millis() as u64),
                budget_ms = budget.as_millis() as u64,
                base_rate = inner.base_rate,
                "Throttle adapted"
            );
        } else {
            trace!(duration_ms = duration.as_millis() as u64, "Throttle sample");
        }
    }

    fn skip_probability(&self) -> f64 {
        self.current_rate()
    }

    fn set_device_profile(&self, profile: &DeviceProfile) {
        let multiplier = profile.multiplier();
        self.inner.lock().device_multiplier = multiplier;
        debug!(
            class = %profile.class(),
            multiplier,
            "Throttle device profile updated"
        );
    }
}

impl LoadShedder for AdaptiveThrottle {
    fn name(&self) -> &str {
        "throttle"
    }

    /// Applies the over-budget penalty once; `fraction` does not scale it.
    fn shed(&self, _fraction: f64) -> usize {
        let before = self.base_rate();
        self.penalize();
        usize::from(self.base_rate() > before)
    }
}

/// Testing throttler that always permits.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverThrottle;

impl Throttler for NeverThrottle {
    fn permit(&self) -> bool {
        true
    }

    fn record(&self, _duration: Duration) {}

    fn skip_probability(&self) -> f64 {
        0.0
    }
}

/// Testing throttler that never permits.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysThrottle;

impl Throttler for AlwaysThrottle {
    fn permit(&self) -> bool {
        false
    }

    fn record(&self, _duration: Duration) {}

    fn skip_probability(&self) -> f64 {
        MAX_SKIP_PROBABILITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::{FixedRandom, SeededRandom};

    const EPS: f64 = 1e-9;

    fn standard() -> DeviceProfile {
        DeviceProfile::new(4, Some(4.0))
    }

    fn throttle(config: ThrottleConfig) -> AdaptiveThrottle {
        AdaptiveThrottle::new(config, &standard(), Arc::new(SeededRandom::new(99)))
    }

    fn budget_10ms() -> ThrottleConfig {
        ThrottleConfig::default().with_budget(Duration::from_millis(10))
    }

    #[test]
    fn test_zero_probability_always_permits() {
        let throttle = throttle(ThrottleConfig::default());
        assert!((0..10_000).all(|_| throttle.permit()));
        assert_eq!(throttle.stats().skipped, 0);
    }

    #[test]
    fn test_zero_probability_permits_zero_sample() {
        let throttle = AdaptiveThrottle::new(
            ThrottleConfig::default(),
            &standard(),
            Arc::new(FixedRandom(0.0)),
        );
        assert!(throttle.permit());
    }

    #[test]
    fn test_high_probability_rarely_permits() {
        let throttle = throttle(ThrottleConfig::default().with_throttle_rate(0.99));
        let permitted = (0..10_000).filter(|_| throttle.permit()).count();
        assert!(permitted > 30, "permitted {}", permitted);
        assert!(permitted < 250, "permitted {}", permitted);
    }

    #[test]
    fn test_huge_sample_capacity_allocates_lazily() {
        let mut config = budget_10ms();
        config.sample_capacity = usize::MAX;
        let throttle = throttle(config);

        for _ in 0..20 {
            throttle.record(Duration::from_millis(1));
        }
        assert_eq!(throttle.inner.lock().samples.len(), 20);
        assert!(throttle.inner.lock().samples.capacity() < usize::MAX / 2);
    }

    #[test]
    fn test_overload_tightens() {
        let throttle = throttle(budget_10ms());
        for _ in 0..10 {
            throttle.record(Duration::from_millis(9));
        }
        assert!((throttle.current_rate() - 0.5).abs() < EPS);
    }

    #[test]
    fn test_over_budget_sample_adds_penalty() {
        let throttle = throttle(budget_10ms());
        throttle.record(Duration::from_millis(20));
        assert!((throttle.current_rate() - (OVER_BUDGET_PENALTY + INCREASE_STEP)).abs() < EPS);
    }

    #[test]
    fn test_middle_band_holds_steady() {
        let throttle = throttle(budget_10ms().with_throttle_rate(0.2));
        for _ in 0..20 {
            throttle.record(Duration::from_millis(5));
        }
        assert!((throttle.current_rate() - 0.2).abs() < EPS);
    }

    #[test]
    fn test_relaxes_to_floor() {
        let throttle = throttle(budget_10ms().with_throttle_rate(0.5).with_skip_floor(0.45));
        throttle.record(Duration::from_millis(1));
        assert!((throttle.current_rate() - 0.49).abs() < EPS);

        for _ in 0..50 {
            throttle.record(Duration::from_millis(1));
        }
        assert!((throttle.current_rate() - 0.45).abs() < EPS);
    }

    #[test]
    fn test_tightening_capped() {
        let throttle = throttle(budget_10ms());
        for _ in 0..100 {
            throttle.record(Duration::from_millis(50));
        }
        assert!((throttle.current_rate() - MAX_SKIP_PROBABILITY).abs() < EPS);
    }

    #[test]
    fn test_device_multiplier_scales() {
        let random: Arc<dyn RandomSource> = Arc::new(SeededRandom::new(1));
        let config = ThrottleConfig::default().with_throttle_rate(0.4);

        let constrained =
            AdaptiveThrottle::new(config.clone(), &DeviceProfile::new(2, None), random.clone());
        assert!((constrained.current_rate() - 0.6).abs() < EPS);

        let capable =
            AdaptiveThrottle::new(config, &DeviceProfile::new(16, Some(32.0)), random.clone());
        assert!((capable.current_rate() - 0.3).abs() < EPS);

        let clamped = AdaptiveThrottle::new(
            ThrottleConfig::default().with_throttle_rate(0.9),
            &DeviceProfile::new(1, None),
            random,
        );
        assert!((clamped.current_rate() - MAX_SKIP_PROBABILITY).abs() < EPS);
    }

    #[test]
    fn test_set_device_profile() {
        let throttle = throttle(ThrottleConfig::default().with_throttle_rate(0.4));
        throttle.set_device_profile(&DeviceProfile::new(2, Some(1.0)));
        assert!((throttle.skip_probability() - 0.6).abs() < EPS);
        assert_eq!(throttle.device_multiplier(), 1.5);
    }

    #[test]
    fn test_sample_buffer_bounded() {
        let throttle = throttle(ThrottleConfig::default());
        for _ in 0..250 {
            throttle.record(Duration::from_millis(1));
        }
        assert_eq!(throttle.sample_count(), DEFAULT_SAMPLE_CAPACITY);
    }

    #[test]
    fn test_shed_applies_penalty() {
        let throttle = throttle(ThrottleConfig::default());
        assert_eq!(throttle.shed(0.5), 1);
        assert!((throttle.base_rate() - OVER_BUDGET_PENALTY).abs() < EPS);
    }

    #[test]
    fn test_level() {
        assert_eq!(ThrottleLevel::from_probability(0.0), ThrottleLevel::Open);
        assert_eq!(ThrottleLevel::from_probability(0.2), ThrottleLevel::Shedding);
        assert_eq!(ThrottleLevel::from_probability(0.9), ThrottleLevel::Saturated);
        assert_eq!(format!("{}", ThrottleLevel::Shedding), "shedding");
    }

    #[test]
    fn test_test_throttlers() {
        assert!(NeverThrottle.permit());
        assert!(!AlwaysThrottle.permit());
        assert_eq!(NeverThrottle.skip_probability(), 0.0);
    }
}

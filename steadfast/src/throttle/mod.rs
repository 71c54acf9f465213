//! Admission control.
//!
//! The throttle is consulted before any resilience machinery: a skipped unit
//! of work costs one random draw and never touches the breaker or a
//! strategy.

mod adaptive;
mod capability;

pub use adaptive::{
    AdaptiveThrottle, AlwaysThrottle, NeverThrottle, PerformanceSample, ThrottleConfig,
    ThrottleLevel, ThrottleStats, Throttler, ADAPTATION_WINDOW, DEFAULT_PERFORMANCE_BUDGET_MS,
    DEFAULT_SAMPLE_CAPACITY, DEFAULT_SKIP_FLOOR, DEFAULT_THROTTLE_RATE, MAX_SKIP_PROBABILITY,
};
pub use capability::{
    Backend, CapabilityProvider, CapabilitySnapshot, DeviceClass, DeviceProfile,
    StaticCapabilities, SystemCapabilities,
};

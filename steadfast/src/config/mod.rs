//! Engine configuration.
//!
//! [`EngineConfig`] bundles the per-component configs. Every field has a
//! default; [`EngineConfig::validate`] rejects values that would make a
//! component misbehave (zero thresholds, probabilities outside `[0, 0.99]`,
//! shrinking backoff, ...). [`ConfigFile`] reads and writes the INI form.

mod file;

use std::time::Duration;

pub use file::{ConfigFile, CONFIG_DIR_NAME, CONFIG_FILE_NAME};

use crate::cache::CacheConfig;
use crate::dispatch::DispatchConfig;
use crate::error::ConfigError;
use crate::resilience::{CircuitBreakerConfig, RetryPolicy};
use crate::throttle::{ThrottleConfig, ADAPTATION_WINDOW, MAX_SKIP_PROBABILITY};

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineConfig {
    pub breaker: CircuitBreakerConfig,
    pub recovery: RetryPolicy,
    pub cache: CacheConfig,
    pub throttle: ThrottleConfig,
    pub dispatch: DispatchConfig,
}

impl EngineConfig {
    pub fn with_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_recovery(mut self, recovery: RetryPolicy) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_throttle(mut self, throttle: ThrottleConfig) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Check every value is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let breaker = &self.breaker;
        if breaker.failure_threshold == 0 {
            return Err(ConfigError::invalid("breaker.failure_threshold", "must be at least 1"));
        }
        if breaker.success_threshold == 0 {
            return Err(ConfigError::invalid("breaker.success_threshold", "must be at least 1"));
        }
        if breaker.monitoring_window.is_zero() {
            return Err(ConfigError::invalid("breaker.monitoring_window_ms", "must be positive"));
        }

        let recovery = &self.recovery;
        if recovery.max_attempts == 0 {
            return Err(ConfigError::invalid("recovery.max_retry_attempts", "must be at least 1"));
        }
        if !recovery.backoff_multiplier.is_finite() || recovery.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "recovery.backoff_multiplier",
                format!("must be a finite value >= 1.0, got {}", recovery.backoff_multiplier),
            ));
        }
        if recovery.max_backoff_delay < recovery.retry_delay {
            return Err(ConfigError::invalid(
                "recovery.max_backoff_delay_ms",
                "must not be smaller than retry_delay_ms",
            ));
        }

        if self.cache.capacity == 0 {
            return Err(ConfigError::invalid("cache.capacity", "must be at least 1"));
        }
        if self.cache.default_ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(ConfigError::invalid("cache.ttl_ms", "must be positive when set"));
        }

        let throttle = &self.throttle;
        if throttle.performance_budget.is_zero() {
            return Err(ConfigError::invalid("throttle.performance_budget_ms", "must be positive"));
        }
        check_probability("throttle.throttle_rate", throttle.throttle_rate)?;
        check_probability("throttle.skip_floor", throttle.skip_floor)?;
        if throttle.sample_capacity < ADAPTATION_WINDOW {
            return Err(ConfigError::invalid(
                "throttle.sample_capacity",
                format!("must be at least {}", ADAPTATION_WINDOW),
            ));
        }

        if self.dispatch.default_timeout.is_some_and(|t| t == Duration::ZERO) {
            return Err(ConfigError::invalid("dispatch.timeout_ms", "must be positive when set"));
        }
        Ok(())
    }
}

fn check_probability(field: &str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=MAX_SKIP_PROBABILITY).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            field,
            format!("must be within [0, {}], got {}", MAX_SKIP_PROBABILITY, value),
        ))
    }
}

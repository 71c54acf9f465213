//! Bounded result cache with liveness checks.
//!
//! The dispatcher writes every successful result here and consults it before
//! doing any other work. Entries leave the cache in exactly three ways:
//!
//! - **Capacity pressure**: inserting past `capacity` evicts the single oldest
//!   entry (insertion order).
//! - **TTL expiry**: detected lazily on `get`, or in bulk by `cleanup()`.
//! - **Liveness loss**: the owner marked the entry dead, or the configured
//!   liveness probe rejects the stored value (e.g. a `Weak` that no longer
//!   upgrades).
//!
//! `cleanup()` is never self-scheduled; the owner calls it (see
//! [`crate::dispatch::MaintenanceDaemon`]).

mod evicting;

use std::time::Duration;

pub use evicting::{CacheStats, CleanupReport, EvictingCache, LivenessProbe};

/// Default maximum number of cached results.
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// Cache configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Maximum number of entries (must be at least 1).
    pub capacity: usize,

    /// TTL applied to entries stored without an explicit one.
    ///
    /// `None` means entries only leave via capacity or liveness.
    pub default_ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CACHE_CAPACITY,
            default_ttl: None,
        }
    }
}

impl CacheConfig {
    /// Config with the given capacity and no default TTL.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            default_ttl: None,
        }
    }

    /// Set the default TTL.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }
}

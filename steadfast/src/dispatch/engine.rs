//! The dispatch engine.
//!
//! [`DispatchEngine::run`] decides, for one unit of work, whether to run it,
//! how to run it and what to do when it fails:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                          DispatchEngine::run                       │
//! │                                                                    │
//! │  WorkItem ──► ┌─────────────┐                                      │
//! │               │ Cache Check │──► Hit ──► Completed (from_cache)    │
//! │               └──────┬──────┘                                      │
//! │                      │ Miss                                        │
//! │                      ▼                                             │
//! │               ┌─────────────┐                                      │
//! │               │  Throttle   │──► Denied ──► Skipped (throttled)    │
//! │               └──────┬──────┘                                      │
//! │                      ▼                                             │
//! │               ┌─────────────┐                                      │
//! │               │  Strategy   │──► None ──► Skipped (unavailable)    │
//! │               └──────┬──────┘                                      │
//! │                      ▼                                             │
//! │               ┌─────────────┐                                      │
//! │               │  Breaker    │──► Open ──► Fallback / Skipped       │
//! │               │  Recovery   │──► Exhausted ──► Degraded            │
//! │               └──────┬──────┘                                      │
//! │                      ▼                                             │
//! │               ┌─────────────┐                                      │
//! │               │ Cache Write │──► Completed                         │
//! │               └─────────────┘                                      │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! One engine serves many concurrent runs; breaker, cache and throttle state
//! are shared between them.
//!
//! # Example
//!
//! ```ignore
//! use steadfast::dispatch::{DispatchEngine, ExecutionStrategy, RunOptions};
//! use steadfast::EngineConfig;
//!
//! let engine: DispatchEngine<Layout> = DispatchEngine::new(EngineConfig::default())?;
//! let strategies = vec![
//!     ExecutionStrategy::new("accelerated", false, |ctx| measure_on_gpu(ctx)),
//!     ExecutionStrategy::new("baseline", true, |ctx| measure(ctx)),
//! ];
//! let outcome = engine.run("panel-12", strategies, RunOptions::default()).await?;
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::coalesce::{Flight, InFlightRegistry};
use super::outcome::{DispatchOutcome, SkipReason};
use super::work::{DispatchContext, ExecutionStrategy, RunOptions, WorkItem, WorkKey};
use crate::cache::{CleanupReport, EvictingCache};
use crate::config::EngineConfig;
use crate::error::{ConfigError, DispatchError, ErrorKind, Failure};
use crate::random::{RandomSource, ThreadRandom};
use crate::resilience::{
    CircuitBreaker, CircuitBreakerError, DegradedResult, ErrorRecoveryCoordinator,
    ExecutionLimits, LoadShedder, RecoveryOutcome, RecoveryStrategy, ShedLoadStrategy,
};
use crate::telemetry::{DispatchMetrics, FailureSummary, TelemetrySnapshot};
use crate::throttle::{
    AdaptiveThrottle, CapabilityProvider, CapabilitySnapshot, SystemCapabilities, ThrottleLevel,
    Throttler,
};

/// Default per-attempt timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Name of the engine's circuit breaker in logs.
const BREAKER_NAME: &str = "dispatch";

/// Dispatcher settings (`[dispatch]` in the config file).
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    /// Per-attempt timeout used when a run does not set one.
    pub default_timeout: Option<Duration>,
    /// Share one in-flight execution between concurrent runs of a key.
    pub coalesce_in_flight: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_timeout: Some(Duration::from_millis(DEFAULT_TIMEOUT_MS)),
            coalesce_in_flight: false,
        }
    }
}

/// Host check deciding whether a cached result is still alive.
pub type ResultProbe<R> = Arc<dyn Fn(&R) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
struct CachedResult<R> {
    result: R,
    method: String,
}

/// How a breaker-protected run failed.
#[derive(Debug, Error)]
enum RunFailure {
    #[error("{0}")]
    Degraded(DegradedResult),
    #[error("cancelled")]
    Cancelled,
}

impl Failure for RunFailure {
    fn error_kind(&self) -> ErrorKind {
        match self {
            RunFailure::Degraded(degraded) => degraded.error.kind,
            RunFailure::Cancelled => ErrorKind::Cancelled,
        }
    }

    fn is_cancellation(&self) -> bool {
        matches!(self, RunFailure::Cancelled)
    }
}

/// Builder for [`DispatchEngine`].
///
/// Everything except the config has a production default: system
/// capabilities, thread-local randomness, an [`AdaptiveThrottle`] and the
/// built-in [`ShedLoadStrategy`].
pub struct EngineBuilder<R> {
    config: EngineConfig,
    capabilities: Option<Arc<dyn CapabilityProvider>>,
    random: Option<Arc<dyn RandomSource>>,
    throttler: Option<Arc<dyn Throttler>>,
    strategies: Vec<Arc<dyn RecoveryStrategy>>,
    liveness: Option<ResultProbe<R>>,
    shed_load: bool,
}

impl<R> fmt::Debug for EngineBuilder<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .field("strategies", &self.strategies.len())
            .field("shed_load", &self.shed_load)
            .finish_non_exhaustive()
    }
}

impl<R> EngineBuilder<R>
where
    R: Clone + Send + Sync + 'static,
{
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            capabilities: None,
            random: None,
            throttler: None,
            strategies: Vec::new(),
            liveness: None,
            shed_load: true,
        }
    }

    pub fn with_capabilities(mut self, provider: Arc<dyn CapabilityProvider>) -> Self {
        self.capabilities = Some(provider);
        self
    }

    /// Random source shared by the throttle and strategy selection.
    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = Some(random);
        self
    }

    /// Replace the built-in adaptive throttle.
    pub fn with_throttler(mut self, throttler: Arc<dyn Throttler>) -> Self {
        self.throttler = Some(throttler);
        self
    }

    /// Register a recovery strategy. Registered after the built-ins, so a
    /// strategy named `shed_load` replaces the default one.
    pub fn with_strategy(mut self, strategy: Arc<dyn RecoveryStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Liveness check applied to cached results on every lookup and cleanup.
    pub fn with_liveness<F>(mut self, probe: F) -> Self
    where
        F: Fn(&R) -> bool + Send + Sync + 'static,
    {
        self.liveness = Some(Arc::new(probe));
        self
    }

    /// Skip registering the built-in [`ShedLoadStrategy`].
    pub fn without_shed_load(mut self) -> Self {
        self.shed_load = false;
        self
    }

    pub fn build(self) -> Result<DispatchEngine<R>, ConfigError> {
        self.config.validate()?;

        let config = self.config;
        let capabilities = self
            .capabilities
            .unwrap_or_else(|| Arc::new(SystemCapabilities::new()));
        let random = self.random.unwrap_or_else(|| Arc::new(ThreadRandom));
        let snapshot = capabilities.snapshot();

        let mut cache = EvictingCache::new(&config.cache);
        if let Some(probe) = self.liveness {
            cache = cache.with_liveness(Arc::new(move |cached: &CachedResult<R>| {
                probe(&cached.result)
            }));
        }
        let cache = Arc::new(cache);

        let mut shedders: Vec<Arc<dyn LoadShedder>> = vec![cache.clone() as Arc<dyn LoadShedder>];
        let throttle: Arc<dyn Throttler> = match self.throttler {
            Some(throttler) => {
                throttler.set_device_profile(&snapshot.profile);
                throttler
            }
            None => {
                let adaptive = Arc::new(AdaptiveThrottle::new(
                    config.throttle.clone(),
                    &snapshot.profile,
                    random.clone(),
                ));
                shedders.push(adaptive.clone());
                adaptive
            }
        };

        let coordinator = ErrorRecoveryCoordinator::new(
            config.recovery.clone(),
            config.breaker.monitoring_window,
            random,
        );
        if self.shed_load {
            coordinator.register(Arc::new(ShedLoadStrategy::new(shedders)));
        }
        for strategy in self.strategies {
            coordinator.register(strategy);
        }

        info!(
            device_class = %snapshot.profile.class(),
            preferred_backend = %snapshot.preferred_backend(),
            cache_capacity = config.cache.capacity,
            failure_threshold = config.breaker.failure_threshold,
            max_attempts = config.recovery.max_attempts,
            coalesce = config.dispatch.coalesce_in_flight,
            "Dispatch engine created"
        );

        Ok(DispatchEngine {
            breaker: CircuitBreaker::new(BREAKER_NAME, config.breaker.clone()),
            coordinator,
            cache,
            throttle,
            capabilities,
            snapshot: RwLock::new(snapshot),
            in_flight: InFlightRegistry::new(),
            metrics: DispatchMetrics::new(),
            shutdown: CancellationToken::new(),
            config,
        })
    }
}

/// Resilient adaptive dispatcher for units of work producing `R`.
pub struct DispatchEngine<R: Clone> {
    config: EngineConfig,
    breaker: CircuitBreaker,
    coordinator: ErrorRecoveryCoordinator,
    cache: Arc<EvictingCache<WorkKey, CachedResult<R>>>,
    throttle: Arc<dyn Throttler>,
    capabilities: Arc<dyn CapabilityProvider>,
    snapshot: RwLock<CapabilitySnapshot>,
    in_flight: InFlightRegistry<R>,
    metrics: DispatchMetrics,
    shutdown: CancellationToken,
}

impl<R: Clone> fmt::Debug for DispatchEngine<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchEngine")
            .field("breaker", &self.breaker)
            .field("coordinator", &self.coordinator)
            .field("cache_entries", &self.cache.len())
            .field("closed", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<R> DispatchEngine<R>
where
    R: Clone + Send + Sync + 'static,
{
    /// Engine with production defaults.
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        EngineBuilder::new(config).build()
    }

    pub fn builder(config: EngineConfig) -> EngineBuilder<R> {
        EngineBuilder::new(config)
    }

    /// Run one unit of work.
    ///
    /// `Err` is reserved for contract violations (blank key, no strategies,
    /// closed engine). Every operational result, including degradation, is
    /// an `Ok` outcome.
    pub async fn run(
        &self,
        key: impl Into<String>,
        strategies: Vec<ExecutionStrategy<R>>,
        options: RunOptions<R>,
    ) -> Result<DispatchOutcome<R>, DispatchError> {
        let key = WorkKey::new(key)?;
        self.run_item(WorkItem::new(key, strategies).with_options(options))
            .await
    }

    /// [`run`](Self::run) for a prebuilt [`WorkItem`].
    pub async fn run_item(&self, item: WorkItem<R>) -> Result<DispatchOutcome<R>, DispatchError> {
        if self.is_closed() {
            return Err(DispatchError::Closed);
        }
        if item.strategies.is_empty() {
            return Err(DispatchError::NoStrategies {
                key: item.key.to_string(),
            });
        }

        self.metrics.dispatched();
        let (outcome, shared) = self.dispatch(&item).await;
        if shared {
            self.metrics.coalesced();
        } else {
            self.metrics.record(&outcome);
        }
        debug!(key = %item.key, outcome = outcome.label(), "Dispatch finished");
        Ok(outcome)
    }

    /// The outcome, and whether it was shared from another caller's
    /// execution rather than produced by this run.
    async fn dispatch(&self, item: &WorkItem<R>) -> (DispatchOutcome<R>, bool) {
        if let Some(cached) = self.cache.get(&item.key) {
            let outcome = DispatchOutcome::Completed {
                result: cached.result,
                duration: Duration::ZERO,
                method: cached.method,
                from_cache: true,
                attempts: 0,
            };
            return (outcome, false);
        }

        if !self.throttle.permit() {
            debug!(key = %item.key, "Throttled");
            return (DispatchOutcome::skipped(SkipReason::Throttled), false);
        }

        let Some(strategy) = item.select_strategy() else {
            debug!(key = %item.key, "No available strategy");
            return (DispatchOutcome::skipped(SkipReason::Unavailable), false);
        };

        if self.config.dispatch.coalesce_in_flight {
            self.execute_coalesced(&item.key, strategy, &item.options)
                .await
        } else {
            (self.execute(&item.key, strategy, &item.options).await, false)
        }
    }

    /// Lead or follow the in-flight execution for `key`.
    async fn execute_coalesced(
        &self,
        key: &WorkKey,
        strategy: &ExecutionStrategy<R>,
        options: &RunOptions<R>,
    ) -> (DispatchOutcome<R>, bool) {
        let caller = options.cancellation.clone().unwrap_or_default();

        loop {
            match self.in_flight.join(key) {
                Flight::Leader(guard) => {
                    let outcome = self.execute(key, strategy, options).await;
                    if matches!(outcome, DispatchOutcome::Cancelled) && !self.is_closed() {
                        // Only this caller gave up; followers elect a new leader.
                        drop(guard);
                    } else {
                        let followers = guard.publish(outcome.clone());
                        if followers > 0 {
                            debug!(key = %key, followers, "Shared outcome with followers");
                        }
                    }
                    return (outcome, false);
                }
                Flight::Follower(mut receiver) => {
                    let received = tokio::select! {
                        biased;
                        _ = caller.cancelled() => return (DispatchOutcome::Cancelled, false),
                        received = receiver.recv() => received,
                    };
                    match received {
                        Ok(outcome) => return (outcome, true),
                        Err(_) => {
                            debug!(key = %key, "Leader abandoned, retrying");
                        }
                    }
                }
            }
        }
    }

    /// Breaker + recovery around one strategy, then cache and throttle
    /// bookkeeping.
    async fn execute(
        &self,
        key: &WorkKey,
        strategy: &ExecutionStrategy<R>,
        options: &RunOptions<R>,
    ) -> DispatchOutcome<R> {
        let limits = ExecutionLimits::new(
            options.timeout.or(self.config.dispatch.default_timeout),
            self.shutdown.child_token(),
        );
        let caller = options.cancellation.clone().unwrap_or_default();
        let context = DispatchContext::new(key.clone(), strategy.name.clone());
        let execute = &strategy.execute;
        let started = Instant::now();

        let protected = self.breaker.call(|| async {
            let recovered = self
                .coordinator
                .execute_with_recovery(|context| execute(context), context, &limits)
                .await;
            match recovered {
                RecoveryOutcome::Success { value, attempts } => Ok((value, attempts)),
                RecoveryOutcome::Degraded(degraded) => Err(RunFailure::Degraded(degraded)),
                RecoveryOutcome::Cancelled { .. } => Err(RunFailure::Cancelled),
            }
        });

        // Dropping the protected future on caller cancellation skips breaker
        // accounting and releases any pending backoff timer.
        let result = tokio::select! {
            biased;
            _ = caller.cancelled() => {
                limits.cancellation.cancel();
                debug!(key = %key, "Run cancelled by caller");
                return DispatchOutcome::Cancelled;
            }
            result = protected => result,
        };
        let duration = started.elapsed();

        match result {
            Ok((result, attempts)) => {
                self.throttle.record(duration);
                if !self.is_closed() {
                    let cached = CachedResult {
                        result: result.clone(),
                        method: strategy.name.clone(),
                    };
                    match options.cache_ttl {
                        Some(ttl) => self.cache.set_with_ttl(key.clone(), cached, Some(ttl)),
                        None => self.cache.set(key.clone(), cached),
                    };
                }
                DispatchOutcome::Completed {
                    result,
                    duration,
                    method: strategy.name.clone(),
                    from_cache: false,
                    attempts,
                }
            }
            Err(CircuitBreakerError::Open { retry_in, .. }) => match &options.fallback {
                Some(fallback) => DispatchOutcome::Fallback {
                    result: fallback.clone(),
                    retry_in,
                },
                None => DispatchOutcome::skipped(SkipReason::CircuitOpen),
            },
            Err(CircuitBreakerError::Operation(RunFailure::Degraded(degraded))) => {
                self.throttle.record(duration);
                warn!(
                    key = %key,
                    method = %strategy.name,
                    attempts = degraded.attempts,
                    error = %degraded.error,
                    "Dispatch degraded"
                );
                DispatchOutcome::Degraded(degraded)
            }
            Err(CircuitBreakerError::Operation(RunFailure::Cancelled)) => {
                DispatchOutcome::Cancelled
            }
        }
    }

    /// Tear down: cancel pending attempts and backoff sleeps, release
    /// recovery strategies and drop cached results. Later runs return
    /// [`DispatchError::Closed`].
    pub fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        let released = self.coordinator.unregister_all();
        self.cache.clear();
        info!(strategies_released = released, "Dispatch engine closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Periodic maintenance: cache cleanup and failure-window pruning.
    pub fn cleanup(&self) -> CleanupReport {
        let report = self.cache.cleanup();
        self.breaker.prune();
        self.coordinator.prune();
        if report.removed() > 0 {
            debug!(
                expired = report.expired,
                dead = report.dead,
                remaining = report.remaining,
                "Cache cleanup"
            );
        }
        report
    }

    /// Re-read the capability provider and apply the new device profile.
    pub fn refresh_capabilities(&self) -> CapabilitySnapshot {
        let snapshot = self.capabilities.snapshot();
        self.throttle.set_device_profile(&snapshot.profile);
        *self.snapshot.write() = snapshot;
        info!(
            device_class = %snapshot.profile.class(),
            accelerated = snapshot.accelerated,
            parallel = snapshot.parallel,
            "Capabilities refreshed"
        );
        snapshot
    }

    /// Capabilities as of construction or the last refresh.
    pub fn capabilities(&self) -> CapabilitySnapshot {
        *self.snapshot.read()
    }

    /// Register a recovery strategy after construction.
    pub fn register_strategy(&self, strategy: Arc<dyn RecoveryStrategy>) -> bool {
        self.coordinator.register(strategy)
    }

    /// Read-only telemetry for monitors and the CLI.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let now = Instant::now();
        let breaker = self.breaker.stats();
        let cache = self.cache.stats();
        let skip_probability = self.throttle.skip_probability();

        TelemetrySnapshot {
            captured_at: TelemetrySnapshot::timestamp(),
            breaker_state: breaker.state,
            failure_rate: breaker.failure_rate(),
            failures_in_window: breaker.failures_in_window,
            cache_hit_rate: cache.hit_rate(),
            cache_entries: cache.entries,
            cache_capacity: cache.capacity,
            skip_probability,
            throttle_level: ThrottleLevel::from_probability(skip_probability),
            device_class: self.snapshot.read().profile.class(),
            recent_failures: self
                .coordinator
                .recent_failures()
                .iter()
                .map(|record| FailureSummary::from_record(record, now))
                .collect(),
            counters: self.metrics.snapshot(),
            strategy_scores: self.coordinator.scores(),
            in_flight: self.in_flight.len(),
            closed: self.is_closed(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn coordinator(&self) -> &ErrorRecoveryCoordinator {
        &self.coordinator
    }

    pub fn throttle(&self) -> &Arc<dyn Throttler> {
        &self.throttle
    }

    pub fn metrics(&self) -> &DispatchMetrics {
        &self.metrics
    }

    /// Engine-wide shutdown token, cancelled by [`close`](Self::close).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Whether `key` has a cached result (does not count as a lookup).
    pub fn is_cached(&self, key: &WorkKey) -> bool {
        self.cache.contains(key)
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

//! Error recovery coordinator.
//!
//! Runs an operation with bounded retries. On every failed attempt it:
//!
//! 1. appends a [`FailureRecord`] (pruned to the monitoring window),
//! 2. picks at most one [`RecoveryStrategy`] for the failure's kind and runs
//!    it, carrying any replacement context into the next attempt,
//! 3. sleeps `policy.delay_for_attempt(attempt)` unless that was the last attempt.
//!
//! Exhausting the attempt budget yields [`RecoveryOutcome::Degraded`], never
//! a panic or an `Err`: degraded is a normal outcome callers continue from.
//!
//! # Strategy Learning
//!
//! Each `(kind, name)` pair accumulates a [`StrategyScore`]. When a kind has
//! more than one strategy, the next pick is weighted by the Laplace-smoothed
//! success ratio, drawn from the injected [`RandomSource`]. A strategy that
//! itself errors is skipped for the rest of that call.
//!
//! # Cancellation
//!
//! Attempts, strategy runs and backoff sleeps all race the
//! [`ExecutionLimits::cancellation`] token. Cancellation returns
//! [`RecoveryOutcome::Cancelled`] and is never recorded as a failure.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::policy::RetryPolicy;
use super::strategy::RecoveryStrategy;
use crate::dispatch::DispatchContext;
use crate::error::{ErrorKind, Failure, OperationError};
use crate::random::RandomSource;

/// Hard cap on retained failure records, independent of the window.
const MAX_FAILURE_RECORDS: usize = 1024;

/// One failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureRecord {
    pub kind: ErrorKind,
    pub timestamp: Instant,
    /// Time spent in the attempt before it failed.
    pub duration: Duration,
    /// 1-based attempt number within its call.
    pub attempt: u32,
}

/// Success/failure tally for one `(kind, strategy)` pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StrategyScore {
    /// Calls that succeeded after this strategy ran.
    pub successes: u64,
    /// Calls that degraded with this strategy as the last one applied.
    pub failures: u64,
    /// Times the strategy itself returned an error.
    pub recovery_errors: u64,
}

impl StrategyScore {
    /// Laplace-smoothed success ratio in `(0, 1)`.
    ///
    /// An unscored strategy weighs 0.5, so new strategies still get picked.
    pub fn weight(&self) -> f64 {
        let total = self.successes + self.failures + self.recovery_errors;
        (self.successes as f64 + 1.0) / (total as f64 + 2.0)
    }
}

/// A strategy score keyed for export.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredStrategy {
    pub kind: ErrorKind,
    pub name: String,
    pub score: StrategyScore,
}

/// Outcome of exhausting every attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct DegradedResult {
    /// The last attempt's error.
    pub error: OperationError,
    /// Context as it stood after the last recovery.
    pub context: DispatchContext,
    /// Attempts made.
    pub attempts: u32,
}

impl DegradedResult {
    /// Mode label used in telemetry and CLI output.
    pub fn mode(&self) -> &'static str {
        "degraded"
    }
}

impl fmt::Display for DegradedResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "degraded after {} attempt(s): {}",
            self.attempts, self.error
        )
    }
}

/// Result of [`ErrorRecoveryCoordinator::execute_with_recovery`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome<R> {
    Success { value: R, attempts: u32 },
    Degraded(DegradedResult),
    Cancelled { attempts: u32 },
}

impl<R> RecoveryOutcome<R> {
    pub fn attempts(&self) -> u32 {
        match self {
            RecoveryOutcome::Success { attempts, .. } => *attempts,
            RecoveryOutcome::Degraded(degraded) => degraded.attempts,
            RecoveryOutcome::Cancelled { attempts } => *attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RecoveryOutcome::Success { .. })
    }
}

/// Per-call limits applied to every attempt.
#[derive(Debug, Clone, Default)]
pub struct ExecutionLimits {
    /// Per-attempt timeout; `None` waits indefinitely.
    pub timeout: Option<Duration>,
    pub cancellation: CancellationToken,
}

impl ExecutionLimits {
    pub fn new(timeout: Option<Duration>, cancellation: CancellationToken) -> Self {
        Self {
            timeout,
            cancellation,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

type StrategyId = (ErrorKind, String);

/// Retry loop with pluggable, learning recovery strategies.
pub struct ErrorRecoveryCoordinator {
    policy: RetryPolicy,
    monitoring_window: Duration,
    random: Arc<dyn RandomSource>,
    strategies: RwLock<HashMap<ErrorKind, Vec<Arc<dyn RecoveryStrategy>>>>,
    scores: Mutex<HashMap<StrategyId, StrategyScore>>,
    failures: Mutex<VecDeque<FailureRecord>>,
}

impl fmt::Debug for ErrorRecoveryCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registered: usize = self.strategies.read().values().map(Vec::len).sum();
        f.debug_struct("ErrorRecoveryCoordinator")
            .field("policy", &self.policy)
            .field("monitoring_window", &self.monitoring_window)
            .field("registered_strategies", &registered)
            .finish_non_exhaustive()
    }
}

impl ErrorRecoveryCoordinator {
    pub fn new(
        policy: RetryPolicy,
        monitoring_window: Duration,
        random: Arc<dyn RandomSource>,
    ) -> Self {
        Self {
            policy,
            monitoring_window,
            random,
            strategies: RwLock::new(HashMap::new()),
            scores: Mutex::new(HashMap::new()),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Delay before retry `attempt`; see [`RetryPolicy::backoff_delay`].
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.policy.backoff_delay(attempt)
    }

    /// Register a strategy under its kind.
    ///
    /// A strategy with the same `(kind, name)` is replaced in place and
    /// `true` is returned; otherwise the strategy is appended.
    pub fn register(&self, strategy: Arc<dyn RecoveryStrategy>) -> bool {
        let kind = strategy.kind();
        let name = strategy.name().to_string();
        let mut strategies = self.strategies.write();
        let slot = strategies.entry(kind).or_default();

        let replaced = match slot.iter().position(|s| s.name() == name) {
            Some(index) => {
                slot[index] = strategy;
                true
            }
            None => {
                slot.push(strategy);
                false
            }
        };
        info!(kind = %kind, strategy = %name, replaced, "Recovery strategy registered");
        replaced
    }

    /// Drop every registration. Scores are kept. Returns how many were removed.
    pub fn unregister_all(&self) -> usize {
        let mut strategies = self.strategies.write();
        let removed = strategies.values().map(Vec::len).sum();
        strategies.clear();
        removed
    }

    /// Names of the strategies registered for `kind`, in registration order.
    pub fn strategies_for(&self, kind: ErrorKind) -> Vec<String> {
        self.strategies
            .read()
            .get(&kind)
            .map(|list| list.iter().map(|s| s.name().to_string()).collect())
            .unwrap_or_default()
    }

    pub fn score(&self, kind: ErrorKind, name: &str) -> StrategyScore {
        self.scores
            .lock()
            .get(&(kind, name.to_string()))
            .copied()
            .unwrap_or_default()
    }

    /// Every score, ordered by kind then name.
    pub fn scores(&self) -> Vec<ScoredStrategy> {
        let mut scores: Vec<ScoredStrategy> = self
            .scores
            .lock()
            .iter()
            .map(|((kind, name), score)| ScoredStrategy {
                kind: *kind,
                name: name.clone(),
                score: *score,
            })
            .collect();
        scores.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.name.cmp(&b.name)));
        scores
    }

    /// Failure records inside the monitoring window, oldest first.
    pub fn recent_failures(&self) -> Vec<FailureRecord> {
        let mut failures = self.failures.lock();
        Self::prune_records(&mut failures, Instant::now(), self.monitoring_window);
        failures.iter().cloned().collect()
    }

    /// Drop failure records older than the monitoring window.
    pub fn prune(&self) {
        let mut failures = self.failures.lock();
        Self::prune_records(&mut failures, Instant::now(), self.monitoring_window);
    }

    fn prune_records(records: &mut VecDeque<FailureRecord>, now: Instant, window: Duration) {
        while let Some(oldest) = records.front() {
            if now.duration_since(oldest.timestamp) > window || records.len() > MAX_FAILURE_RECORDS
            {
                records.pop_front();
            } else {
                break;
            }
        }
    }

    fn record_failure(&self, record: FailureRecord) {
        let now = record.timestamp;
        let mut failures = self.failures.lock();
        failures.push_back(record);
        Self::prune_records(&mut failures, now, self.monitoring_window);
    }

    fn update_score(&self, id: &StrategyId, update: impl FnOnce(&mut StrategyScore)) {
        let mut scores = self.scores.lock();
        update(scores.entry(id.clone()).or_default());
    }

    /// Pick one eligible strategy for `kind`, weighted by score.
    fn select_strategy(
        &self,
        kind: ErrorKind,
        excluded: &[StrategyId],
    ) -> Option<Arc<dyn RecoveryStrategy>> {
        let candidates: Vec<Arc<dyn RecoveryStrategy>> = {
            let strategies = self.strategies.read();
            strategies
                .get(&kind)?
                .iter()
                .filter(|s| {
                    !excluded
                        .iter()
                        .any(|(k, n)| *k == kind && n.as_str() == s.name())
                })
                .cloned()
                .collect()
        };

        match candidates.len() {
            0 => None,
            1 => candidates.into_iter().next(),
            _ => {
                let weights: Vec<f64> = {
                    let scores = self.scores.lock();
                    candidates
                        .iter()
                        .map(|s| {
                            scores
                                .get(&(kind, s.name().to_string()))
                                .copied()
                                .unwrap_or_default()
                                .weight()
                        })
                        .collect()
                };
                let total: f64 = weights.iter().sum();
                let mut sample = self.random.next_f64() * total;
                for (strategy, weight) in candidates.iter().zip(&weights) {
                    if sample < *weight {
                        return Some(Arc::clone(strategy));
                    }
                    sample -= weight;
                }
                candidates.last().cloned()
            }
        }
    }

    /// Run `operation` until it succeeds, the attempt budget runs out, or
    /// the call is cancelled.
    ///
    /// `operation` receives the current context on every attempt, including
    /// any replacement produced by a recovery strategy.
    pub async fn execute_with_recovery<R, F, Fut>(
        &self,
        operation: F,
        context: DispatchContext,
        limits: &ExecutionLimits,
    ) -> RecoveryOutcome<R>
    where
        F: Fn(DispatchContext) -> Fut,
        Fut: Future<Output = Result<R, OperationError>>,
    {
        let max_attempts = self.policy.max_attempts();
        let mut context = context;
        let mut excluded: Vec<StrategyId> = Vec::new();
        let mut last_strategy: Option<StrategyId> = None;
        let mut attempt = 0;

        loop {
            attempt += 1;
            context.attempt = attempt;
            let started = Instant::now();

            let result = tokio::select! {
                biased;
                _ = limits.cancellation.cancelled() => {
                    debug!(key = %context.key, attempt, "Attempt cancelled");
                    return RecoveryOutcome::Cancelled { attempts: attempt };
                }
                result = run_attempt(operation(context.clone()), limits.timeout) => result,
            };

            let error = match result {
                Ok(value) => {
                    if attempt > 1 {
                        if let Some(id) = &last_strategy {
                            self.update_score(id, |score| score.successes += 1);
                        }
                        debug!(key = %context.key, attempt, "Recovered after retry");
                    }
                    return RecoveryOutcome::Success {
                        value,
                        attempts: attempt,
                    };
                }
                Err(error) if error.is_cancellation() => {
                    return RecoveryOutcome::Cancelled { attempts: attempt };
                }
                Err(error) => error,
            };

            self.record_failure(FailureRecord {
                kind: error.kind,
                timestamp: Instant::now(),
                duration: started.elapsed(),
                attempt,
            });
            debug!(
                key = %context.key,
                attempt,
                max_attempts,
                kind = %error.kind,
                error = %error.message,
                "Attempt failed"
            );

            if let Some(strategy) = self.select_strategy(error.kind, &excluded) {
                let id: StrategyId = (strategy.kind(), strategy.name().to_string());
                let recovered = tokio::select! {
                    biased;
                    _ = limits.cancellation.cancelled() => {
                        return RecoveryOutcome::Cancelled { attempts: attempt };
                    }
                    recovered = strategy.recover(&error, &context) => recovered,
                };

                match recovered {
                    Ok(action) => {
                        debug!(
                            strategy = %id.1,
                            applied = action.applied,
                            replaced_context = action.context.is_some(),
                            "Recovery strategy ran"
                        );
                        if let Some(next) = action.context {
                            context = next;
                        }
                        last_strategy = Some(id);
                    }
                    Err(recovery_error) => {
                        warn!(
                            strategy = %id.1,
                            kind = %id.0,
                            error = %recovery_error,
                            "Recovery strategy failed, falling back to plain retry"
                        );
                        self.update_score(&id, |score| score.recovery_errors += 1);
                        excluded.push(id);
                    }
                }
            }

            let Some(delay) = self.policy.delay_for_attempt(attempt) else {
                if let Some(id) = &last_strategy {
                    self.update_score(id, |score| score.failures += 1);
                }
                warn!(
                    key = %context.key,
                    attempts = attempt,
                    kind = %error.kind,
                    error = %error.message,
                    "Retry budget exhausted, degrading"
                );
                return RecoveryOutcome::Degraded(DegradedResult {
                    error,
                    context,
                    attempts: attempt,
                });
            };

            tokio::select! {
                biased;
                _ = limits.cancellation.cancelled() => {
                    return RecoveryOutcome::Cancelled { attempts: attempt };
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

async fn run_attempt<R, Fut>(attempt: Fut, timeout: Option<Duration>) -> Result<R, OperationError>
where
    Fut: Future<Output = Result<R, OperationError>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, attempt)
            .await
            .unwrap_or_else(|_| Err(OperationError::timeout(limit))),
        None => attempt.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::WorkKey;
    use crate::random::{FixedRandom, SeededRandom};
    use crate::resilience::strategy::{FnStrategy, RecoveryAction, RecoveryError};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn coordinator(max_attempts: u32) -> ErrorRecoveryCoordinator {
        ErrorRecoveryCoordinator::new(
            RetryPolicy::exponential(max_attempts),
            Duration::from_secs(60),
            Arc::new(SeededRandom::new(42)),
        )
    }

    fn context() -> DispatchContext {
        DispatchContext::new(WorkKey::new("element-1").unwrap(), "baseline")
    }

    fn counting_strategy(
        name: &str,
        kind: ErrorKind,
        calls: Arc<AtomicU32>,
    ) -> Arc<dyn RecoveryStrategy> {
        Arc::new(FnStrategy::new(name, kind, move |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(RecoveryAction::applied())
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_attempt_success() {
        let coordinator = coordinator(3);
        let outcome = coordinator
            .execute_with_recovery(
                |_| async { Ok::<_, OperationError>(7) },
                context(),
                &ExecutionLimits::default(),
            )
            .await;

        assert_eq!(
            outcome,
            RecoveryOutcome::Success {
                value: 7,
                attempts: 1
            }
        );
        assert!(coordinator.recent_failures().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_twice_then_succeeds() {
        let coordinator = coordinator(3);
        let strategy_calls = Arc::new(AtomicU32::new(0));
        coordinator.register(counting_strategy(
            "reset_input",
            ErrorKind::Structural,
            strategy_calls.clone(),
        ));

        let attempts = AtomicU32::new(0);
        let started = Instant::now();
        let outcome = coordinator
            .execute_with_recovery(
                |_| {
                    let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if n < 3 {
                            Err(OperationError::structural("not a function"))
                        } else {
                            Ok("done")
                        }
                    }
                },
                context(),
                &ExecutionLimits::default(),
            )
            .await;

        assert_eq!(
            outcome,
            RecoveryOutcome::Success {
                value: "done",
                attempts: 3
            }
        );
        assert_eq!(strategy_calls.load(Ordering::SeqCst), 2);
        assert_eq!(coordinator.recent_failures().len(), 2);
        // 100ms + 200ms of backoff.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(310));

        let score = coordinator.score(ErrorKind::Structural, "reset_input");
        assert_eq!(score.successes, 1);
        assert_eq!(score.failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_degrades() {
        let coordinator = coordinator(2);
        let strategy_calls = Arc::new(AtomicU32::new(0));
        coordinator.register(counting_strategy(
            "retry_later",
            ErrorKind::Transient,
            strategy_calls.clone(),
        ));

        let attempts = AtomicU32::new(0);
        let started = Instant::now();
        let outcome: RecoveryOutcome<()> = coordinator
            .execute_with_recovery(
                |_| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Err(OperationError::transient("connection reset")) }
                },
                context(),
                &ExecutionLimits::default(),
            )
            .await;

        match outcome {
            RecoveryOutcome::Degraded(degraded) => {
                assert_eq!(degraded.attempts, 2);
                assert_eq!(degraded.error.kind, ErrorKind::Transient);
                assert_eq!(degraded.mode(), "degraded");
            }
            other => panic!("expected degraded, got {:?}", other),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        // One backoff between the attempts, none after the last.
        assert!(started.elapsed() < Duration::from_millis(110));
        assert_eq!(strategy_calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            coordinator.score(ErrorKind::Transient, "retry_later").failures,
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_strategy_still_retries() {
        let coordinator = coordinator(3);
        let attempts = AtomicU32::new(0);
        let outcome: RecoveryOutcome<()> = coordinator
            .execute_with_recovery(
                |_| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Err(OperationError::resource_exhaustion("oom")) }
                },
                context(),
                &ExecutionLimits::default(),
            )
            .await;

        assert!(matches!(outcome, RecoveryOutcome::Degraded(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutated_context_reaches_next_attempt() {
        let coordinator = coordinator(3);
        coordinator.register(Arc::new(FnStrategy::new(
            "swap_input",
            ErrorKind::Structural,
            |_, ctx| {
                Ok(RecoveryAction::with_context(
                    ctx.clone().with_hint("input", "sanitized"),
                ))
            },
        )));

        let outcome = coordinator
            .execute_with_recovery(
                |ctx| async move {
                    match ctx.hint("input") {
                        Some("sanitized") => Ok(ctx.attempt),
                        _ => Err(OperationError::structural("bad input")),
                    }
                },
                context(),
                &ExecutionLimits::default(),
            )
            .await;

        assert_eq!(
            outcome,
            RecoveryOutcome::Success {
                value: 2,
                attempts: 2
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_strategy_becomes_ineligible() {
        let coordinator = coordinator(3);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        coordinator.register(Arc::new(FnStrategy::new(
            "broken",
            ErrorKind::Transient,
            move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(RecoveryError::new("broken", "strategy crashed"))
            },
        )));

        let attempts = AtomicU32::new(0);
        let outcome: RecoveryOutcome<()> = coordinator
            .execute_with_recovery(
                |_| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Err(OperationError::transient("flaky")) }
                },
                context(),
                &ExecutionLimits::default(),
            )
            .await;

        assert!(matches!(outcome, RecoveryOutcome::Degraded(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let score = coordinator.score(ErrorKind::Transient, "broken");
        assert_eq!(score.recovery_errors, 1);
        assert_eq!(score.failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let coordinator = coordinator(2);
        let limits = ExecutionLimits::default().with_timeout(Duration::from_millis(10));
        let outcome: RecoveryOutcome<()> = coordinator
            .execute_with_recovery(
                |_| async {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok(())
                },
                context(),
                &limits,
            )
            .await;

        match outcome {
            RecoveryOutcome::Degraded(degraded) => {
                assert_eq!(degraded.error.kind, ErrorKind::Timeout);
                assert_eq!(degraded.attempts, 2);
            }
            other => panic!("expected degraded, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let coordinator = coordinator(3);
        let limits = ExecutionLimits::default();
        let token = limits.cancellation.clone();
        let attempts = AtomicU32::new(0);

        let outcome: RecoveryOutcome<()> = coordinator
            .execute_with_recovery(
                |_| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    token.cancel();
                    async { Err(OperationError::transient("torn down")) }
                },
                context(),
                &limits,
            )
            .await;

        assert_eq!(outcome, RecoveryOutcome::Cancelled { attempts: 1 });
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_error_is_not_a_failure() {
        let coordinator = coordinator(3);
        let outcome: RecoveryOutcome<()> = coordinator
            .execute_with_recovery(
                |_| async { Err(OperationError::cancelled()) },
                context(),
                &ExecutionLimits::default(),
            )
            .await;

        assert_eq!(outcome, RecoveryOutcome::Cancelled { attempts: 1 });
        assert!(coordinator.recent_failures().is_empty());
    }

    #[test]
    fn test_register_replaces_same_name() {
        let coordinator = coordinator(3);
        let calls = Arc::new(AtomicU32::new(0));
        assert!(!coordinator.register(counting_strategy(
            "a",
            ErrorKind::Transient,
            calls.clone()
        )));
        assert!(!coordinator.register(counting_strategy(
            "b",
            ErrorKind::Transient,
            calls.clone()
        )));
        assert!(coordinator.register(counting_strategy("a", ErrorKind::Transient, calls)));
        assert_eq!(
            coordinator.strategies_for(ErrorKind::Transient),
            vec!["a".to_string(), "b".to_string()]
        );
        assert_eq!(coordinator.unregister_all(), 2);
        assert!(coordinator.strategies_for(ErrorKind::Transient).is_empty());
    }

    #[test]
    fn test_weighted_pick_follows_scores() {
        let make = |sample: f64| {
            let coordinator = ErrorRecoveryCoordinator::new(
                RetryPolicy::default(),
                Duration::from_secs(60),
                Arc::new(FixedRandom(sample)),
            );
            let calls = Arc::new(AtomicU32::new(0));
            coordinator.register(counting_strategy("good", ErrorKind::Transient, calls.clone()));
            coordinator.register(counting_strategy("bad", ErrorKind::Transient, calls));
            let good = (ErrorKind::Transient, "good".to_string());
            let bad = (ErrorKind::Transient, "bad".to_string());
            coordinator.update_score(&good, |s| s.successes = 9);
            coordinator.update_score(&bad, |s| s.failures = 9);
            coordinator
        };

        // Weights: good = 10/11, bad = 1/11.
        let picked = make(0.5)
            .select_strategy(ErrorKind::Transient, &[])
            .map(|s| s.name().to_string());
        assert_eq!(picked.as_deref(), Some("good"));

        let picked = make(0.95)
            .select_strategy(ErrorKind::Transient, &[])
            .map(|s| s.name().to_string());
        assert_eq!(picked.as_deref(), Some("bad"));

        let excluded = vec![(ErrorKind::Transient, "good".to_string())];
        let picked = make(0.5)
            .select_strategy(ErrorKind::Transient, &excluded)
            .map(|s| s.name().to_string());
        assert_eq!(picked.as_deref(), Some("bad"));
    }

    #[test]
    fn test_strategy_score_weight() {
        assert_eq!(StrategyScore::default().weight(), 0.5);
        let score = StrategyScore {
            successes: 3,
            failures: 1,
            recovery_errors: 0,
        };
        assert!((score.weight() - 4.0 / 6.0).abs() < 1e-12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_records_pruned_outside_window() {
        let coordinator = ErrorRecoveryCoordinator::new(
            RetryPolicy::none(),
            Duration::from_millis(500),
            Arc::new(FixedRandom(0.0)),
        );
        let _: RecoveryOutcome<()> = coordinator
            .execute_with_recovery(
                |_| async { Err(OperationError::transient("x")) },
                context(),
                &ExecutionLimits::default(),
            )
            .await;
        assert_eq!(coordinator.recent_failures().len(), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(coordinator.recent_failures().is_empty());
    }
}

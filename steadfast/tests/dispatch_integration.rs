//! End-to-end behavior of the dispatch engine through its public API.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use steadfast::cache::EvictingCache;
use steadfast::dispatch::{
    DispatchConfig, DispatchEngine, DispatchOutcome, ExecutionStrategy, RunOptions, SkipReason,
};
use steadfast::random::{FixedRandom, SeededRandom};
use steadfast::resilience::{
    CircuitBreakerConfig, CircuitState, FnStrategy, RecoveryAction, RetryPolicy,
};
use steadfast::throttle::{
    AdaptiveThrottle, DeviceProfile, NeverThrottle, StaticCapabilities, ThrottleConfig, Throttler,
};
use steadfast::{EngineConfig, ErrorKind, OperationError};
use tokio_util::sync::CancellationToken;

fn breaker(failure_threshold: u32, recovery_timeout: Duration) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold,
        recovery_timeout,
        ..CircuitBreakerConfig::default()
    }
}

fn build(config: EngineConfig) -> DispatchEngine<u32> {
    DispatchEngine::builder(config)
        .with_capabilities(Arc::new(StaticCapabilities::full()))
        .with_random(Arc::new(FixedRandom(0.5)))
        .with_throttler(Arc::new(NeverThrottle))
        .build()
        .unwrap()
}

/// Strategy whose first `failures` invocations fail with `error`.
fn flaky(
    calls: Arc<AtomicU32>,
    failures: u32,
    error: OperationError,
    value: u32,
) -> ExecutionStrategy<u32> {
    ExecutionStrategy::new("baseline", true, move |_| {
        let calls = calls.clone();
        let error = error.clone();
        async move {
            if calls.fetch_add(1, Ordering::SeqCst) < failures {
                Err(error)
            } else {
                Ok(value)
            }
        }
    })
}

fn always_failing(calls: Arc<AtomicU32>) -> ExecutionStrategy<u32> {
    flaky(calls, u32::MAX, OperationError::transient("unreachable"), 0)
}

fn succeeding(calls: Arc<AtomicU32>, value: u32) -> ExecutionStrategy<u32> {
    flaky(calls, 0, OperationError::transient("unused"), value)
}

#[tokio::test(start_paused = true)]
async fn test_fails_twice_then_succeeds() {
    let engine: DispatchEngine<u32> = DispatchEngine::builder(
        EngineConfig::default().with_recovery(RetryPolicy::exponential(3)),
    )
    .with_capabilities(Arc::new(StaticCapabilities::full()))
    .with_throttler(Arc::new(NeverThrottle))
    .with_strategy(Arc::new(FnStrategy::new(
        "reset_inputs",
        ErrorKind::Structural,
        |_, _| Ok(RecoveryAction::applied()),
    )))
    .build()
    .unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let outcome = engine
        .run(
            "element-1",
            vec![flaky(
                calls.clone(),
                2,
                OperationError::structural("undefined is not a function"),
                42,
            )],
            RunOptions::default(),
        )
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        DispatchOutcome::Completed { result: 42, attempts: 3, from_cache: false, .. }
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let score = engine.coordinator().score(ErrorKind::Structural, "reset_inputs");
    assert_eq!(score.successes, 1);
    let failures = engine.coordinator().recent_failures();
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().all(|f| f.kind == ErrorKind::Structural));
}

#[tokio::test(start_paused = true)]
async fn test_recovery_strategy_invoked_once_per_failure() {
    let invocations = Arc::new(AtomicU32::new(0));
    let counter = invocations.clone();
    let engine: DispatchEngine<u32> = DispatchEngine::builder(
        EngineConfig::default().with_recovery(RetryPolicy::exponential(3)),
    )
    .with_capabilities(Arc::new(StaticCapabilities::full()))
    .with_throttler(Arc::new(NeverThrottle))
    .with_strategy(Arc::new(FnStrategy::new(
        "reset_inputs",
        ErrorKind::Structural,
        move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(RecoveryAction::applied())
        },
    )))
    .build()
    .unwrap();

    let outcome = engine
        .run(
            "element-1",
            vec![flaky(
                Arc::default(),
                2,
                OperationError::structural("undefined is not a function"),
                1,
            )],
            RunOptions::default(),
        )
        .await
        .unwrap();

    assert!(outcome.is_success());
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_always_failing_degrades_after_budget() {
    let engine = build(EngineConfig::default().with_recovery(RetryPolicy::exponential(2)));
    let calls = Arc::new(AtomicU32::new(0));

    let outcome = engine
        .run("element-1", vec![always_failing(calls.clone())], RunOptions::default())
        .await
        .unwrap();

    match outcome {
        DispatchOutcome::Degraded(degraded) => {
            assert_eq!(degraded.attempts, 2);
            assert_eq!(degraded.mode(), "degraded");
            assert_eq!(degraded.error.kind, ErrorKind::Transient);
            assert_eq!(degraded.context.key.as_str(), "element-1");
        }
        other => panic!("expected degraded outcome, got {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(engine.snapshot().counters.degraded, 1);
}

#[tokio::test]
async fn test_open_breaker_returns_fallback_immediately() {
    let engine = build(
        EngineConfig::default()
            .with_breaker(breaker(10, Duration::from_secs(30)))
            .with_recovery(RetryPolicy::none()),
    );
    let calls = Arc::new(AtomicU32::new(0));

    for i in 0..10 {
        let outcome = engine
            .run(
                format!("element-{}", i),
                vec![always_failing(calls.clone())],
                RunOptions::default(),
            )
            .await
            .unwrap();
        assert!(outcome.is_degraded());
    }
    assert_eq!(engine.breaker().state(), CircuitState::Open);
    assert_eq!(calls.load(Ordering::SeqCst), 10);

    let started = std::time::Instant::now();
    let outcome = engine
        .run(
            "element-10",
            vec![always_failing(calls.clone())],
            RunOptions::default().with_fallback(7),
        )
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(50));
    assert!(matches!(outcome, DispatchOutcome::Fallback { result: 7, .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 10);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_recovers_through_half_open() {
    let engine = build(
        EngineConfig::default()
            .with_breaker(breaker(3, Duration::from_secs(1)))
            .with_recovery(RetryPolicy::none()),
    );
    let calls = Arc::new(AtomicU32::new(0));

    for i in 0..3 {
        engine
            .run(format!("fail-{}", i), vec![always_failing(calls.clone())], RunOptions::default())
            .await
            .unwrap();
    }
    assert_eq!(engine.breaker().state(), CircuitState::Open);

    let skipped = engine
        .run("probe-early", vec![succeeding(calls.clone(), 1)], RunOptions::default())
        .await
        .unwrap();
    assert_eq!(skipped.skip_reason(), Some(SkipReason::CircuitOpen));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    tokio::time::advance(Duration::from_secs(1)).await;
    let first = engine
        .run("probe-1", vec![succeeding(calls.clone(), 1)], RunOptions::default())
        .await
        .unwrap();
    assert!(first.is_success());
    assert_eq!(engine.breaker().state(), CircuitState::HalfOpen);

    engine
        .run("probe-2", vec![succeeding(calls.clone(), 2)], RunOptions::default())
        .await
        .unwrap();
    assert_eq!(engine.breaker().state(), CircuitState::Closed);
    assert_eq!(engine.breaker().failures_in_window(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_failure_reopens_and_resets_timer() {
    let engine = build(
        EngineConfig::default()
            .with_breaker(breaker(2, Duration::from_secs(1)))
            .with_recovery(RetryPolicy::none()),
    );
    let calls = Arc::new(AtomicU32::new(0));

    for i in 0..2 {
        engine
            .run(format!("fail-{}", i), vec![always_failing(calls.clone())], RunOptions::default())
            .await
            .unwrap();
    }
    let first_opened = engine.breaker().opened_at().unwrap();

    tokio::time::advance(Duration::from_millis(1_500)).await;
    let probe = engine
        .run("probe", vec![always_failing(calls.clone())], RunOptions::default())
        .await
        .unwrap();
    assert!(probe.is_degraded());
    assert_eq!(engine.breaker().state(), CircuitState::Open);

    let reopened = engine.breaker().opened_at().unwrap();
    assert!(reopened > first_opened);
    assert_eq!(
        engine.breaker().try_acquire().unwrap_err(),
        Duration::from_secs(1)
    );
}

#[tokio::test]
async fn test_cancellation_never_counts_as_failure() {
    let engine = build(EngineConfig::default().with_breaker(breaker(1, Duration::from_secs(30))));
    let token = CancellationToken::new();
    let hanging = ExecutionStrategy::new("baseline", true, |_| async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(1)
    });

    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let outcome = engine
        .run("element-1", vec![hanging], RunOptions::default().with_cancellation(token))
        .await
        .unwrap();

    assert_eq!(outcome, DispatchOutcome::Cancelled);
    assert_eq!(engine.breaker().state(), CircuitState::Closed);
    assert_eq!(engine.breaker().stats().failures, 0);
}

#[tokio::test]
async fn test_cancelled_operation_error_not_counted() {
    let engine = build(EngineConfig::default().with_breaker(breaker(1, Duration::from_secs(30))));
    let cancelled = ExecutionStrategy::new("baseline", true, |_| async {
        Err::<u32, _>(OperationError::cancelled())
    });

    let outcome = engine
        .run("element-1", vec![cancelled], RunOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome, DispatchOutcome::Cancelled);
    assert_eq!(engine.breaker().state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_counts_as_failure() {
    let engine = build(
        EngineConfig::default()
            .with_breaker(breaker(1, Duration::from_secs(30)))
            .with_recovery(RetryPolicy::none()),
    );
    let slow = ExecutionStrategy::new("baseline", true, |_| async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(1)
    });

    let outcome = engine
        .run(
            "element-1",
            vec![slow],
            RunOptions::default().with_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap();

    match outcome {
        DispatchOutcome::Degraded(degraded) => assert_eq!(degraded.error.kind, ErrorKind::Timeout),
        other => panic!("expected degraded outcome, got {:?}", other),
    }
    assert_eq!(engine.breaker().state(), CircuitState::Open);
}

#[tokio::test]
async fn test_coalesced_runs_share_one_execution() {
    let config = EngineConfig::default().with_dispatch(DispatchConfig {
        coalesce_in_flight: true,
        ..DispatchConfig::default()
    });
    let engine = Arc::new(build(config));
    let calls = Arc::new(AtomicU32::new(0));

    let counter = calls.clone();
    let slow = ExecutionStrategy::new("baseline", true, move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(11)
        }
    });

    let mut handles = Vec::new();
    for _ in 0..5 {
        let engine = engine.clone();
        let strategies = vec![slow.clone()];
        handles.push(tokio::spawn(async move {
            engine.run("shared", strategies, RunOptions::default()).await
        }));
    }

    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.result(), Some(&11));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let counters = engine.snapshot().counters;
    assert_eq!(counters.dispatched, 5);
    assert_eq!(counters.coalesced + counters.cache_hits, 4);
    // Shared outcomes are not fresh executions.
    assert_eq!(counters.completed, u64::from(calls.load(Ordering::SeqCst)));
    assert_eq!(engine.snapshot().in_flight, 0);
}

#[tokio::test]
async fn test_without_coalescing_each_caller_executes() {
    let engine = Arc::new(build(EngineConfig::default()));
    let calls = Arc::new(AtomicU32::new(0));

    let counter = calls.clone();
    let slow = ExecutionStrategy::new("baseline", true, move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(11)
        }
    });

    let mut handles = Vec::new();
    for _ in 0..3 {
        let engine = engine.clone();
        let strategies = vec![slow.clone()];
        handles.push(tokio::spawn(async move {
            engine.run("shared", strategies, RunOptions::default()).await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().unwrap().is_success());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_throttle_permit_statistics() {
    let profile = DeviceProfile::new(4, Some(4.0));

    let open = AdaptiveThrottle::new(
        ThrottleConfig::default(),
        &profile,
        Arc::new(SeededRandom::new(3)),
    );
    assert!((0..1_000).all(|_| open.permit()));

    let saturated = AdaptiveThrottle::new(
        ThrottleConfig::default().with_throttle_rate(0.99),
        &profile,
        Arc::new(SeededRandom::new(3)),
    );
    let permitted = (0..20_000).filter(|_| saturated.permit()).count();
    // Expected 200; allow generous statistical slack.
    assert!((100..=320).contains(&permitted), "permitted {}", permitted);
}

#[test]
fn test_cache_capacity_evicts_exactly_oldest() {
    let cache: EvictingCache<String, u32> = EvictingCache::with_capacity(3);
    for (i, key) in ["a", "b", "c"].iter().enumerate() {
        assert_eq!(cache.set(key.to_string(), i as u32), None);
    }
    assert_eq!(cache.set("d".to_string(), 3), Some("a".to_string()));
    assert_eq!(cache.len(), 3);
    assert_eq!(cache.get(&"a".to_string()), None);
    assert_eq!(cache.get(&"b".to_string()), Some(1));
    assert_eq!(cache.get(&"b".to_string()), Some(1));
    assert!((cache.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
}

//! Work descriptions handed to the dispatcher.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio_util::sync::CancellationToken;

use crate::error::{DispatchError, OperationError};
use crate::throttle::{Backend, CapabilitySnapshot};

/// Cache and coalescing identity of a unit of work.
///
/// Never empty or whitespace-only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkKey(String);

impl WorkKey {
    pub fn new(key: impl Into<String>) -> Result<Self, DispatchError> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(DispatchError::InvalidKey(key));
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for WorkKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Per-attempt view of a unit of work.
///
/// Recovery strategies may return a modified copy (for example with a hint
/// pointing at replacement inputs); the next attempt runs with it.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchContext {
    pub key: WorkKey,
    /// Name of the execution strategy in use.
    pub method: String,
    /// 1-based attempt number, set by the coordinator.
    pub attempt: u32,
    /// Free-form data passed between recovery strategies and executions.
    pub hints: BTreeMap<String, String>,
}

impl DispatchContext {
    pub fn new(key: WorkKey, method: impl Into<String>) -> Self {
        Self {
            key,
            method: method.into(),
            attempt: 0,
            hints: BTreeMap::new(),
        }
    }

    pub fn with_hint(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.hints.insert(name.into(), value.into());
        self
    }

    pub fn hint(&self, name: &str) -> Option<&str> {
        self.hints.get(name).map(String::as_str)
    }
}

/// Async execution body of a strategy.
pub type ExecuteFn<R> =
    Arc<dyn Fn(DispatchContext) -> BoxFuture<'static, Result<R, OperationError>> + Send + Sync>;

/// One candidate way of running the work (accelerated, parallel, ...).
pub struct ExecutionStrategy<R> {
    pub name: String,
    pub available: bool,
    pub execute: ExecuteFn<R>,
}

impl<R> Clone for ExecutionStrategy<R> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            available: self.available,
            execute: Arc::clone(&self.execute),
        }
    }
}

impl<R> fmt::Debug for ExecutionStrategy<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionStrategy")
            .field("name", &self.name)
            .field("available", &self.available)
            .finish_non_exhaustive()
    }
}

impl<R: 'static> ExecutionStrategy<R> {
    pub fn new<F, Fut>(name: impl Into<String>, available: bool, execute: F) -> Self
    where
        F: Fn(DispatchContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, OperationError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            available,
            execute: Arc::new(move |context| execute(context).boxed()),
        }
    }

    /// Strategy named after `backend`, available iff the snapshot supports it.
    pub fn for_backend<F, Fut>(
        backend: Backend,
        capabilities: &CapabilitySnapshot,
        execute: F,
    ) -> Self
    where
        F: Fn(DispatchContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, OperationError>> + Send + 'static,
    {
        Self::new(backend.as_str(), capabilities.supports(backend), execute)
    }
}

/// Per-call options.
#[derive(Debug, Clone)]
pub struct RunOptions<R> {
    /// Per-attempt timeout; `None` uses the engine default.
    pub timeout: Option<Duration>,
    /// TTL for the cached result; `None` uses the cache default.
    pub cache_ttl: Option<Duration>,
    /// Caller-side cancellation.
    pub cancellation: Option<CancellationToken>,
    /// Returned when the circuit is open.
    pub fallback: Option<R>,
}

impl<R> Default for RunOptions<R> {
    fn default() -> Self {
        Self {
            timeout: None,
            cache_ttl: None,
            cancellation: None,
            fallback: None,
        }
    }
}

impl<R> RunOptions<R> {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn with_fallback(mut self, fallback: R) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

/// A unit of work: key, ranked strategies and options.
#[derive(Debug, Clone)]
pub struct WorkItem<R> {
    pub key: WorkKey,
    /// Priority order, best first.
    pub strategies: Vec<ExecutionStrategy<R>>,
    pub options: RunOptions<R>,
}

impl<R> WorkItem<R> {
    pub fn new(key: WorkKey, strategies: Vec<ExecutionStrategy<R>>) -> Self {
        Self {
            key,
            strategies,
            options: RunOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RunOptions<R>) -> Self {
        self.options = options;
        self
    }

    /// First strategy marked available.
    pub fn select_strategy(&self) -> Option<&ExecutionStrategy<R>> {
        self.strategies.iter().find(|strategy| strategy.available)
    }
}

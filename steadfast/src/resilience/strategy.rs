//! Pluggable recovery strategies.
//!
//! A [`RecoveryStrategy`] is keyed by [`ErrorKind`] and invoked once per
//! failed attempt, before the backoff sleep. It may report that it did
//! something (`applied`) and may hand back a replacement [`DispatchContext`]
//! that the next attempt runs with.
//!
//! Strategies return a [`BoxFuture`] so they can be stored as trait objects
//! and selected at runtime.

use std::fmt;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use thiserror::Error;
use tracing::debug;

use crate::dispatch::DispatchContext;
use crate::error::{ErrorKind, OperationError};

/// Default fraction of cached results dropped by [`ShedLoadStrategy`].
pub const DEFAULT_SHED_FRACTION: f64 = 0.25;

/// Hint key under which [`ShedLoadStrategy`] records how much it shed.
pub const SHED_HINT: &str = "shed_entries";

/// What a recovery strategy did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryAction {
    /// Whether the strategy took any corrective action.
    pub applied: bool,
    /// Replacement context for the next attempt.
    pub context: Option<DispatchContext>,
}

impl RecoveryAction {
    /// The strategy looked at the failure and did nothing.
    pub fn skipped() -> Self {
        Self::default()
    }

    /// The strategy acted but left the context untouched.
    pub fn applied() -> Self {
        Self {
            applied: true,
            context: None,
        }
    }

    /// The strategy acted and produced a new context.
    pub fn with_context(context: DispatchContext) -> Self {
        Self {
            applied: true,
            context: Some(context),
        }
    }
}

/// A recovery strategy itself failed.
///
/// Distinct from the operation failure it was trying to fix.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("recovery strategy {strategy} failed: {message}")]
pub struct RecoveryError {
    pub strategy: String,
    pub message: String,
}

impl RecoveryError {
    pub fn new(strategy: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            strategy: strategy.into(),
            message: message.into(),
        }
    }
}

/// Corrective action run between a failed attempt and its retry.
pub trait RecoveryStrategy: Send + Sync {
    /// Unique name within its error kind, used for scoring.
    fn name(&self) -> &str;

    /// The failure kind this strategy handles.
    fn kind(&self) -> ErrorKind;

    /// Attempt to recover from `error` observed while running `context`.
    fn recover<'a>(
        &'a self,
        error: &'a OperationError,
        context: &'a DispatchContext,
    ) -> BoxFuture<'a, Result<RecoveryAction, RecoveryError>>;
}

type RecoverFn = dyn Fn(&OperationError, &DispatchContext) -> Result<RecoveryAction, RecoveryError>
    + Send
    + Sync;

/// Strategy backed by a synchronous closure.
pub struct FnStrategy {
    name: String,
    kind: ErrorKind,
    recover: Arc<RecoverFn>,
}

impl FnStrategy {
    pub fn new<F>(name: impl Into<String>, kind: ErrorKind, recover: F) -> Self
    where
        F: Fn(&OperationError, &DispatchContext) -> Result<RecoveryAction, RecoveryError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            kind,
            recover: Arc::new(recover),
        }
    }
}

impl fmt::Debug for FnStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStrategy")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl RecoveryStrategy for FnStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ErrorKind {
        self.kind
    }

    fn recover<'a>(
        &'a self,
        error: &'a OperationError,
        context: &'a DispatchContext,
    ) -> BoxFuture<'a, Result<RecoveryAction, RecoveryError>> {
        let result = (self.recover)(error, context);
        futures::future::ready(result).boxed()
    }
}

/// Something that can give back memory or capacity under pressure.
pub trait LoadShedder: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Shed roughly `fraction` (0.0..=1.0) of held load. Returns how many
    /// units were released.
    fn shed(&self, fraction: f64) -> usize;
}

/// Built-in `ResourceExhaustion` strategy.
///
/// Asks every registered shedder (the result cache, the throttle) to give
/// back load before the retry. The amount shed is recorded in the context
/// hint [`SHED_HINT`].
pub struct ShedLoadStrategy {
    shedders: Vec<Arc<dyn LoadShedder>>,
    fraction: f64,
}

impl ShedLoadStrategy {
    pub const NAME: &'static str = "shed_load";

    pub fn new(shedders: Vec<Arc<dyn LoadShedder>>) -> Self {
        Self {
            shedders,
            fraction: DEFAULT_SHED_FRACTION,
        }
    }

    /// Set the fraction handed to each shedder (clamped to 0.0..=1.0).
    pub fn with_fraction(mut self, fraction: f64) -> Self {
        self.fraction = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn fraction(&self) -> f64 {
        self.fraction
    }
}

impl fmt::Debug for ShedLoadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.shedders.iter().map(|s| s.name()).collect();
        f.debug_struct("ShedLoadStrategy")
            .field("shedders", &names)
            .field("fraction", &self.fraction)
            .finish()
    }
}

impl RecoveryStrategy for ShedLoadStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn kind(&self) -> ErrorKind {
        ErrorKind::ResourceExhaustion
    }

    fn recover<'a>(
        &'a self,
        _error: &'a OperationError,
        context: &'a DispatchContext,
    ) -> BoxFuture<'a, Result<RecoveryAction, RecoveryError>> {
        async move {
            if self.shedders.is_empty() {
                return Ok(RecoveryAction::skipped());
            }

            let mut total = 0;
            for shedder in &self.shedders {
                let released = shedder.shed(self.fraction);
                debug!(
                    shedder = shedder.name(),
                    released,
                    fraction = self.fraction,
                    "Shed load"
                );
                total += released;
            }

            let next = context.clone().with_hint(SHED_HINT, total.to_string());
            Ok(RecoveryAction::with_context(next))
        }
        .boxed()
    }
}

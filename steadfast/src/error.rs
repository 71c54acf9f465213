//! Error types for the dispatch engine.
//!
//! Failures are split along two axes:
//!
//! - **Operation failures** ([`OperationError`]) come back from strategy
//!   executions. They carry an [`ErrorKind`] that drives recovery strategy
//!   lookup and decides whether the breaker counts them.
//! - **Boundary errors** ([`DispatchError`]) are contract violations at the
//!   API edge (empty key, no strategies, closed engine). These are the only
//!   errors `run` surfaces as `Err`; everything else becomes an outcome.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Failure taxonomy used for recovery lookup and breaker accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network/resource hiccups. Retryable, breaker-counted.
    Transient,
    /// Programming or invalid-input errors. Retried a bounded number of
    /// times but rarely fixed by recovery; still breaker-counted.
    Structural,
    /// Memory or capacity pressure. Has a dedicated shedding strategy.
    ResourceExhaustion,
    /// The attempt exceeded its per-call timeout. Treated like `Transient`.
    Timeout,
    /// Explicit teardown. Never retried, never breaker-counted.
    Cancelled,
}

impl ErrorKind {
    /// Short lowercase name used in logs, config and telemetry.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Structural => "structural",
            ErrorKind::ResourceExhaustion => "resource_exhaustion",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Anything that can report which [`ErrorKind`] it belongs to.
///
/// The circuit breaker is generic over its operation's error type and only
/// needs this to tell cancellations apart from real failures.
pub trait Failure {
    /// The taxonomy bucket of this failure.
    fn error_kind(&self) -> ErrorKind;

    /// Cancellation is a terminal outcome, not a failure.
    fn is_cancellation(&self) -> bool {
        self.error_kind() == ErrorKind::Cancelled
    }
}

/// Error returned by a strategy execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} failure: {message}")]
pub struct OperationError {
    /// Taxonomy bucket.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl OperationError {
    /// Create an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn structural(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Structural, message)
    }

    pub fn resource_exhaustion(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceExhaustion, message)
    }

    /// An attempt that did not finish within `timeout`.
    pub fn timeout(timeout: std::time::Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("attempt exceeded {}ms", timeout.as_millis()),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "operation cancelled")
    }
}

impl Failure for OperationError {
    fn error_kind(&self) -> ErrorKind {
        self.kind
    }
}

/// Contract violations at the `run` boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The work key was empty or whitespace.
    #[error("invalid work key: {0:?}")]
    InvalidKey(String),

    /// The work item carried no strategies at all.
    #[error("work item {key} has no execution strategies")]
    NoStrategies { key: String },

    /// The engine has been closed.
    #[error("dispatch engine is closed")]
    Closed,
}

/// Errors raised while building or loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value is outside its allowed range.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    /// The INI file could not be read or parsed.
    #[error("failed to load config file {path}: {source}")]
    Load {
        path: String,
        #[source]
        source: ini::Error,
    },

    /// The INI file could not be written.
    #[error("failed to write config file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The configuration could not be rendered as INI text.
    #[error("failed to render config: {0}")]
    Render(#[source] std::io::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

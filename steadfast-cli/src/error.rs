//! CLI error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    ConfigFile(#[from] steadfast::ConfigError),

    #[error("Failed to initialize logging: {0}")]
    Logging(#[from] steadfast::logging::LoggingError),

    #[error("Failed to start async runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("Failed to set signal handler: {0}")]
    Signal(String),

    #[error("Failed to serialize telemetry: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] steadfast::DispatchError),
}

//! Error types for the deployment daemon

use thiserror::Error;

/// Main error type for the deployment daemon
#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Event decode error: {0}")]
    DecodeError(#[from] veren_domain::DecodeError),

    #[error("Invalid transition: {0}")]
    TransitionError(#[from] veren_domain::TransitionError),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Queue error: {0}")]
    QueueError(String),

    #[error("Event bus error: {0}")]
    BusError(String),

    #[error("Concurrent update of deployment {0}")]
    Conflict(String),

    #[error("Command failed: {0}")]
    CommandError(String),

    #[error("Registry error: {0}")]
    RegistryError(String),

    #[error("Source control error: {0}")]
    SourceControlError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for PlatformError {
    fn from(err: anyhow::Error) -> Self {
        PlatformError::Internal(err.to_string())
    }
}

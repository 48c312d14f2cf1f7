//! Error types for the core module.

use llm_core::ProviderError;

/// Core error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Referenced chat, turn or block does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Malformed request input.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Malformed reconnection marker.
    #[error("invalid event id: {0}")]
    InvalidMarker(String),

    /// A writer is already attached to this turn.
    #[error("turn {0} is already streaming")]
    AlreadyStreaming(String),

    /// The turn has no active stream.
    #[error("turn {0} is not currently streaming")]
    NotStreaming(String),

    /// Unknown provider/model or unusable provider settings.
    #[error("configuration error: {0}")]
    Config(String),

    /// Upstream provider failure.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Database failure.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Stored JSON could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking store call panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl Error {
    pub(crate) fn not_found(what: &str, id: &str) -> Self {
        Self::NotFound(format!("{what} {id}"))
    }
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

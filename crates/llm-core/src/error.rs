//! Normalized provider errors.
//!
//! Adapters never surface upstream error types. Every failure lands in one
//! of the categories below, each of which knows whether a retry can help.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Provider failure, normalized across upstream APIs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Too many requests.
    #[error("rate limited: {message}")]
    RateLimit {
        message: String,
        retry_after: Option<Duration>,
    },

    /// The provider call exceeded its deadline.
    #[error("request timed out")]
    Timeout,

    /// Upstream is temporarily over capacity.
    #[error("provider overloaded: {0}")]
    Overloaded(String),

    /// The request was rejected as malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or rejected credentials.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Upstream failed while handling a valid request.
    #[error("server error: {message}")]
    Server {
        status: Option<u16>,
        message: String,
    },

    /// Connection or transport failure.
    #[error("network error: {0}")]
    Network(String),
}

/// Category of a [`ProviderError`], as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimit,
    Timeout,
    Overloaded,
    InvalidRequest,
    Authentication,
    Server,
    Network,
}

impl ProviderError {
    /// Error for an adapter constructed without credentials.
    #[must_use]
    pub fn missing_api_key(provider: &str) -> Self {
        Self::Authentication(format!("no API key configured for {provider}"))
    }

    /// Map a non-success HTTP status and its body to an error.
    #[must_use]
    pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        let message = extract_message(body);
        match status {
            400 | 404 | 413 | 422 => Self::InvalidRequest(message),
            401 | 403 => Self::Authentication(message),
            408 => Self::Timeout,
            429 => Self::RateLimit {
                message,
                retry_after,
            },
            503 | 529 => Self::Overloaded(message),
            _ => Self::Server {
                status: Some(status),
                message,
            },
        }
    }

    /// Category of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimit { .. } => ErrorKind::RateLimit,
            Self::Timeout => ErrorKind::Timeout,
            Self::Overloaded(_) => ErrorKind::Overloaded,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Authentication(_) => ErrorKind::Authentication,
            Self::Server { .. } => ErrorKind::Server,
            Self::Network(_) => ErrorKind::Network,
        }
    }

    /// Whether retrying the same request may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidRequest(_) | Self::Authentication(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if let Some(status) = err.status() {
            Self::from_status(status.as_u16(), &err.to_string(), None)
        } else if err.is_decode() {
            Self::Server {
                status: None,
                message: err.to_string(),
            }
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// Pull a human-readable message out of an upstream error body.
///
/// Both Anthropic and OpenAI-style APIs nest it under `error.message`.
fn extract_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

/// Parse a `retry-after` header value given in seconds.
#[must_use]
pub fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    value
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Result type for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

//! Error types for Scribeflow.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Planning error: {0}")]
    Planning(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Typed failure returned by a remote generation provider.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// Remote throttling (quota exhausted, HTTP 429 equivalent).
    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// A dependent resource is not ready yet (e.g. an upload still processing).
    #[error("Resource not ready: {0}")]
    NotReady(String),

    /// The asset or request is malformed or oversized.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Raw HTTP failure that the provider did not map itself.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The caller-side timeout expired before the provider answered.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Provider error: {0}")]
    Other(String),
}

impl ProviderError {
    /// Server-suggested wait, when the provider sent one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

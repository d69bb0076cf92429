//! Artifact store error types.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for artifact store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors from an artifact store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store is misconfigured (missing credentials, bad base URL, ...).
    /// Retrying will not help.
    #[error("artifact store misconfigured: {0}")]
    Config(String),

    /// Network request failed.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The store answered with a non-success status.
    #[error("artifact store API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Local filesystem failure while staging or unpacking files.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failure building or reading a zip archive.
    #[error("archive error: {0}")]
    Archive(String),

    /// The store returned something we could not interpret.
    #[error("unexpected response: {0}")]
    Parse(String),

    /// The store throttled us. Retry on a later run.
    #[error("artifact store rate limited ({status}): {message}")]
    RateLimited { status: u16, message: String },

    #[error("artifact not found: {0}")]
    NotFound(String),

    /// A blocking filesystem task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the failure is a configuration problem rather than a
    /// transient one.
    ///
    /// Only credential failures count: 401, and 403 unless the message says
    /// it is a rate limit. A 404 from a download means the artifact expired
    /// or was deleted after it was listed, which the next run will not see
    /// again; backends report a missing repository as [`StoreError::Config`].
    pub fn is_config(&self) -> bool {
        match self {
            Self::Config(_) => true,
            Self::Api { status: 401, .. } => true,
            Self::Api {
                status: 403,
                message,
            } => !is_rate_limit_message(message),
            _ => false,
        }
    }
}

/// GitHub words both primary and secondary limits as "... rate limit ...".
pub(crate) fn is_rate_limit_message(message: &str) -> bool {
    message.to_ascii_lowercase().contains("rate limit")
}

impl From<zip::result::ZipError> for StoreError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::Archive(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

//! Error types for the Keel sync engine.
//!
//! Every fallible operation in the crate returns [`KeelError`]. Per-item
//! failures during a sync are collected into structured results instead of
//! escaping as errors; only store-level failures propagate.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the Keel library.
#[derive(Debug, Error)]
pub enum KeelError {
    // Network errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        /// Optional cause description
        cause: Option<String>,
    },

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    // Database errors
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Transfer errors
    #[error("Download failed for {url}: {message}")]
    DownloadFailed { url: String, message: String },

    #[error("Download cancelled")]
    DownloadCancelled,

    #[error("Download paused")]
    DownloadPaused,

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    // Content errors
    #[error("Archive error for {archive}: {message}")]
    Archive { archive: String, message: String },

    #[error("Manifest error: {message}")]
    Manifest { message: String },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // Validation errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for Keel operations.
pub type Result<T> = std::result::Result<T, KeelError>;

impl From<std::io::Error> for KeelError {
    fn from(err: std::io::Error) -> Self {
        KeelError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for KeelError {
    fn from(err: serde_json::Error) -> Self {
        KeelError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for KeelError {
    fn from(err: rusqlite::Error) -> Self {
        KeelError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for KeelError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            KeelError::Timeout(std::time::Duration::from_secs(0))
        } else {
            KeelError::Network {
                message: err.to_string(),
                cause: err.url().map(|u| u.to_string()),
            }
        }
    }
}

impl From<zip::result::ZipError> for KeelError {
    fn from(err: zip::result::ZipError) -> Self {
        KeelError::Archive {
            archive: String::new(),
            message: err.to_string(),
        }
    }
}

impl KeelError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        KeelError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Error for a poisoned database mutex.
    pub(crate) fn lock_poisoned(what: impl std::fmt::Display) -> Self {
        KeelError::Database {
            message: format!("Failed to lock database: {}", what),
            source: None,
        }
    }

    /// Check if this error is worth another attempt by a fresh sync.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KeelError::Network { .. } | KeelError::Timeout(_) | KeelError::DownloadFailed { .. }
        )
    }

    /// Whether the error came from content verification rather than transport.
    pub fn is_verification(&self) -> bool {
        matches!(
            self,
            KeelError::HashMismatch { .. } | KeelError::SizeMismatch { .. }
        )
    }
}

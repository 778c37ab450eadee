//! Error types for matflow.
//!
//! Library crates use [`MatflowError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all matflow operations.
#[derive(Debug, thiserror::Error)]
pub enum MatflowError {
    /// Missing or malformed configuration, schema, or template. Fatal at startup.
    #[error("config error: {message}")]
    Config { message: String },

    /// Model call failed in a way that may succeed on retry.
    #[error("transient model error: {0}")]
    TransientModel(String),

    /// Model call failed in a way that will not succeed on retry.
    #[error("permanent model error: {0}")]
    PermanentModel(String),

    /// Database or artifact persistence failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Malformed input data (catalog rows, JSON documents).
    #[error("parse error: {message}")]
    Parse { message: String },

    /// A fingerprint was marked with two different terminal outcomes.
    #[error("manifest conflict for {fingerprint}: {message}")]
    ManifestConflict {
        fingerprint: String,
        message: String,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, MatflowError>;

impl MatflowError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a manifest conflict error.
    pub fn conflict(fingerprint: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ManifestConflict {
            fingerprint: fingerprint.into(),
            message: msg.into(),
        }
    }
}

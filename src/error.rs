//! Error types for md-publisher
//!
//! This module provides error handling for the library, including:
//! - Domain-specific error types (DocumentRead, Token, PublishRejected, etc.)
//! - Automatic conversions from transport and serialization errors
//! - Context information (file path, account, platform response details)

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for md-publisher operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for md-publisher
///
/// This is the primary error type used throughout the library. Each variant includes
/// contextual information to help diagnose issues.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "watch_dir")
        key: Option<String>,
    },

    /// Source document could not be read or decoded
    #[error("failed to read document {path}: {reason}")]
    DocumentRead {
        /// Path of the document that failed to read
        path: PathBuf,
        /// Why the read failed (I/O error, invalid UTF-8, ...)
        reason: String,
    },

    /// Access token could not be obtained or refreshed
    ///
    /// Fatal for the current publish task: no authenticated call can be made
    /// for this account until the token endpoint recovers.
    #[error("access token error: {0}")]
    Token(String),

    /// Draft-creation call failed or returned an unexpected shape
    #[error("draft creation rejected: {0}")]
    PublishRejected(String),

    /// Platform has no implementation (explicit stub, not a silent placeholder)
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Folder watching error
    #[error("folder watch error: {0}")]
    FolderWatch(String),

    /// Shutdown in progress - not accepting new publish tasks
    #[error("shutdown in progress: not accepting new publish tasks")]
    ShuttingDown,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Front-matter or config YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

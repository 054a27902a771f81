//! Error types for relay operations.

use std::path::PathBuf;

/// All errors that can occur inside the relay core.
///
/// None of these are allowed to terminate the host process: callers log them
/// and fall back to the safest behavior for the operation at hand.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration read failed: {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigParse { path: PathBuf, details: String },

    #[error("Configuration write failed: {path}: {details}")]
    ConfigWrite { path: PathBuf, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // Connectivity Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Invalid hardware address: {0}")]
    InvalidAddress(String),

    #[error("Link state unavailable for {address}: {reason}")]
    LinkStateUnavailable { address: String, reason: String },

    // ─────────────────────────────────────────────────────────────────────
    // Notification Sink Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Notification channel not registered: {0}")]
    ChannelNotRegistered(String),

    #[error("No notification backend available")]
    SinkUnavailable,

    #[error("{program} failed: {details}")]
    CommandFailed { program: String, details: String },

    #[error("Worker task failed: {0}")]
    Worker(String),

    // ─────────────────────────────────────────────────────────────────────
    // Generic
    // ─────────────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RelayError {
    pub fn command_failed(program: &str, details: impl Into<String>) -> Self {
        RelayError::CommandFailed {
            program: program.to_string(),
            details: details.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

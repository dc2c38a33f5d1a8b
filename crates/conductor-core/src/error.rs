//! Error types for `Conductor` core library.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using `Conductor` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `Conductor` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Message sink rejected or failed to persist a message
    #[error("Message sink error: {0}")]
    Message(String),

    /// Run record could not be read or written
    #[error("Run record error at {}: {reason}", path.display())]
    RunRecord { path: PathBuf, reason: String },

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

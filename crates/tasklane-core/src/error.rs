//! Error types for `tasklane` core library.

use thiserror::Error;

use crate::tasks::TaskStatus;

/// Result type alias using `tasklane` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `tasklane` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// NDJSON parsing error
    #[error("Failed to parse NDJSON: {0}")]
    NdjsonParse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The task addressed by an update is no longer in the document
    #[error("Task not found: '{description}' in group '{group}'")]
    TaskNotFound { group: String, description: String },

    /// The requested status change is not allowed by the task state machine
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    /// Atomic replacement of the task file failed
    #[error("Failed to persist task file: {0}")]
    Persist(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

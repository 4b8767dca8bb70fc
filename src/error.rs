//! Error types for taskweave.

use std::path::PathBuf;

use thiserror::Error;

/// taskweave error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Task not found
    #[error("task not found: {id}")]
    TaskNotFound { id: String },

    /// Team not found
    #[error("team not found: {name}")]
    TeamNotFound { name: String },

    /// Background task not found
    #[error("background task not found: {id}")]
    BackgroundTaskNotFound { id: String },

    /// Persisting or reading a task record failed
    #[error("storage error at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A record lock could not be acquired in time
    #[error("timed out after {waited_ms}ms waiting for lock on task {id}")]
    LockTimeout { id: String, waited_ms: u64 },

    /// An edge mutation would leave blocks/blockedBy out of step
    #[error("dependency inconsistency: {0}")]
    DependencyInconsistency(String),

    /// An edge would close a dependency cycle
    #[error("dependency cycle: task {task} cannot be blocked by {prerequisite}")]
    DependencyCycle { task: String, prerequisite: String },

    /// Worker thread could not be started
    #[error("failed to spawn background worker: {0}")]
    Spawn(String),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid input
    #[error("validation error: {0}")]
    Validation(String),
}

impl Error {
    /// Wrap an IO failure on a specific record path.
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Storage {
            path: path.into(),
            source,
        }
    }

    /// Whether the caller may simply retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::LockTimeout { .. })
    }
}

/// Result type alias for taskweave.
pub type Result<T> = std::result::Result<T, Error>;

//! Error types for labrelay
//!
//! Every variant carries a message that is safe to show to an observer.

use thiserror::Error;

use crate::experiment::ExperimentStatus;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// labrelay error types
#[derive(Error, Debug)]
pub enum Error {
    /// Experiment name failed schema name validation
    #[error("Invalid experiment name: '{0}'. Only ASCII letters, digits and underscores are allowed, and the name must not start with a digit")]
    InvalidName(String),

    /// A non-terminal run with this name is already registered
    #[error("Experiment '{0}' already exists. Use override=true to replace it.")]
    DuplicateRun(String),

    /// Experiment is unknown to both the registry and the datastore
    #[error("Experiment '{0}' not found")]
    NotFound(String),

    /// Registry asked to perform a transition the lifecycle forbids
    #[error("Invalid transition for experiment '{name}': {from} -> {to}")]
    InvalidTransition {
        /// Experiment name
        name: String,
        /// Status the entry was in
        from: ExperimentStatus,
        /// Status that was requested
        to: ExperimentStatus,
    },

    /// Transition issued by a runner whose registration was superseded
    #[error("Run {run_id} of experiment '{name}' was superseded")]
    StaleRun {
        /// Experiment name
        name: String,
        /// Run id held by the caller
        run_id: u64,
    },

    /// Cursor timestamp could not be parsed
    #[error("Invalid timestamp: '{0}'. Expected RFC 3339")]
    InvalidTimestamp(String),

    /// Malformed request parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Datastore error (transient from the point of view of readers)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Network transport failure talking to a remote server
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration could not be loaded or is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether a reader may retry the failed operation on its next tick.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Transport(_) | Self::Io(_))
    }

    /// Whether the error was caused by the request rather than the system.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidName(_)
                | Self::DuplicateRun(_)
                | Self::NotFound(_)
                | Self::InvalidTimestamp(_)
                | Self::InvalidRequest(_)
        )
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

//! Container runtime error types.

use thiserror::Error;

/// Result type for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Errors that can occur during container operations.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The daemon rejected or failed an operation.
    #[error("container {operation} failed: {message}")]
    Daemon { operation: String, message: String },

    /// Container was not found (daemon answered 404).
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Container exists but is not running.
    #[error("container not running: {0}")]
    NotRunning(String),

    /// Container never reached the running state.
    #[error(
        "container {container_id} not ready after {attempts} attempt(s) (last state: {last_state})"
    )]
    ReadinessTimeout {
        container_id: String,
        attempts: u32,
        last_state: String,
    },

    /// Container exited or died while we were waiting for it.
    #[error("container {container_id} stopped during startup (state: {state})")]
    StartupFailed { container_id: String, state: String },

    /// Failed to parse a daemon response.
    #[error("failed to parse daemon response: {0}")]
    ParseError(String),

    /// Could not reach the container daemon.
    #[error("no container daemon available: {0}")]
    Connection(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl ContainerError {
    /// True when the daemon reported the container as absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ContainerError::ContainerNotFound(_))
    }

    /// True when the daemon reported the container as already stopped.
    pub fn is_not_running(&self) -> bool {
        matches!(self, ContainerError::NotRunning(_))
    }

    pub(crate) fn daemon(operation: &str, message: impl Into<String>) -> Self {
        ContainerError::Daemon {
            operation: operation.to_string(),
            message: message.into(),
        }
    }
}

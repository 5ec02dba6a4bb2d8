//! Domain-specific error types for exec providers.
//!
//! Typed errors enable callers to match on specific failure modes
//! rather than parsing error message strings.

/// Errors that prevent a command from running at all.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// Docker daemon is not running or not accessible.
    #[error("Docker is not available: {message}")]
    DockerUnavailable { message: String },

    /// Container operation failed (inspect, create, start, exec, etc.).
    #[error("Container operation failed: {message}")]
    ContainerFailed { message: String },

    /// The command could not be spawned.
    #[error("Failed to spawn '{command}': {message}")]
    SpawnFailed { command: String, message: String },

    /// Cancellation was requested before the command started.
    #[error("Execution cancelled before start")]
    Cancelled,
}

impl ExecError {
    /// Creates a `DockerUnavailable` error.
    pub fn docker_unavailable(message: impl Into<String>) -> Self {
        Self::DockerUnavailable {
            message: message.into(),
        }
    }

    /// Creates a `ContainerFailed` error.
    pub fn container_failed(message: impl Into<String>) -> Self {
        Self::ContainerFailed {
            message: message.into(),
        }
    }

    /// Creates a `SpawnFailed` error.
    pub fn spawn_failed(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SpawnFailed {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Returns true if cancellation prevented the command from starting.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

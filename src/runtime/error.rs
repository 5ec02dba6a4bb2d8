//! Errors raised synchronously by the runtime facade.
//!
//! Run failures are not here: those travel as events through the run's
//! stream. These are precondition and helper-command failures.

use super::events::RunStatus;
use crate::graph::GraphError;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// An operation needed configuration before `init` was called.
    #[error("Sandbox runtime is not initialized")]
    NotInitialized,

    /// The start run ended without completing.
    #[error("Sandbox start did not complete ({status})")]
    StartFailed { status: RunStatus },

    /// A configured task graph is invalid.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// A configured task could not be turned into a runnable task.
    #[error("{0:#}")]
    InvalidTask(anyhow::Error),

    /// A git helper command failed.
    #[error("git {command} failed: {message}")]
    Git { command: String, message: String },

    /// Reading or writing conversation threads failed.
    #[error("Thread store error: {0:#}")]
    Thread(anyhow::Error),
}

impl RuntimeError {
    /// Creates a `Git` error.
    pub fn git(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Git {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Returns true if the error is caused by the caller's configuration or
    /// call order rather than by the sandbox.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::NotInitialized | Self::Graph(_) | Self::InvalidTask(_)
        )
    }
}

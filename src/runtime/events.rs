use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::exec::ExecEvent;
use crate::graph::TaskEvent;
use crate::thread::Checkpoint;

/// Which operation a run performs. At most one run per kind is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Start,
    Deploy,
    Agent,
}

impl std::fmt::Display for RunKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Deploy => write!(f, "deploy"),
            Self::Agent => write!(f, "agent"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Active,
    Completed,
    Failed,
    Superseded,
    UserCancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Superseded => write!(f, "superseded"),
            Self::UserCancelled => write!(f, "user cancelled"),
        }
    }
}

/// Why a run was cancelled from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// A newer run of the same kind replaced it.
    Superseded,
    /// Someone asked it to stop.
    UserRequested,
}

impl CancelReason {
    pub fn status(self) -> RunStatus {
        match self {
            Self::Superseded => RunStatus::Superseded,
            Self::UserRequested => RunStatus::UserCancelled,
        }
    }
}

/// What listeners of a run receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// Output of one task in a start or deploy graph.
    Task {
        task_id: String,
        title: String,
        event: ExecEvent,
    },
    /// Output of the agent process.
    Agent { event: ExecEvent },
    /// The checkpoint an agent run starts from.
    Checkpoint { checkpoint: Checkpoint },
    /// A failure outside any single task.
    Error {
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// The run is being stopped on request.
    AbortRequested { reason: String },
    /// A newer run replaced this one.
    Superseded,
}

impl RunEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn abort_requested(reason: impl Into<String>) -> Self {
        Self::AbortRequested {
            reason: reason.into(),
        }
    }

    /// Returns true if this event means the run failed.
    pub fn is_error(&self) -> bool {
        match self {
            Self::Task { event, .. } | Self::Agent { event } => event.is_error(),
            Self::Error { .. } => true,
            Self::Checkpoint { .. } | Self::AbortRequested { .. } | Self::Superseded => false,
        }
    }
}

impl From<TaskEvent> for RunEvent {
    fn from(event: TaskEvent) -> Self {
        Self::Task {
            task_id: event.task_id,
            title: event.title,
            event: event.event,
        }
    }
}

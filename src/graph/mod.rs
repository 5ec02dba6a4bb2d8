//! Dependency-ordered task execution.
//!
//! A task graph is a list of [`Task`]s whose `depends_on` sets form a DAG.
//! [`GraphExecutor`] validates the graph once, then runs every task as soon as
//! all of its dependencies have completed, concurrently and without a
//! parallelism limit. The events of every task are merged into one stream.

mod error;
mod executor;
mod plan;
mod service;

pub(crate) use error::GraphError;
pub(crate) use executor::GraphExecutor;
pub(crate) use plan::TaskGraph;
pub(crate) use service::tasks_from_config;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::exec::{EventStream, ExecEvent, ExecProvider, ExecRequest};

/// What a task gets to work with.
#[derive(Clone)]
pub(crate) struct TaskContext {
    pub exec: Arc<dyn ExecProvider>,
    pub cancel: CancellationToken,
}

/// An arbitrary async step that yields execution events.
///
/// `Err` means the step could not start at all; it is reported in the merged
/// stream as an error event for the task.
#[async_trait]
pub(crate) trait TaskFn: Send + Sync {
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<EventStream>;
}

#[async_trait]
impl<F, Fut> TaskFn for F
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<EventStream>> + Send + 'static,
{
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<EventStream> {
        (self)(ctx).await
    }
}

#[derive(Clone)]
pub(crate) enum TaskKind {
    /// Runs a command through the exec provider.
    Command(ExecRequest),
    /// Runs custom code.
    Function(Arc<dyn TaskFn>),
}

impl std::fmt::Debug for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Command(request) => f.debug_tuple("Command").field(&request.display()).finish(),
            Self::Function(_) => f.write_str("Function"),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Task {
    pub id: String,
    pub title: String,
    pub depends_on: BTreeSet<String>,
    pub kind: TaskKind,
}

impl Task {
    pub fn command(id: impl Into<String>, title: impl Into<String>, request: ExecRequest) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            depends_on: BTreeSet::new(),
            kind: TaskKind::Command(request),
        }
    }

    pub fn function(
        id: impl Into<String>,
        title: impl Into<String>,
        f: impl TaskFn + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            depends_on: BTreeSet::new(),
            kind: TaskKind::Function(Arc::new(f)),
        }
    }

    #[must_use]
    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }
}

/// One execution event, attributed to the task that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct TaskEvent {
    pub task_id: String,
    pub title: String,
    pub event: ExecEvent,
}

impl TaskEvent {
    pub fn new(task: &Task, event: ExecEvent) -> Self {
        Self {
            task_id: task.id.clone(),
            title: task.title.clone(),
            event,
        }
    }
}

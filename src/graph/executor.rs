use futures_util::stream::{FuturesUnordered, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{GraphError, Task, TaskContext, TaskEvent, TaskGraph, TaskKind};
use crate::exec::{channel_stream, EventStream, ExecEvent, ExecProvider};

/// Runs task graphs on an exec provider.
#[derive(Clone)]
pub(crate) struct GraphExecutor {
    exec: Arc<dyn ExecProvider>,
}

impl GraphExecutor {
    pub fn new(exec: Arc<dyn ExecProvider>) -> Self {
        Self { exec }
    }

    /// Validates `tasks` and starts running them.
    ///
    /// Validation failures are returned before any task starts. Task failures
    /// show up in the stream as error events; the stream ends once every task
    /// has finished or been blocked by a failed dependency.
    pub fn execute(
        &self,
        tasks: Vec<Task>,
        cancel: CancellationToken,
    ) -> Result<EventStream<TaskEvent>, GraphError> {
        let graph = TaskGraph::build(tasks)?;
        Ok(self.run(graph, cancel))
    }

    /// Runs an already validated graph.
    pub fn run(&self, graph: TaskGraph, cancel: CancellationToken) -> EventStream<TaskEvent> {
        let (tx, rx) = mpsc::channel(256);
        let ctx = TaskContext {
            exec: Arc::clone(&self.exec),
            cancel,
        };
        tokio::spawn(drive(graph, ctx, tx));
        channel_stream(rx)
    }
}

/// Schedules tasks as their dependencies complete.
async fn drive(graph: TaskGraph, ctx: TaskContext, tx: mpsc::Sender<TaskEvent>) {
    info!("Running task graph with {} task(s)", graph.len());

    let mut waiting: HashMap<&str, usize> = graph
        .tasks()
        .iter()
        .map(|task| (task.id.as_str(), task.depends_on.len()))
        .collect();
    let mut blocked: HashSet<String> = HashSet::new();
    let mut running = FuturesUnordered::new();

    for task in graph.tasks().iter().filter(|t| t.depends_on.is_empty()) {
        running.push(run_task(task.clone(), ctx.clone(), tx.clone()));
    }

    while let Some((id, ok)) = running.next().await {
        if !ok {
            let downstream = graph.downstream(&id);
            if !downstream.is_empty() {
                warn!(
                    "Task '{}' did not complete; blocking {}",
                    id,
                    downstream.join(", ")
                );
            }
            blocked.extend(downstream);
            continue;
        }

        for dependent in graph.dependents(&id) {
            let Some(remaining) = waiting.get_mut(dependent.as_str()) else {
                continue;
            };
            *remaining = remaining.saturating_sub(1);
            if *remaining > 0 || blocked.contains(dependent) {
                continue;
            }
            if ctx.cancel.is_cancelled() {
                debug!("Not starting '{}': graph cancelled", dependent);
                continue;
            }
            if let Some(task) = graph.get(dependent) {
                running.push(run_task(task.clone(), ctx.clone(), tx.clone()));
            }
        }
    }

    debug!("Task graph finished");
}

/// Runs one task, forwarding its events. Returns its id and whether it completed.
async fn run_task(task: Task, ctx: TaskContext, tx: mpsc::Sender<TaskEvent>) -> (String, bool) {
    debug!("Starting task '{}'", task.id);

    let started = match &task.kind {
        TaskKind::Command(request) => ctx
            .exec
            .execute(request.clone(), ctx.cancel.clone())
            .await
            .map_err(anyhow::Error::from),
        TaskKind::Function(f) => f.run(ctx.clone()).await,
    };

    let mut events = match started {
        Ok(events) => events,
        Err(e) => {
            warn!("Task '{}' failed to start: {:#}", task.id, e);
            let _ = tx
                .send(TaskEvent::new(&task, ExecEvent::error(format!("{e:#}"))))
                .await;
            return (task.id, false);
        }
    };

    let mut failed = false;
    loop {
        let event = tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => {
                debug!("Task '{}' cancelled", task.id);
                return (task.id, false);
            }
            event = events.next() => event,
        };
        let Some(event) = event else { break };

        if event.is_error() {
            failed = true;
        }
        if tx.send(TaskEvent::new(&task, event)).await.is_err() {
            debug!("Task '{}' has no listener left", task.id);
            return (task.id, false);
        }
    }

    if failed {
        warn!("Task '{}' failed", task.id);
    } else {
        info!("Task '{}' completed", task.id);
    }
    (task.id, !failed)
}

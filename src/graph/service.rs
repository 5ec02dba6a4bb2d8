//! Tasks built from `[start]` / `[deploy]` configuration.
//!
//! Plain tasks run their command to completion. Tasks with a `ready` table
//! are long-running services: they count as complete once the service is
//! ready, and their process keeps running in the background.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Task, TaskContext, TaskFn};
use crate::config::{ReadyConfig, TaskConfig};
use crate::exec::{channel_stream, EventStream, ExecEvent, ExecRequest};

/// Converts configured tasks into graph tasks that run in `workdir`.
pub(crate) fn tasks_from_config(configs: &[TaskConfig], workdir: &str) -> Result<Vec<Task>> {
    configs
        .iter()
        .map(|config| task_from_config(config, workdir))
        .collect()
}

fn task_from_config(config: &TaskConfig, workdir: &str) -> Result<Task> {
    let request = ExecRequest::parse(&config.command)
        .with_context(|| format!("Invalid command for task '{}'", config.id))?
        .cwd(workdir);
    if request.command.is_empty() {
        anyhow::bail!("Task '{}' has an empty command", config.id);
    }

    let title = config.title.clone().unwrap_or_else(|| config.id.clone());

    let task = match &config.ready {
        None => Task::command(&config.id, title, request),
        Some(ready) => Task::function(
            &config.id,
            title,
            DetachedService::new(&config.id, request, ready)?,
        ),
    };

    Ok(task.depends_on(config.depends_on.iter().cloned()))
}

#[derive(Debug, Clone)]
enum Readiness {
    /// Any HTTP response from this URL.
    Url(String),
    /// A stdout chunk containing this text.
    Pattern(String),
}

/// A service process that completes its task once it is ready.
#[derive(Debug, Clone)]
struct DetachedService {
    id: String,
    request: ExecRequest,
    readiness: Readiness,
    timeout: Duration,
    interval: Duration,
}

impl DetachedService {
    fn new(id: &str, request: ExecRequest, ready: &ReadyConfig) -> Result<Self> {
        let readiness = match (&ready.url, &ready.pattern) {
            (Some(url), None) => Readiness::Url(url.clone()),
            (None, Some(pattern)) => Readiness::Pattern(pattern.clone()),
            (Some(_), Some(_)) => {
                anyhow::bail!("Task '{id}': set either ready.url or ready.pattern, not both")
            }
            (None, None) => anyhow::bail!("Task '{id}': ready needs a url or a pattern"),
        };

        Ok(Self {
            id: id.to_string(),
            request,
            readiness,
            timeout: Duration::from_secs(ready.timeout_secs),
            interval: Duration::from_millis(ready.interval_ms.max(1)),
        })
    }
}

#[async_trait]
impl TaskFn for DetachedService {
    async fn run(&self, ctx: TaskContext) -> Result<EventStream> {
        let process_cancel = ctx.cancel.child_token();
        let mut events = ctx
            .exec
            .execute(self.request.clone(), process_cancel.clone())
            .await?;

        let (tx, rx) = mpsc::channel(64);
        let service = self.clone();

        tokio::spawn(async move {
            let client = reqwest::Client::builder()
                .timeout(service.interval)
                .build()
                .unwrap_or_default();
            let mut probe = tokio::time::interval(service.interval);
            let deadline = tokio::time::sleep(service.timeout);
            tokio::pin!(deadline);

            loop {
                let ready = tokio::select! {
                    () = &mut deadline => {
                        warn!("Service '{}' not ready after {}s", service.id, service.timeout.as_secs());
                        let message = format!("not ready after {}s", service.timeout.as_secs());
                        let _ = tx.send(ExecEvent::error(message)).await;
                        process_cancel.cancel();
                        return;
                    }
                    event = events.next() => match event {
                        Some(event @ ExecEvent::Error { .. }) => {
                            let _ = tx.send(event).await;
                            return;
                        }
                        Some(ExecEvent::Complete { .. }) | None => {
                            let _ = tx.send(ExecEvent::error("exited before becoming ready")).await;
                            return;
                        }
                        Some(event) => {
                            let matched = matches!(
                                (&service.readiness, &event),
                                (Readiness::Pattern(p), ExecEvent::Stdout { data, .. }) if data.contains(p.as_str())
                            );
                            if tx.send(event).await.is_err() {
                                return;
                            }
                            matched
                        }
                    },
                    _ = probe.tick(), if matches!(service.readiness, Readiness::Url(_)) => {
                        match &service.readiness {
                            Readiness::Url(url) => client.get(url).send().await.is_ok(),
                            Readiness::Pattern(_) => false,
                        }
                    }
                };

                if ready {
                    break;
                }
            }

            info!("Service '{}' is ready", service.id);
            let _ = tx.send(ExecEvent::complete()).await;
            drop(tx);

            // Keep reading so the process is never blocked on a full pipe.
            while let Some(event) = events.next().await {
                match event {
                    ExecEvent::Stdout { data, .. } | ExecEvent::Stderr { data, .. } => {
                        debug!("[{}] {}", service.id, data.trim_end());
                    }
                    ExecEvent::Error { message, .. } => {
                        warn!("Service '{}' stopped: {}", service.id, message);
                    }
                    ExecEvent::Complete { .. } => info!("Service '{}' exited", service.id),
                    ExecEvent::Start { .. } => {}
                }
            }
        });

        Ok(channel_stream(rx))
    }
}

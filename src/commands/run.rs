//! Run the start or deploy graph once in the foreground.

mod format;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::ValueEnum;
use colored::Colorize;
use futures_util::StreamExt;
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{Config, ExecBackend, TaskConfig};
use crate::exec::{self, ExecEvent};
use crate::graph::{tasks_from_config, GraphExecutor, TaskEvent};

use format::{format_banner, format_summary, format_task_event, BannerInfo, RunTally};

/// Which configured graph to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GraphKind {
    Start,
    Deploy,
}

impl GraphKind {
    fn tasks(self, config: &Config) -> &[TaskConfig] {
        match self {
            Self::Start => &config.start.tasks,
            Self::Deploy => &config.deploy.tasks,
        }
    }
}

impl std::fmt::Display for GraphKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Deploy => write!(f, "deploy"),
        }
    }
}

/// Runs the graph and returns whether every task completed.
pub async fn run(kind: GraphKind, backend: Option<ExecBackend>) -> Result<bool> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    let config = Config::load(&cwd).context("Failed to load sandbox.toml")?;

    let configs = kind.tasks(&config);
    let services: HashSet<String> = configs
        .iter()
        .filter(|t| t.ready.is_some())
        .map(|t| t.id.clone())
        .collect();
    let tasks = tasks_from_config(configs, &config.sandbox.workdir)?;
    let total = tasks.len();

    let provider = exec::build_provider(&config, &cwd, backend);
    print!(
        "{}",
        format_banner(&BannerInfo {
            graph: kind.to_string(),
            exec: provider.name().to_string(),
            workdir: config.sandbox.workdir.clone(),
            tasks: total,
        })
    );

    let cancel = CancellationToken::new();
    spawn_ctrl_c(cancel.clone());

    let started_at = Utc::now();
    let mut events = GraphExecutor::new(provider)
        .execute(tasks, cancel.clone())
        .with_context(|| format!("Invalid {kind} graph"))?;

    let mut tally = RunTally::default();
    let mut seen = HashSet::new();
    while let Some(event) = events.next().await {
        record(&mut tally, &mut seen, &event);
        println!("{}", format_task_event(&event));
    }
    tally.cancelled = cancel.is_cancelled();
    tally.blocked = total.saturating_sub(seen.len());

    println!("{}", format_summary(&tally, &(Utc::now() - started_at)));

    let running: Vec<_> = services.iter().filter(|id| seen.contains(*id)).collect();
    if tally.success() && !running.is_empty() {
        info!("{} service(s) still running", running.len());
        println!("  {} to stop the running service(s)", "Ctrl+C".dimmed());
        cancel.cancelled().await;
    }
    cancel.cancel();

    Ok(tally.success())
}

fn record(tally: &mut RunTally, seen: &mut HashSet<String>, event: &TaskEvent) {
    match event.event {
        ExecEvent::Start { .. } => {
            seen.insert(event.task_id.clone());
        }
        ExecEvent::Complete { .. } => tally.completed += 1,
        ExecEvent::Error { .. } => {
            seen.insert(event.task_id.clone());
            tally.failed += 1;
        }
        ExecEvent::Stdout { .. } | ExecEvent::Stderr { .. } => {}
    }
}

fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("Received Ctrl+C, cancelling run");
            cancel.cancel();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(task_id: &str, event: ExecEvent) -> TaskEvent {
        TaskEvent {
            task_id: task_id.to_string(),
            title: task_id.to_string(),
            event,
        }
    }

    #[test]
    fn test_graph_kind_selects_tasks() {
        let config: Config = toml::from_str(
            r#"
[[start.tasks]]
id = "install"
command = "npm install"

[[deploy.tasks]]
id = "build"
command = "npm run build"
"#,
        )
        .unwrap();
        assert_eq!(GraphKind::Start.tasks(&config)[0].id, "install");
        assert_eq!(GraphKind::Deploy.tasks(&config)[0].id, "build");
        assert_eq!(GraphKind::Deploy.to_string(), "deploy");
    }

    #[test]
    fn test_record_counts_outcomes() {
        let mut tally = RunTally::default();
        let mut seen = HashSet::new();

        for e in [
            event("install", ExecEvent::start()),
            event("install", ExecEvent::stdout("ok")),
            event("install", ExecEvent::complete()),
            event("lint", ExecEvent::start()),
            event("lint", ExecEvent::error("exited with status 2")),
        ] {
            record(&mut tally, &mut seen, &e);
        }

        assert_eq!(tally.completed, 1);
        assert_eq!(tally.failed, 1);
        assert_eq!(seen.len(), 2);
        assert!(!tally.success());
    }
}

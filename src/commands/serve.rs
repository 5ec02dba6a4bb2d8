//! Serve one sandbox runtime over HTTP.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::agent;
use crate::config::{Config, ExecBackend};
use crate::exec;
use crate::runtime::{Profile, SandboxRuntime};
use crate::server::{self, AppState};
use crate::thread::FileThreadStore;

/// Loads `sandbox.toml` from the current directory, initializes a runtime
/// from it and serves until Ctrl+C. `bind` overrides `[server].bind`.
pub async fn run(bind: Option<String>, backend: Option<ExecBackend>) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    let config = Config::load(&cwd).context("Failed to load sandbox.toml")?;

    let exec = exec::build_provider(&config, &cwd, backend);
    let agent = agent::build_provider(&config.agent)?;
    let threads = Arc::new(FileThreadStore::new(cwd.join(&config.server.threads_dir)));
    info!(
        "Using {} exec with the {} agent",
        exec.name(),
        agent.name()
    );

    let runtime = SandboxRuntime::new(exec, agent, threads, config.stream.max_buffered_events);
    runtime.init(Profile::from_config(&config));

    let bind = bind.unwrap_or_else(|| config.server.bind.clone());
    server::serve(
        AppState {
            runtime,
            project_dir: cwd,
        },
        &bind,
    )
    .await
}

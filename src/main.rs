use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod agent;
mod commands;
mod config;
mod exec;
mod graph;
mod runtime;
mod server;
mod templates;
mod thread;

use config::ExecBackend;

#[derive(Parser)]
#[command(name = "sandbox-runtime")]
#[command(
    author,
    version,
    about = "Sandbox runtime orchestrator - task graphs, live run streams and git checkpoints"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default sandbox.toml in the current project
    Init {
        /// Force overwrite existing files
        #[arg(short, long)]
        force: bool,
    },

    /// Serve the sandbox runtime over HTTP
    Serve {
        /// Address to listen on (overrides [server].bind)
        #[arg(short, long)]
        bind: Option<String>,

        /// Also write JSON logs to daily files in this directory
        #[arg(long, env = "SANDBOX_LOG_DIR")]
        log_dir: Option<PathBuf>,

        /// Exec provider: docker or local (overrides [sandbox].provider)
        #[arg(short, long)]
        provider: Option<ExecBackend>,
    },

    /// Run the start or deploy graph once in the foreground
    Run {
        /// Graph to run
        #[arg(value_enum)]
        graph: commands::run::GraphKind,

        /// Exec provider: docker or local (overrides [sandbox].provider)
        #[arg(short, long)]
        provider: Option<ExecBackend>,
    },
}

/// Console logging, plus a daily JSON log file when `log_dir` is set.
fn init_tracing(verbose: bool, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("sandbox_runtime=debug")
        } else {
            EnvFilter::new("sandbox_runtime=info")
        }
    });

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "sandbox-runtime.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_current_span(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_dir = match &cli.command {
        Commands::Serve { log_dir, .. } => log_dir.as_deref(),
        _ => None,
    };
    let _guard = init_tracing(cli.verbose, log_dir)?;

    match cli.command {
        Commands::Init { force } => {
            commands::init::run(force)?;
        }
        Commands::Serve { bind, provider, .. } => {
            commands::serve::run(bind, provider).await?;
        }
        Commands::Run { graph, provider } => {
            if !commands::run::run(graph, provider).await? {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

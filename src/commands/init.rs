//! `sandbox-runtime init`: scaffold a project for the runtime.
//!
//! Writes the default `sandbox.toml` and the `.sandbox/` state directory that
//! holds persisted threads. An existing config is only replaced with
//! `--force`; a kept one is parsed so a broken file is reported up front
//! instead of on the next `serve`.

use anyhow::{Context, Result};
use colored::Colorize;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::config::{Config, CONFIG_FILE};
use crate::templates;

/// Runtime state lives here, relative to the project root.
const STATE_DIR: &str = ".sandbox";

/// What happened to `sandbox.toml`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigOutcome {
    Created,
    Overwritten,
    Kept,
}

/// Outcome of scaffolding one project directory.
#[derive(Debug)]
struct Scaffold {
    config: ConfigOutcome,
    /// Set when a kept config fails to load.
    config_error: Option<String>,
    /// Whether `.sandbox/.gitignore` was written by this run.
    gitignore_created: bool,
}

pub(crate) fn run(force: bool) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    info!("Initializing sandbox runtime in {}", cwd.display());

    let scaffold = scaffold(&cwd, force)?;
    if let Some(e) = &scaffold.config_error {
        warn!("Existing {} does not load: {}", CONFIG_FILE, e);
    }

    print!("{}", format_scaffold(&scaffold));
    Ok(())
}

/// Writes the config and state directory under `root`.
fn scaffold(root: &Path, force: bool) -> Result<Scaffold> {
    let config_path = root.join(CONFIG_FILE);
    let existed = config_path.exists();

    let config = if existed && !force {
        ConfigOutcome::Kept
    } else {
        fs::write(&config_path, templates::SANDBOX_TOML)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
        if existed {
            ConfigOutcome::Overwritten
        } else {
            ConfigOutcome::Created
        }
    };

    let config_error = match config {
        ConfigOutcome::Kept => Config::load(root).err().map(|e| format!("{e:#}")),
        _ => None,
    };

    let state_dir = root.join(STATE_DIR);
    fs::create_dir_all(&state_dir)
        .with_context(|| format!("Failed to create directory: {}", state_dir.display()))?;

    // A user-edited ignore file is left alone even with --force.
    let gitignore = state_dir.join(".gitignore");
    let gitignore_created = !gitignore.exists();
    if gitignore_created {
        fs::write(&gitignore, templates::STATE_GITIGNORE)
            .with_context(|| format!("Failed to write {}", gitignore.display()))?;
    }

    Ok(Scaffold {
        config,
        config_error,
        gitignore_created,
    })
}

fn format_scaffold(scaffold: &Scaffold) -> String {
    let mut out = String::new();

    writeln!(
        &mut out,
        "\n{} Sandbox runtime initialized successfully!\n",
        "✓".green().bold()
    )
    .unwrap();

    match scaffold.config {
        ConfigOutcome::Created => {
            writeln!(
                &mut out,
                "  {} - task graphs and agent settings",
                CONFIG_FILE.cyan()
            )
            .unwrap();
        }
        ConfigOutcome::Overwritten => {
            writeln!(&mut out, "  {} {} (overwritten)", "↻".blue(), CONFIG_FILE).unwrap();
        }
        ConfigOutcome::Kept => {
            writeln!(
                &mut out,
                "  {} {} (already exists, use --force to overwrite)",
                "⊘".yellow(),
                CONFIG_FILE
            )
            .unwrap();
        }
    }
    if let Some(e) = &scaffold.config_error {
        writeln!(&mut out, "    {} does not load: {}", "!".red().bold(), e).unwrap();
    }

    if scaffold.gitignore_created {
        writeln!(
            &mut out,
            "  {} - threads and logs, ignored by git",
            format!("{STATE_DIR}/").cyan()
        )
        .unwrap();
    }

    writeln!(&mut out, "\n{}", "Next steps:".yellow().bold()).unwrap();
    let step = if scaffold.config_error.is_some() {
        format!("Fix {} or rerun with --force", CONFIG_FILE.cyan())
    } else {
        format!("Edit the start and deploy tasks in {}", CONFIG_FILE.cyan())
    };
    writeln!(&mut out, "  1. {step}").unwrap();
    writeln!(
        &mut out,
        "  2. Run {} to bring the sandbox up once",
        "sandbox-runtime run start".green()
    )
    .unwrap();
    writeln!(
        &mut out,
        "  3. Run {} to expose it over HTTP",
        "sandbox-runtime serve".green()
    )
    .unwrap();

    out
}

//! Command execution inside the sandbox.
//!
//! Every piece of sandbox-side work bottoms out in an [`ExecProvider`]: given a
//! command it yields a live stream of [`ExecEvent`]s. The concrete providers
//! (a local process runner and a Docker container) are interchangeable behind
//! the trait; nothing above this module inspects provider-specific ids.

mod docker;
mod error;
mod local;
#[cfg(test)]
pub(crate) mod scripted;

pub(crate) use docker::DockerExec;
pub(crate) use error::ExecError;
pub(crate) use local::LocalExec;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ExecBackend};

/// A boxed, `'static` event stream. Defaults to raw execution events.
pub(crate) type EventStream<T = ExecEvent> = BoxStream<'static, T>;

/// One event in the life of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ExecEvent {
    /// The command was started.
    Start { timestamp: DateTime<Utc> },
    /// A chunk of standard output.
    Stdout {
        data: String,
        timestamp: DateTime<Utc>,
    },
    /// A chunk of standard error.
    Stderr {
        data: String,
        timestamp: DateTime<Utc>,
    },
    /// The command finished successfully.
    Complete { timestamp: DateTime<Utc> },
    /// The command failed or could not be run.
    Error {
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl ExecEvent {
    pub fn start() -> Self {
        Self::Start {
            timestamp: Utc::now(),
        }
    }

    pub fn stdout(data: impl Into<String>) -> Self {
        Self::Stdout {
            data: data.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn stderr(data: impl Into<String>) -> Self {
        Self::Stderr {
            data: data.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn complete() -> Self {
        Self::Complete {
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Start { timestamp }
            | Self::Stdout { timestamp, .. }
            | Self::Stderr { timestamp, .. }
            | Self::Complete { timestamp }
            | Self::Error { timestamp, .. } => *timestamp,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }
}

/// A command to run inside the sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ExecRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

impl ExecRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    /// Splits a shell-style command line into command and arguments.
    pub fn parse(command_line: &str) -> Result<Self, shell_words::ParseError> {
        let mut words = shell_words::split(command_line)?.into_iter();
        let command = words.next().unwrap_or_default();
        Ok(Self::new(command).args(words))
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// The command line as a shell would print it.
    pub fn display(&self) -> String {
        let mut words = Vec::with_capacity(self.args.len() + 1);
        words.push(self.command.as_str());
        words.extend(self.args.iter().map(String::as_str));
        shell_words::join(words)
    }
}

/// Runs commands inside a sandbox and streams their output.
#[async_trait]
pub(crate) trait ExecProvider: Send + Sync {
    /// Returns the provider name for display.
    fn name(&self) -> &'static str;

    /// Starts `request` and returns its event stream.
    ///
    /// Failures after the command started are reported in-stream as
    /// [`ExecEvent::Error`]; `Err` is reserved for commands that never ran.
    async fn execute(
        &self,
        request: ExecRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream, ExecError>;
}

/// Builds the configured exec provider. `backend` overrides `[sandbox].provider`.
pub(crate) fn build_provider(
    config: &Config,
    project_dir: &Path,
    backend: Option<ExecBackend>,
) -> Arc<dyn ExecProvider> {
    match backend.unwrap_or(config.sandbox.provider) {
        ExecBackend::Docker => Arc::new(DockerExec::new(
            config.sandbox.clone(),
            project_dir.to_path_buf(),
        )),
        ExecBackend::Local => Arc::new(
            LocalExec::new(project_dir, config.sandbox.workdir.clone())
                .with_env(config.sandbox.env.clone()),
        ),
    }
}

/// Adapts the receiving half of a producer channel into an [`EventStream`].
pub(crate) fn channel_stream<T: Send + 'static>(rx: mpsc::Receiver<T>) -> EventStream<T> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

/// Collected output of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Set when the command reported an error event.
    pub error: Option<String>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.error.is_none()
    }
}

/// Runs `request` to completion and collects its output.
pub(crate) async fn command_output(
    provider: &dyn ExecProvider,
    request: ExecRequest,
) -> Result<CommandOutput, ExecError> {
    let mut events = provider.execute(request, CancellationToken::new()).await?;
    let mut output = CommandOutput::default();

    while let Some(event) = events.next().await {
        match event {
            ExecEvent::Stdout { data, .. } => output.stdout.push_str(&data),
            ExecEvent::Stderr { data, .. } => output.stderr.push_str(&data),
            ExecEvent::Error { message, .. } => output.error = Some(message),
            ExecEvent::Start { .. } | ExecEvent::Complete { .. } => {}
        }
    }

    Ok(output)
}

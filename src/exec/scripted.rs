//! Scripted exec provider for testing.
//!
//! Returns predetermined event sequences for matching commands and records
//! every invocation for assertions.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{channel_stream, EventStream, ExecError, ExecEvent, ExecProvider, ExecRequest};

/// A single step in a scripted command.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    /// Emit a stdout chunk.
    Stdout(String),
    /// Emit a stderr chunk.
    Stderr(String),
    /// Wait before the next step.
    Sleep(Duration),
    /// Emit an error event and end the stream.
    Fail(String),
    /// Never finish; ends only when cancelled.
    Hang,
}

impl Step {
    pub fn stdout(data: &str) -> Self {
        Self::Stdout(data.to_string())
    }

    pub fn stderr(data: &str) -> Self {
        Self::Stderr(data.to_string())
    }

    pub fn sleep_ms(ms: u64) -> Self {
        Self::Sleep(Duration::from_millis(ms))
    }

    pub fn fail(message: &str) -> Self {
        Self::Fail(message.to_string())
    }
}

#[derive(Debug, Clone)]
enum Script {
    Steps(Vec<Step>),
    Reject(String),
}

/// An exec provider that replays scripts keyed by command-line substrings.
///
/// Commands without a matching script start and complete with no output.
#[derive(Debug, Clone, Default)]
pub(crate) struct ScriptedExec {
    scripts: Arc<Mutex<Vec<(String, Script)>>>,
    calls: Arc<Mutex<Vec<ExecRequest>>>,
}

impl ScriptedExec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts every command whose display form contains `pattern`.
    /// Earlier registrations win.
    #[must_use]
    pub fn on(self, pattern: &str, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .push((pattern.to_string(), Script::Steps(steps)));
        self
    }

    /// Makes `execute` itself fail for matching commands.
    #[must_use]
    pub fn reject(self, pattern: &str, message: &str) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .push((pattern.to_string(), Script::Reject(message.to_string())));
        self
    }

    /// Display forms of every executed command, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(ExecRequest::display)
            .collect()
    }

    /// Full requests, in call order.
    pub fn requests(&self) -> Vec<ExecRequest> {
        self.calls.lock().unwrap().clone()
    }

    fn script_for(&self, line: &str) -> Script {
        self.scripts
            .lock()
            .unwrap()
            .iter()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map_or_else(|| Script::Steps(Vec::new()), |(_, script)| script.clone())
    }
}

#[async_trait]
impl ExecProvider for ScriptedExec {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn execute(
        &self,
        request: ExecRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream, ExecError> {
        let line = request.display();
        self.calls.lock().unwrap().push(request);

        let steps = match self.script_for(&line) {
            Script::Steps(steps) => steps,
            Script::Reject(message) => return Err(ExecError::spawn_failed(line, message)),
        };

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let _ = tx.send(ExecEvent::start()).await;
            for step in steps {
                let event = match step {
                    Step::Stdout(data) => ExecEvent::stdout(data),
                    Step::Stderr(data) => ExecEvent::stderr(data),
                    Step::Sleep(duration) => {
                        tokio::select! {
                            () = tokio::time::sleep(duration) => continue,
                            () = cancel.cancelled() => {
                                let _ = tx.send(ExecEvent::error("cancelled")).await;
                                return;
                            }
                        }
                    }
                    Step::Fail(message) => {
                        let _ = tx.send(ExecEvent::error(message)).await;
                        return;
                    }
                    Step::Hang => {
                        cancel.cancelled().await;
                        let _ = tx.send(ExecEvent::error("cancelled")).await;
                        return;
                    }
                };
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(ExecEvent::complete()).await;
        });

        Ok(channel_stream(rx))
    }
}

//! Host-process exec provider.
//!
//! Runs commands with `tokio::process` in the project directory. The sandbox
//! working directory (`[sandbox].workdir`) is mapped onto the project root so
//! requests are portable between this provider and the Docker one.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{channel_stream, EventStream, ExecError, ExecEvent, ExecProvider, ExecRequest};

/// How long output is still read after the process exits. Background
/// children that inherited the pipes can keep them open indefinitely.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs commands directly on the host.
#[derive(Debug, Clone)]
pub(crate) struct LocalExec {
    root: PathBuf,
    workdir: String,
    env: BTreeMap<String, String>,
}

impl LocalExec {
    pub fn new(root: impl Into<PathBuf>, workdir: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            workdir: workdir.into(),
            env: BTreeMap::new(),
        }
    }

    /// Environment applied to every command before per-request variables.
    #[must_use]
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Maps a sandbox path onto the host.
    fn resolve_cwd(&self, cwd: Option<&str>) -> PathBuf {
        let Some(cwd) = cwd else {
            return self.root.clone();
        };

        if let Some(rest) = cwd.strip_prefix(self.workdir.as_str()) {
            let rest = rest.trim_start_matches('/');
            if rest.is_empty() {
                return self.root.clone();
            }
            if cwd.len() == self.workdir.len() || cwd.as_bytes()[self.workdir.len()] == b'/' {
                return self.root.join(rest);
            }
        }

        let path = Path::new(cwd);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

#[async_trait]
impl ExecProvider for LocalExec {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn execute(
        &self,
        request: ExecRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream, ExecError> {
        if cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }

        let dir = self.resolve_cwd(request.cwd.as_deref());
        debug!("Spawning '{}' in {}", request.display(), dir.display());

        let mut child = tokio::process::Command::new(&request.command)
            .args(&request.args)
            .envs(&self.env)
            .envs(&request.env)
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::spawn_failed(&request.command, e.to_string()))?;

        let (tx, rx) = mpsc::channel(256);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        tokio::spawn(async move {
            let _ = tx.send(ExecEvent::start()).await;

            let out_pump = tokio::spawn(pump(stdout, tx.clone(), ExecEvent::stdout));
            let err_pump = tokio::spawn(pump(stderr, tx.clone(), ExecEvent::stderr));

            let status = tokio::select! {
                status = child.wait() => Some(status),
                () = cancel.cancelled() => {
                    let _ = child.kill().await;
                    None
                }
            };

            // A killed process gets no drain window.
            let drain = if status.is_some() {
                DRAIN_TIMEOUT
            } else {
                Duration::ZERO
            };
            tokio::join!(finish(out_pump, drain), finish(err_pump, drain));

            let last = match status {
                Some(Ok(status)) if status.success() => ExecEvent::complete(),
                Some(Ok(status)) => match status.code() {
                    Some(code) => ExecEvent::error(format!("exited with status {code}")),
                    None => ExecEvent::error("terminated by signal"),
                },
                Some(Err(e)) => ExecEvent::error(format!("failed to wait for process: {e}")),
                None => ExecEvent::error("cancelled"),
            };
            let _ = tx.send(last).await;
        });

        Ok(channel_stream(rx))
    }
}

/// Forwards each line of `reader` as an event until EOF or the receiver is gone.
///
/// Bytes that are not valid UTF-8 are replaced rather than ending the stream.
async fn pump<R>(reader: Option<R>, tx: mpsc::Sender<ExecEvent>, make: fn(String) -> ExecEvent)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };

    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let chunk = String::from_utf8_lossy(&buf).into_owned();
                if tx.send(make(chunk)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Output pipe read failed: {}", e);
                break;
            }
        }
    }
}

/// Waits up to `drain` for a pump to reach EOF, then abandons it.
async fn finish(mut pump: JoinHandle<()>, drain: Duration) {
    if tokio::time::timeout(drain, &mut pump).await.is_err() {
        debug!("Output pipe still open after {:?}; abandoning it", drain);
        pump.abort();
    }
}

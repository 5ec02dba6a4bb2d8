use anyhow::Context;
use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, LogOutput, StartContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{channel_stream, EventStream, ExecError, ExecEvent, ExecProvider, ExecRequest};
use crate::config::{NetworkPolicy, SandboxConfig};

/// Runs commands inside a long-lived Docker container.
///
/// The container is created on first use from `[sandbox].image` with the
/// project mounted at the sandbox workdir, and reused for every later command.
pub struct DockerExec {
    config: SandboxConfig,
    project_dir: PathBuf,
    docker: OnceCell<Docker>,
    container: OnceCell<String>,
}

impl DockerExec {
    pub fn new(config: SandboxConfig, project_dir: PathBuf) -> Self {
        Self {
            config,
            project_dir,
            docker: OnceCell::new(),
            container: OnceCell::new(),
        }
    }

    async fn docker(&self) -> Result<&Docker, ExecError> {
        self.docker
            .get_or_try_init(|| async {
                let docker = Docker::connect_with_local_defaults()
                    .map_err(|e| ExecError::docker_unavailable(e.to_string()))?;
                docker
                    .ping()
                    .await
                    .map_err(|e| ExecError::docker_unavailable(e.to_string()))?;
                Ok(docker)
            })
            .await
    }

    /// Returns the sandbox container name, creating and starting it if needed.
    async fn ensure_container(&self, docker: &Docker) -> Result<&str, ExecError> {
        let name = self
            .container
            .get_or_try_init(|| async {
                let name = self.container_name();

                match docker.inspect_container(&name, None).await {
                    Ok(info) => {
                        let running = info.state.and_then(|s| s.running).unwrap_or(false);
                        if !running {
                            debug!("Starting existing container: {}", name);
                            docker
                                .start_container(&name, None::<StartContainerOptions<String>>)
                                .await
                                .map_err(|e| ExecError::container_failed(e.to_string()))?;
                        }
                    }
                    Err(DockerError::DockerResponseServerError {
                        status_code: 404, ..
                    }) => {
                        info!("Creating sandbox container: {}", name);
                        let config = self
                            .build_container_config()
                            .map_err(|e| ExecError::container_failed(format!("{e:#}")))?;
                        docker
                            .create_container(
                                Some(CreateContainerOptions {
                                    name: name.clone(),
                                    platform: None,
                                }),
                                config,
                            )
                            .await
                            .map_err(|e| ExecError::container_failed(e.to_string()))?;
                        docker
                            .start_container(&name, None::<StartContainerOptions<String>>)
                            .await
                            .map_err(|e| ExecError::container_failed(e.to_string()))?;
                    }
                    Err(e) => return Err(ExecError::container_failed(e.to_string())),
                }

                Ok(name)
            })
            .await?;

        Ok(name.as_str())
    }

    fn container_name(&self) -> String {
        self.config.container_name.clone().unwrap_or_else(|| {
            let id = uuid::Uuid::new_v4().simple().to_string();
            format!("sandbox-{}", &id[..8])
        })
    }

    fn build_container_config(&self) -> anyhow::Result<ContainerConfig<String>> {
        let sandbox = &self.config;

        let mut binds = vec![
            // Mount project read-write at the sandbox workdir
            format!(
                "{}:{}:rw",
                self.project_dir.to_str().context("Invalid project path")?,
                sandbox.workdir
            ),
        ];

        for mount in &sandbox.mounts {
            let host_path = expand_path(&mount.host)?;
            let mode = if mount.readonly { "ro" } else { "rw" };
            binds.push(format!("{}:{}:{}", host_path, mount.container, mode));
        }

        let memory = parse_memory_limit(&sandbox.resources.memory)?;
        let cpus = sandbox.resources.cpus.parse::<f64>().unwrap_or(4.0);

        let env = sandbox
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>();

        #[allow(clippy::cast_possible_truncation)]
        let mut config = ContainerConfig {
            image: Some(sandbox.image.clone()),
            working_dir: Some(sandbox.workdir.clone()),
            // Keep the container alive between execs
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            env: Some(env),
            host_config: Some(bollard::service::HostConfig {
                binds: Some(binds),
                memory: Some(memory),
                nano_cpus: Some((cpus * 1_000_000_000.0) as i64),
                dns: Some(sandbox.network.dns.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };

        match sandbox.network.policy {
            NetworkPolicy::Deny => {
                if let Some(ref mut host_config) = config.host_config {
                    host_config.network_mode = Some("none".to_string());
                }
            }
            NetworkPolicy::AllowAll => {}
        }

        Ok(config)
    }
}

#[async_trait]
impl ExecProvider for DockerExec {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn execute(
        &self,
        request: ExecRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream, ExecError> {
        if cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }

        let docker = self.docker().await?.clone();
        let container = self.ensure_container(&docker).await?.to_string();

        let mut cmd = vec![request.command.clone()];
        cmd.extend(request.args.iter().cloned());
        let env = request
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>();

        debug!("Exec in {}: {}", container, request.display());
        let exec = docker
            .create_exec(
                &container,
                CreateExecOptions {
                    cmd: Some(cmd),
                    env: Some(env),
                    working_dir: Some(
                        request
                            .cwd
                            .clone()
                            .unwrap_or_else(|| self.config.workdir.clone()),
                    ),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| ExecError::container_failed(e.to_string()))?;

        let (tx, rx) = mpsc::channel(256);

        tokio::spawn(async move {
            let _ = tx.send(ExecEvent::start()).await;

            let failure = match docker.start_exec(&exec.id, None).await {
                Ok(StartExecResults::Attached { mut output, .. }) => loop {
                    let chunk = tokio::select! {
                        biased;
                        () = cancel.cancelled() => break Some(ExecEvent::error("cancelled")),
                        chunk = output.next() => chunk,
                    };
                    let event = match chunk {
                        Some(Ok(LogOutput::StdOut { message })) => {
                            ExecEvent::stdout(String::from_utf8_lossy(&message))
                        }
                        Some(Ok(LogOutput::StdErr { message })) => {
                            ExecEvent::stderr(String::from_utf8_lossy(&message))
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => break Some(ExecEvent::error(e.to_string())),
                        None => break None,
                    };
                    if tx.send(event).await.is_err() {
                        break None;
                    }
                },
                Ok(StartExecResults::Detached) => None,
                Err(e) => Some(ExecEvent::error(format!("Failed to start exec: {e}"))),
            };

            let last = match failure {
                Some(event) => event,
                None => exit_event(&docker, &exec.id).await,
            };
            let _ = tx.send(last).await;
        });

        Ok(channel_stream(rx))
    }
}

/// Turns the exec's exit code into the terminal event.
async fn exit_event(docker: &Docker, exec_id: &str) -> ExecEvent {
    match docker.inspect_exec(exec_id).await {
        Ok(inspect) => match inspect.exit_code {
            Some(0) | None => ExecEvent::complete(),
            Some(code) => ExecEvent::error(format!("exited with status {code}")),
        },
        Err(e) => {
            warn!("Failed to inspect exec {}: {}", exec_id, e);
            ExecEvent::error(format!("Failed to inspect exec: {e}"))
        }
    }
}

/// Expand ~ to home directory
fn expand_path(path: &str) -> anyhow::Result<String> {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(Path::new(&home).join(rest).display().to_string())
    } else {
        Ok(path.to_string())
    }
}

/// Parse memory limit string (e.g., "8g", "512m") to bytes
fn parse_memory_limit(limit: &str) -> anyhow::Result<i64> {
    let limit = limit.to_lowercase();

    if let Some(num) = limit.strip_suffix('g') {
        let gigs: i64 = num.parse().context("Invalid memory limit")?;
        Ok(gigs * 1024 * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('m') {
        let megs: i64 = num.parse().context("Invalid memory limit")?;
        Ok(megs * 1024 * 1024)
    } else {
        limit.parse().context("Invalid memory limit")
    }
}

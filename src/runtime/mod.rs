//! The sandbox runtime: one per logical sandbox.
//!
//! [`SandboxRuntime`] owns the exec provider and one [`Supervisor`], and
//! exposes the operations callers use: bringing the sandbox up (`start`),
//! running the deploy graph, running the agent, git helpers, and attaching
//! listeners to the live run of each kind.
//!
//! Run state per kind: idle, then active, then completed, failed,
//! superseded or user-cancelled, after which a new run may be admitted.

mod checkpoint;
mod error;
mod events;
mod git;
mod handle;
mod supervisor;

pub(crate) use error::RuntimeError;
pub(crate) use events::{RunEvent, RunKind, RunStatus};
pub(crate) use handle::Handle;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{AgentInvocation, AgentProvider};
use crate::config::{Config, GitConfig, TaskConfig};
use crate::exec::{channel_stream, EventStream, ExecProvider};
use crate::graph::{tasks_from_config, GraphExecutor, TaskGraph};
use crate::thread::{Role, ThreadMessage, ThreadStore};
use checkpoint::{resolve_checkpoint, CheckpointTarget};
use git::Git;
use supervisor::{Admission, Supervisor};

/// Everything `init` supplies.
#[derive(Debug, Clone, Default)]
pub(crate) struct Profile {
    pub workdir: String,
    pub start: Vec<TaskConfig>,
    pub deploy: Vec<TaskConfig>,
    pub git: GitConfig,
}

impl Profile {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workdir: config.sandbox.workdir.clone(),
            start: config.start.tasks.clone(),
            deploy: config.deploy.tasks.clone(),
            git: config.git.clone(),
        }
    }
}

/// Body of an agent request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AgentRequest {
    pub messages: Vec<ThreadMessage>,
    pub thread_id: String,
    #[serde(default)]
    pub branch_id: Option<String>,
}

#[derive(Clone)]
pub(crate) struct SandboxRuntime {
    inner: Arc<Inner>,
}

struct Inner {
    exec: Arc<dyn ExecProvider>,
    agent: Arc<dyn AgentProvider>,
    threads: Arc<dyn ThreadStore>,
    supervisor: Supervisor,
    profile: RwLock<Option<Arc<Profile>>>,
}

impl SandboxRuntime {
    /// `max_buffered_events` caps each run's replay buffer (0 = unbounded).
    pub fn new(
        exec: Arc<dyn ExecProvider>,
        agent: Arc<dyn AgentProvider>,
        threads: Arc<dyn ThreadStore>,
        max_buffered_events: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                exec,
                agent,
                threads,
                supervisor: Supervisor::new(max_buffered_events),
                profile: RwLock::new(None),
            }),
        }
    }

    /// Installs the sandbox configuration. Later calls replace it.
    pub fn init(&self, profile: Profile) {
        info!(
            "Runtime initialized ({} start task(s), {} deploy task(s), exec: {})",
            profile.start.len(),
            profile.deploy.len(),
            self.inner.exec.name()
        );
        *self
            .inner
            .profile
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(profile));
    }

    fn profile(&self) -> Result<Arc<Profile>, RuntimeError> {
        self.inner
            .profile
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(RuntimeError::NotInitialized)
    }

    fn git(&self) -> Result<Git, RuntimeError> {
        let profile = self.profile()?;
        Ok(Git::new(
            Arc::clone(&self.inner.exec),
            profile.workdir.clone(),
            profile.git.clone(),
        ))
    }

    fn graph(&self, tasks: &[TaskConfig], workdir: &str) -> Result<TaskGraph, RuntimeError> {
        let tasks = tasks_from_config(tasks, workdir).map_err(RuntimeError::InvalidTask)?;
        Ok(TaskGraph::build(tasks)?)
    }

    // -------------------------------------------------------------------------
    // Runs
    // -------------------------------------------------------------------------

    /// Brings the sandbox up by running the start graph.
    ///
    /// An active or completed start run is returned as is; a failed or
    /// cancelled one is replaced by a fresh run.
    pub async fn start(&self) -> Result<Arc<Handle>, RuntimeError> {
        let profile = self.profile()?;
        let graph = self.graph(&profile.start, &profile.workdir)?;
        let executor = GraphExecutor::new(Arc::clone(&self.inner.exec));

        Ok(self
            .inner
            .supervisor
            .start_run(RunKind::Start, Admission::Reuse, |cancel| {
                executor.run(graph, cancel).map(RunEvent::from).boxed()
            })
            .await)
    }

    /// Starts the sandbox if needed and waits for the start run to complete.
    pub async fn wait_until_started(&self) -> Result<(), RuntimeError> {
        let handle = self.start().await?;
        match handle.wait().await {
            RunStatus::Completed => Ok(()),
            status => Err(RuntimeError::StartFailed { status }),
        }
    }

    /// Runs the deploy graph, superseding any deploy in progress.
    pub async fn deploy(&self) -> Result<Arc<Handle>, RuntimeError> {
        let profile = self.profile()?;
        let graph = self.graph(&profile.deploy, &profile.workdir)?;
        let executor = GraphExecutor::new(Arc::clone(&self.inner.exec));

        Ok(self
            .inner
            .supervisor
            .start_run(RunKind::Deploy, Admission::Supersede, |cancel| {
                executor.run(graph, cancel).map(RunEvent::from).boxed()
            })
            .await)
    }

    /// Runs the agent on a thread, superseding any agent run in progress.
    ///
    /// The run first restores the thread's checkpoint, announces it, then
    /// streams the agent's output.
    pub async fn start_agent(&self, request: AgentRequest) -> Result<Arc<Handle>, RuntimeError> {
        let profile = self.profile()?;
        let runtime = self.clone();

        Ok(self
            .inner
            .supervisor
            .start_run(RunKind::Agent, Admission::Supersede, move |cancel| {
                runtime.agent_events(request, profile, cancel)
            })
            .await)
    }

    fn agent_events(
        self,
        request: AgentRequest,
        profile: Arc<Profile>,
        cancel: CancellationToken,
    ) -> EventStream<RunEvent> {
        let (tx, rx) = mpsc::channel(256);

        tokio::spawn(async move {
            let thread_id = request.thread_id.clone();
            tokio::select! {
                biased;
                () = cancel.cancelled() => debug!("Agent run for thread {} cancelled", thread_id),
                () = self.drive_agent(request, &profile, cancel.clone(), &tx) => {}
            }
        });

        channel_stream(rx)
    }

    async fn drive_agent(
        &self,
        mut request: AgentRequest,
        profile: &Profile,
        cancel: CancellationToken,
        tx: &mpsc::Sender<RunEvent>,
    ) {
        let checkpoint = match resolve_checkpoint(
            &mut request.messages,
            &request.thread_id,
            self.inner.threads.as_ref(),
            self,
        )
        .await
        {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                warn!("Checkpoint for thread {} failed: {}", request.thread_id, e);
                let _ = tx
                    .send(RunEvent::error(format!("Could not restore checkpoint: {e}")))
                    .await;
                return;
            }
        };
        if tx.send(RunEvent::Checkpoint { checkpoint }).await.is_err() {
            return;
        }

        let prompt = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(ThreadMessage::text)
            .unwrap_or_default();
        let invocation = AgentInvocation {
            prompt,
            thread_id: request.thread_id,
            branch_id: request.branch_id,
            workdir: profile.workdir.clone(),
        };

        let mut events = match self
            .inner
            .agent
            .run(invocation, Arc::clone(&self.inner.exec), cancel)
            .await
        {
            Ok(events) => events,
            Err(e) => {
                warn!("{} agent failed to start: {:#}", self.inner.agent.name(), e);
                let _ = tx.send(RunEvent::error(format!("{e:#}"))).await;
                return;
            }
        };

        while let Some(event) = events.next().await {
            if tx.send(RunEvent::Agent { event }).await.is_err() {
                return;
            }
        }
    }

    /// Stops the agent run, telling its listeners why. Returns false if no
    /// agent was running.
    pub async fn stop_agent(&self) -> bool {
        self.inner
            .supervisor
            .stop_run(
                RunKind::Agent,
                Some(RunEvent::abort_requested("user requested")),
            )
            .await
    }

    pub async fn is_agent_running(&self) -> bool {
        self.inner.supervisor.active(RunKind::Agent).await.is_some()
    }

    /// Attaches a listener to the active run of `kind`.
    ///
    /// `None` means there is no active run to listen to.
    pub async fn listen_to(&self, kind: RunKind) -> Option<EventStream<RunEvent>> {
        self.inner
            .supervisor
            .active(kind)
            .await
            .and_then(|handle| handle.subscribe())
    }

    pub async fn listen_to_start(&self) -> Option<EventStream<RunEvent>> {
        self.listen_to(RunKind::Start).await
    }

    pub async fn listen_to_deploy(&self) -> Option<EventStream<RunEvent>> {
        self.listen_to(RunKind::Deploy).await
    }

    pub async fn listen_to_agent(&self) -> Option<EventStream<RunEvent>> {
        self.listen_to(RunKind::Agent).await
    }

    // -------------------------------------------------------------------------
    // Git
    // -------------------------------------------------------------------------

    /// Commits everything in the working tree. Returns the new sha.
    pub async fn git_commit(&self, title: &str, body: &str) -> Result<String, RuntimeError> {
        self.git()?.commit(title, body).await
    }

    /// Hard-resets to `sha` once the sandbox has started.
    pub async fn git_reset(&self, sha: &str) -> Result<(), RuntimeError> {
        let git = self.git()?;
        self.wait_until_started().await?;
        git.reset_hard(sha).await
    }

    /// The current commit, once the sandbox has started.
    pub async fn git_current_commit(&self) -> Result<String, RuntimeError> {
        let git = self.git()?;
        self.wait_until_started().await?;
        git.head().await
    }

    pub async fn git_push(&self) -> Result<(), RuntimeError> {
        self.git()?.push().await
    }
}

#[async_trait]
impl CheckpointTarget for SandboxRuntime {
    async fn git_reset(&self, sha: &str) -> Result<(), RuntimeError> {
        SandboxRuntime::git_reset(self, sha).await
    }

    async fn git_current_commit(&self) -> Result<String, RuntimeError> {
        SandboxRuntime::git_current_commit(self).await
    }

    fn commit_url(&self, sha: &str) -> Option<String> {
        self.git().ok()?.commit_url(sha)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::mock::{MockAgentProvider, MockResponse};
    use crate::exec::scripted::{ScriptedExec, Step};
    use crate::exec::ExecEvent;
    use crate::graph::GraphError;
    use crate::thread::MemoryThreadStore;
    use std::time::Duration;

    struct Fixture {
        runtime: SandboxRuntime,
        exec: ScriptedExec,
        agent: MockAgentProvider,
        threads: Arc<MemoryThreadStore>,
    }

    fn fixture(exec: ScriptedExec, agent: MockAgentProvider) -> Fixture {
        let threads = Arc::new(MemoryThreadStore::default());
        let runtime = SandboxRuntime::new(
            Arc::new(exec.clone()),
            Arc::new(agent.clone()),
            Arc::clone(&threads) as Arc<dyn ThreadStore>,
            0,
        );
        Fixture {
            runtime,
            exec,
            agent,
            threads,
        }
    }

    fn task(id: &str, command: &str, depends_on: &[&str]) -> TaskConfig {
        TaskConfig {
            id: id.to_string(),
            title: None,
            depends_on: depends_on.iter().map(ToString::to_string).collect(),
            command: command.to_string(),
            ready: None,
        }
    }

    fn profile(start: Vec<TaskConfig>, deploy: Vec<TaskConfig>) -> Profile {
        Profile {
            workdir: "/workspace".to_string(),
            start,
            deploy,
            git: GitConfig::default(),
        }
    }

    fn agent_request(thread_id: &str) -> AgentRequest {
        AgentRequest {
            messages: vec![
                ThreadMessage::new("root", Role::System).with_text("You build web apps"),
                ThreadMessage::new("u1", Role::User).with_text("Add a login page"),
            ],
            thread_id: thread_id.to_string(),
            branch_id: None,
        }
    }

    async fn collect(stream: EventStream<RunEvent>) -> Vec<RunEvent> {
        tokio::time::timeout(Duration::from_secs(5), stream.collect())
            .await
            .expect("stream should end")
    }

    fn index_of(calls: &[String], needle: &str) -> usize {
        calls
            .iter()
            .position(|c| c.contains(needle))
            .unwrap_or_else(|| panic!("no call containing '{needle}' in {calls:?}"))
    }

    #[tokio::test]
    async fn test_operations_require_init() {
        let f = fixture(ScriptedExec::new(), MockAgentProvider::always_succeed("ok"));

        assert!(matches!(f.runtime.start().await, Err(RuntimeError::NotInitialized)));
        assert!(matches!(f.runtime.deploy().await, Err(RuntimeError::NotInitialized)));
        assert!(matches!(
            f.runtime.start_agent(agent_request("t1")).await,
            Err(RuntimeError::NotInitialized)
        ));
        assert!(matches!(
            f.runtime.git_commit("x", "").await,
            Err(RuntimeError::NotInitialized)
        ));
        assert!(f.exec.calls().is_empty());
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let f = fixture(ScriptedExec::new(), MockAgentProvider::always_succeed("ok"));
        f.runtime.init(profile(vec![task("install", "npm install", &[])], vec![]));

        let first = f.runtime.start().await.unwrap();
        f.runtime.wait_until_started().await.unwrap();
        let second = f.runtime.start().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(f.exec.calls(), vec!["npm install"]);
        assert!(f.runtime.listen_to_start().await.is_none());
    }

    #[tokio::test]
    async fn test_failed_start_reports_and_retries() {
        let exec = ScriptedExec::new().on("npm install", vec![Step::fail("exited with status 1")]);
        let f = fixture(exec, MockAgentProvider::always_succeed("ok"));
        f.runtime.init(profile(vec![task("install", "npm install", &[])], vec![]));

        let err = f.runtime.wait_until_started().await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::StartFailed {
                status: RunStatus::Failed
            }
        ));

        let _ = f.runtime.wait_until_started().await;
        assert_eq!(f.exec.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_deploy_graph_is_rejected() {
        let f = fixture(ScriptedExec::new(), MockAgentProvider::always_succeed("ok"));
        f.runtime.init(profile(
            vec![],
            vec![
                task("build", "npm run build", &["upload"]),
                task("upload", "rsync dist/", &["build"]),
            ],
        ));

        let err = f.runtime.deploy().await.unwrap_err();
        assert!(matches!(err, RuntimeError::Graph(GraphError::CyclicDependency(_))));
        assert!(f.runtime.listen_to_deploy().await.is_none());
        assert!(f.exec.calls().is_empty());
    }

    #[tokio::test]
    async fn test_deploy_supersedes_previous_deploy() {
        let exec = ScriptedExec::new().on(
            "npm run build",
            vec![Step::stdout("building\n"), Step::Hang],
        );
        let f = fixture(exec, MockAgentProvider::always_succeed("ok"));
        f.runtime.init(profile(vec![], vec![task("build", "npm run build", &[])]));

        let first = f.runtime.deploy().await.unwrap();
        let listener = f.runtime.listen_to_deploy().await.unwrap();
        while first.buffered().len() < 2 {
            tokio::task::yield_now().await;
        }

        let second = f.runtime.deploy().await.unwrap();

        let received = collect(listener).await;
        assert_eq!(received.last(), Some(&RunEvent::Superseded));
        assert!(received.iter().all(|e| !e.is_error()));
        assert_eq!(first.wait().await, RunStatus::Superseded);
        assert!(second.is_active());
    }

    #[tokio::test]
    async fn test_agent_run_restores_checkpoint_first() {
        let exec = ScriptedExec::new()
            .on("npm install", vec![Step::sleep_ms(20)])
            .on("rev-parse HEAD", vec![Step::stdout("c0ffee\n")]);
        let f = fixture(exec, MockAgentProvider::always_succeed("Added login page"));
        f.runtime.init(profile(vec![task("install", "npm install", &[])], vec![]));

        let handle = f.runtime.start_agent(agent_request("t1")).await.unwrap();
        let listener = handle.subscribe().unwrap();
        let received = collect(listener).await;

        match &received[0] {
            RunEvent::Checkpoint { checkpoint } => assert_eq!(checkpoint.sha, "c0ffee"),
            other => panic!("expected checkpoint first, got {other:?}"),
        }
        assert!(matches!(
            received.last(),
            Some(RunEvent::Agent { event: ExecEvent::Complete { .. } })
        ));
        assert_eq!(handle.wait().await, RunStatus::Completed);

        let calls = f.exec.calls();
        assert!(index_of(&calls, "npm install") < index_of(&calls, "rev-parse HEAD"));
        assert_eq!(f.threads.save_count(), 1);
        assert_eq!(f.agent.invocations()[0].prompt, "Add a login page");
    }

    #[tokio::test]
    async fn test_agent_run_resets_to_recorded_commit() {
        let f = fixture(ScriptedExec::new(), MockAgentProvider::always_succeed("ok"));
        f.runtime.init(profile(vec![], vec![]));

        let mut request = agent_request("t1");
        request.messages[1] = request.messages[1]
            .clone()
            .with_commit(crate::thread::Checkpoint {
                sha: "abc123".to_string(),
                title: "Login page".to_string(),
                description: String::new(),
                url: None,
            });

        let handle = f.runtime.start_agent(request).await.unwrap();
        assert_eq!(handle.wait().await, RunStatus::Completed);

        assert!(f
            .exec
            .calls()
            .iter()
            .any(|c| c.ends_with("reset --hard abc123")));
        assert_eq!(f.threads.save_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_agent_sends_abort_then_ends() {
        let f = fixture(ScriptedExec::new(), MockAgentProvider::always_hang());
        f.runtime.init(profile(vec![], vec![]));

        let handle = f.runtime.start_agent(agent_request("t1")).await.unwrap();
        let listener = f.runtime.listen_to_agent().await.unwrap();
        while !handle
            .buffered()
            .iter()
            .any(|e| matches!(e, RunEvent::Agent { .. }))
        {
            tokio::task::yield_now().await;
        }
        assert!(f.runtime.is_agent_running().await);

        assert!(f.runtime.stop_agent().await);
        assert!(!f.runtime.is_agent_running().await);

        let received = collect(listener).await;
        assert_eq!(
            received.last(),
            Some(&RunEvent::abort_requested("user requested"))
        );
        assert_eq!(handle.wait().await, RunStatus::UserCancelled);
        assert!(f.runtime.listen_to_agent().await.is_none());
        assert!(!f.runtime.stop_agent().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_agent_starts_leave_one_active() {
        let f = fixture(ScriptedExec::new(), MockAgentProvider::always_hang());
        f.runtime.init(profile(vec![], vec![]));

        let (a, b) = tokio::join!(
            f.runtime.start_agent(agent_request("t1")),
            f.runtime.start_agent(agent_request("t1"))
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!([a.is_active(), b.is_active()].iter().filter(|x| **x).count(), 1);
        let loser = if a.is_active() { &b } else { &a };
        assert_eq!(loser.wait().await, RunStatus::Superseded);
        assert!(f.runtime.is_agent_running().await);
    }

    #[tokio::test]
    async fn test_agent_start_failure_is_an_error_event() {
        let f = fixture(
            ScriptedExec::new(),
            MockAgentProvider::new(vec![MockResponse::Error("claude: not found".to_string())]),
        );
        f.runtime.init(profile(vec![], vec![]));

        let handle = f.runtime.start_agent(agent_request("t1")).await.unwrap();

        assert_eq!(handle.wait().await, RunStatus::Failed);
        assert!(handle
            .buffered()
            .iter()
            .any(|e| matches!(e, RunEvent::Error { message, .. } if message.contains("not found"))));
    }

    #[tokio::test]
    async fn test_git_reset_waits_for_start() {
        let exec = ScriptedExec::new().on("npm install", vec![Step::sleep_ms(30)]);
        let f = fixture(exec, MockAgentProvider::always_succeed("ok"));
        f.runtime.init(profile(vec![task("install", "npm install", &[])], vec![]));

        f.runtime.git_reset("abc123").await.unwrap();

        let calls = f.exec.calls();
        assert!(index_of(&calls, "npm install") < index_of(&calls, "reset --hard abc123"));
    }

    #[tokio::test]
    async fn test_commit_url_uses_profile() {
        let f = fixture(ScriptedExec::new(), MockAgentProvider::always_succeed("ok"));
        assert!(f.runtime.commit_url("abc").is_none());

        let mut p = profile(vec![], vec![]);
        p.git.commit_url = Some("https://example.com/{sha}".to_string());
        f.runtime.init(p);
        assert_eq!(
            f.runtime.commit_url("abc").as_deref(),
            Some("https://example.com/abc")
        );
    }

    #[test]
    fn test_agent_request_uses_camel_case() {
        let json = r#"{
            "messages": [{"id": "u1", "role": "user", "parts": [{"type": "text", "text": "hi"}]}],
            "threadId": "t1",
            "branchId": "b1"
        }"#;
        let request: AgentRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.thread_id, "t1");
        assert_eq!(request.branch_id.as_deref(), Some("b1"));
        assert_eq!(request.messages[0].text(), "hi");
    }
}

//! Git helper commands run inside the sandbox.
//!
//! Every command goes through the exec provider, so these work the same for
//! a local checkout and a container.

use std::sync::Arc;
use tracing::{debug, info};

use super::error::RuntimeError;
use crate::config::GitConfig;
use crate::exec::{command_output, ExecProvider, ExecRequest};

#[derive(Clone)]
pub(crate) struct Git {
    exec: Arc<dyn ExecProvider>,
    workdir: String,
    config: GitConfig,
}

impl Git {
    pub fn new(exec: Arc<dyn ExecProvider>, workdir: impl Into<String>, config: GitConfig) -> Self {
        Self {
            exec,
            workdir: workdir.into(),
            config,
        }
    }

    /// Runs `git <args>` and returns trimmed stdout.
    async fn run(&self, args: &[&str]) -> Result<String, RuntimeError> {
        let label = args.first().copied().unwrap_or_default();
        let request = ExecRequest::new("git")
            .args([
                "-c".to_string(),
                format!("user.name={}", self.config.author_name),
                "-c".to_string(),
                format!("user.email={}", self.config.author_email),
            ])
            .args(args.iter().copied())
            .cwd(&self.workdir);
        debug!("git {}", args.join(" "));

        let output = command_output(self.exec.as_ref(), request)
            .await
            .map_err(|e| RuntimeError::git(label, e.to_string()))?;

        match output.error {
            None => Ok(output.stdout.trim().to_string()),
            Some(error) => {
                let stderr = output.stderr.trim();
                let message = if stderr.is_empty() { error } else { stderr.to_string() };
                Err(RuntimeError::git(label, message))
            }
        }
    }

    /// Stages everything and commits. Returns the new commit sha.
    pub async fn commit(&self, title: &str, body: &str) -> Result<String, RuntimeError> {
        self.run(&["add", "-A"]).await?;

        let mut args = vec!["commit", "--allow-empty", "-m", title];
        if !body.trim().is_empty() {
            args.extend(["-m", body]);
        }
        self.run(&args).await?;

        let sha = self.head().await?;
        info!("Committed {}: {}", sha, title);
        Ok(sha)
    }

    /// Hard-resets the working tree to `sha`.
    pub async fn reset_hard(&self, sha: &str) -> Result<(), RuntimeError> {
        self.run(&["reset", "--hard", sha]).await?;
        info!("Reset working tree to {}", sha);
        Ok(())
    }

    /// The current commit sha.
    pub async fn head(&self) -> Result<String, RuntimeError> {
        self.run(&["rev-parse", "HEAD"]).await
    }

    pub async fn current_branch(&self) -> Result<String, RuntimeError> {
        self.run(&["branch", "--show-current"]).await
    }

    /// Pushes the current branch, creating the upstream if needed.
    ///
    /// Refuses to push protected branches and detached heads.
    pub async fn push(&self) -> Result<(), RuntimeError> {
        let branch = self.current_branch().await?;
        if branch.is_empty() {
            return Err(RuntimeError::git("push", "HEAD is detached"));
        }
        if self.config.is_protected_branch(&branch) {
            return Err(RuntimeError::git(
                "push",
                format!(
                    "Refusing to push to protected branch '{branch}'. \
                     Remove it from git.protected_branches in sandbox.toml to allow pushing."
                ),
            ));
        }

        if let Err(e) = self.run(&["push"]).await {
            debug!("Plain push failed ({}); setting upstream", e);
            self.run(&["push", "-u", self.config.remote.as_str(), branch.as_str()])
                .await?;
        }

        info!("Pushed {}", branch);
        Ok(())
    }

    /// Link to `sha` on the code host, if configured.
    pub fn commit_url(&self, sha: &str) -> Option<String> {
        self.config.commit_url_for(sha)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::scripted::{ScriptedExec, Step};

    fn git(exec: &ScriptedExec) -> Git {
        Git::new(
            Arc::new(exec.clone()),
            "/workspace",
            GitConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_commit_returns_new_head() {
        let exec = ScriptedExec::new().on("rev-parse HEAD", vec![Step::stdout("abc123\n")]);

        let sha = git(&exec).commit("Add login", "With tests").await.unwrap();

        assert_eq!(sha, "abc123");
        let calls = exec.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[0].ends_with("add -A"));
        assert!(calls[1].ends_with("commit --allow-empty -m 'Add login' -m 'With tests'"));
        assert!(calls[0].contains("agent@sandbox.local"));
        assert_eq!(exec.requests()[0].cwd.as_deref(), Some("/workspace"));
    }

    #[tokio::test]
    async fn test_failed_command_reports_stderr() {
        let exec = ScriptedExec::new().on(
            "reset --hard",
            vec![
                Step::stderr("fatal: ambiguous argument 'nope'\n"),
                Step::fail("exited with status 128"),
            ],
        );

        let err = git(&exec).reset_hard("nope").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "git reset failed: fatal: ambiguous argument 'nope'"
        );
    }

    #[tokio::test]
    async fn test_push_refuses_protected_branch() {
        let exec = ScriptedExec::new().on("branch --show-current", vec![Step::stdout("main\n")]);

        let err = git(&exec).push().await.unwrap_err();

        assert!(err.to_string().contains("protected branch 'main'"));
        assert!(!exec.calls().iter().any(|c| c.ends_with("push")));
    }

    #[tokio::test]
    async fn test_push_refuses_detached_head() {
        let exec = ScriptedExec::new();
        let err = git(&exec).push().await.unwrap_err();
        assert!(err.to_string().contains("detached"));
    }

    #[tokio::test]
    async fn test_push_sets_upstream_when_plain_push_fails() {
        let exec = ScriptedExec::new()
            .on("branch --show-current", vec![Step::stdout("feature/login\n")])
            .on("push -u", vec![])
            .on("push", vec![Step::fail("no upstream branch")]);

        git(&exec).push().await.unwrap();

        let calls = exec.calls();
        assert!(calls.last().unwrap().ends_with("push -u origin feature/login"));
    }

    #[test]
    fn test_commit_url() {
        let exec = ScriptedExec::new();
        let config = GitConfig {
            commit_url: Some("https://github.com/acme/app/commit/{sha}".to_string()),
            ..Default::default()
        };
        let git = Git::new(Arc::new(exec), "/workspace", config);
        assert_eq!(
            git.commit_url("abc").as_deref(),
            Some("https://github.com/acme/app/commit/abc")
        );
    }
}

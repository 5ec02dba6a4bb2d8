//! Claude Code agent provider
//!
//! Invokes the Claude CLI in print mode:
//! ```bash
//! claude -p "prompt" --dangerously-skip-permissions --model opus --output-format stream-json
//! ```
//!
//! See: https://docs.anthropic.com/en/docs/claude-code

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{AgentInvocation, AgentProvider};
use crate::config::ClaudeConfig;
use crate::exec::{EventStream, ExecProvider, ExecRequest};

/// Claude Code CLI agent provider
pub struct ClaudeProvider {
    config: ClaudeConfig,
}

impl ClaudeProvider {
    pub fn new(config: ClaudeConfig) -> Self {
        Self { config }
    }

    /// claude -p <prompt> [--dangerously-skip-permissions] [--model m] --output-format f [--verbose]
    fn request(&self, prompt: &str) -> ExecRequest {
        let mut args = vec!["-p".to_string(), prompt.to_string()];

        // Required for autonomous operation
        if self.config.skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        }

        if let Some(ref model) = self.config.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        args.push("--output-format".to_string());
        args.push(self.config.output_format.clone());

        if self.config.verbose {
            args.push("--verbose".to_string());
        }

        ExecRequest::new(&self.config.path).args(args)
    }
}

#[async_trait]
impl AgentProvider for ClaudeProvider {
    fn name(&self) -> &'static str {
        "Claude"
    }

    async fn run(
        &self,
        invocation: AgentInvocation,
        exec: Arc<dyn ExecProvider>,
        cancel: CancellationToken,
    ) -> Result<EventStream> {
        let claude_path = &self.config.path;
        info!("Running Claude agent for thread {}", invocation.thread_id);

        let request = invocation.prepare(self.request(&invocation.prompt));
        debug!("Claude args: {:?}", &request.args[2..]);

        exec.execute(request, cancel).await.with_context(|| {
            format!(
                "Failed to run Claude agent '{claude_path}'.\n\
                 \n\
                 Make sure Claude Code CLI is installed in the sandbox:\n\
                 - Install: npm install -g @anthropic-ai/claude-code\n\
                 \n\
                 Configure the path in sandbox.toml:\n\
                 [agent.claude]\n\
                 path = \"claude\"  # Default\n\
                 path = \"/full/path/to/claude\"  # Custom path"
            )
        })
    }
}

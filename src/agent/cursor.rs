//! Cursor agent provider
//!
//! Invokes the Cursor CLI agent in print mode:
//! ```bash
//! agent -p "prompt" --output-format text
//! ```
//!
//! See: https://cursor.com/docs/cli/overview

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{AgentInvocation, AgentProvider};
use crate::config::CursorConfig;
use crate::exec::{EventStream, ExecProvider, ExecRequest};

/// Cursor CLI agent provider
pub struct CursorProvider {
    config: CursorConfig,
}

impl CursorProvider {
    pub fn new(config: CursorConfig) -> Self {
        Self { config }
    }

    /// agent -p <prompt> [--model m] --output-format f
    fn request(&self, prompt: &str) -> ExecRequest {
        let mut args = vec!["-p".to_string(), prompt.to_string()];

        if let Some(ref model) = self.config.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        args.push("--output-format".to_string());
        args.push(self.config.output_format.clone());

        ExecRequest::new(&self.config.path).args(args)
    }
}

#[async_trait]
impl AgentProvider for CursorProvider {
    fn name(&self) -> &'static str {
        "Cursor"
    }

    async fn run(
        &self,
        invocation: AgentInvocation,
        exec: Arc<dyn ExecProvider>,
        cancel: CancellationToken,
    ) -> Result<EventStream> {
        let agent_path = &self.config.path;
        info!("Running Cursor agent for thread {}", invocation.thread_id);

        let request = invocation.prepare(self.request(&invocation.prompt));
        debug!("Agent args: {:?}", &request.args[2..]);

        exec.execute(request, cancel).await.with_context(|| {
            format!(
                "Failed to run Cursor agent '{agent_path}'.\n\
                 \n\
                 Make sure the Cursor CLI is installed in the sandbox:\n\
                 - Install: curl https://cursor.com/install -fsS | bash\n\
                 - Or specify a full path: [agent.cursor].path = \"/path/to/agent\"\n\
                 \n\
                 See: https://cursor.com/docs/cli/overview"
            )
        })
    }
}

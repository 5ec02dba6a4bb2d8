//! Agent providers for different AI CLI tools
//!
//! The agent runs inside the sandbox through the exec provider, so its
//! output arrives as a live event stream like any other command:
//! - Claude: `claude -p "prompt" --dangerously-skip-permissions`
//! - Cursor: `agent -p "prompt"`
//!
//! The provider is selected via `[agent].provider` in sandbox.toml.

mod claude;
mod cursor;
#[cfg(test)]
pub(crate) mod mock;

pub(crate) use claude::ClaudeProvider;
pub(crate) use cursor::CursorProvider;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::exec::{EventStream, ExecProvider, ExecRequest};

/// One agent turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AgentInvocation {
    /// Text of the latest user message.
    pub prompt: String,
    pub thread_id: String,
    pub branch_id: Option<String>,
    /// Sandbox directory the agent works in.
    pub workdir: String,
}

impl AgentInvocation {
    /// Applies the working directory and thread identifiers to `request`.
    pub fn prepare(&self, request: ExecRequest) -> ExecRequest {
        let mut request = request.cwd(&self.workdir);
        request
            .env
            .insert("SANDBOX_THREAD_ID".to_string(), self.thread_id.clone());
        if let Some(branch_id) = &self.branch_id {
            request
                .env
                .insert("SANDBOX_BRANCH_ID".to_string(), branch_id.clone());
        }
        request
    }
}

/// Trait for AI agent CLI providers.
#[async_trait]
pub(crate) trait AgentProvider: Send + Sync {
    /// Returns the provider name for display.
    fn name(&self) -> &'static str;

    /// Starts the agent and returns its output stream.
    async fn run(
        &self,
        invocation: AgentInvocation,
        exec: Arc<dyn ExecProvider>,
        cancel: CancellationToken,
    ) -> Result<EventStream>;
}

/// Supported agent providers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum Provider {
    /// Claude Code CLI agent.
    #[default]
    Claude,
    /// Cursor CLI agent.
    Cursor,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cursor => write!(f, "cursor"),
            Self::Claude => write!(f, "claude"),
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cursor" => Ok(Self::Cursor),
            "claude" => Ok(Self::Claude),
            _ => anyhow::bail!("Unknown agent provider: '{s}'. Supported: cursor, claude"),
        }
    }
}

/// Builds the agent provider selected in `[agent]`.
pub(crate) fn build_provider(config: &AgentConfig) -> Result<Arc<dyn AgentProvider>> {
    Ok(match config.get_provider()? {
        Provider::Claude => Arc::new(ClaudeProvider::new(config.claude.clone())),
        Provider::Cursor => Arc::new(CursorProvider::new(config.cursor.clone())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_display() {
        assert_eq!(format!("{}", Provider::Cursor), "cursor");
        assert_eq!(format!("{}", Provider::Claude), "claude");
    }

    #[test]
    fn test_provider_from_str() {
        assert_eq!("cursor".parse::<Provider>().unwrap(), Provider::Cursor);
        assert_eq!("claude".parse::<Provider>().unwrap(), Provider::Claude);
        assert_eq!("Claude".parse::<Provider>().unwrap(), Provider::Claude);
        assert!("unknown".parse::<Provider>().is_err());
    }

    #[test]
    fn test_build_provider_from_config() {
        let mut config = AgentConfig::default();
        assert_eq!(build_provider(&config).unwrap().name(), "Claude");

        config.provider = "cursor".to_string();
        assert_eq!(build_provider(&config).unwrap().name(), "Cursor");

        config.provider = "copilot".to_string();
        assert!(build_provider(&config).is_err());
    }

    #[test]
    fn test_invocation_prepares_request() {
        let invocation = AgentInvocation {
            prompt: "hi".to_string(),
            thread_id: "t1".to_string(),
            branch_id: Some("b1".to_string()),
            workdir: "/workspace".to_string(),
        };
        let request = invocation.prepare(ExecRequest::new("claude"));
        assert_eq!(request.cwd.as_deref(), Some("/workspace"));
        assert_eq!(request.env["SANDBOX_THREAD_ID"], "t1");
        assert_eq!(request.env["SANDBOX_BRANCH_ID"], "b1");
    }
}

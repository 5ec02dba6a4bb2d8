//! Mock agent provider for testing.
//!
//! Provides a configurable mock that returns predetermined event streams
//! without invoking real agent CLIs.

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use super::{AgentInvocation, AgentProvider};
use crate::exec::{EventStream, ExecEvent, ExecProvider};

/// A mock agent provider for testing.
///
/// Returns configurable responses and tracks invocations for test assertions.
#[derive(Debug, Clone)]
pub(crate) struct MockAgentProvider {
    /// Responses to return in order. Cycles if more invocations than responses.
    responses: Arc<Vec<MockResponse>>,
    /// Number of times `run` has been called.
    invocation_count: Arc<AtomicUsize>,
    /// Every invocation, in call order.
    invocations: Arc<Mutex<Vec<AgentInvocation>>>,
}

/// A single mock response configuration.
#[derive(Debug, Clone)]
pub(crate) enum MockResponse {
    /// Print the output and complete.
    Success(String),
    /// Fail to start with the given message.
    Error(String),
    /// Start, then report an error event.
    Crash(String),
    /// Start and run until cancelled.
    Hang,
}

impl MockAgentProvider {
    /// Create a new mock provider that returns the given responses in order.
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Arc::new(responses),
            invocation_count: Arc::new(AtomicUsize::new(0)),
            invocations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a mock that always succeeds with the given output.
    pub fn always_succeed(output: &str) -> Self {
        Self::new(vec![MockResponse::Success(output.to_string())])
    }

    /// Create a mock whose runs never finish on their own.
    pub fn always_hang() -> Self {
        Self::new(vec![MockResponse::Hang])
    }

    /// Get the number of times `run` was called.
    pub fn invocation_count(&self) -> usize {
        self.invocation_count.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> Vec<AgentInvocation> {
        self.invocations.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentProvider for MockAgentProvider {
    fn name(&self) -> &'static str {
        "Mock"
    }

    async fn run(
        &self,
        invocation: AgentInvocation,
        _exec: Arc<dyn ExecProvider>,
        cancel: CancellationToken,
    ) -> Result<EventStream> {
        let count = self.invocation_count.fetch_add(1, Ordering::SeqCst);
        self.invocations.lock().unwrap().push(invocation);
        let response = &self.responses[count % self.responses.len()];

        let events = match response {
            MockResponse::Success(output) => stream::iter(vec![
                ExecEvent::start(),
                ExecEvent::stdout(output.clone()),
                ExecEvent::complete(),
            ])
            .boxed(),
            MockResponse::Error(msg) => anyhow::bail!("{msg}"),
            MockResponse::Crash(msg) => {
                stream::iter(vec![ExecEvent::start(), ExecEvent::error(msg.clone())]).boxed()
            }
            MockResponse::Hang => stream::iter(vec![ExecEvent::start()])
                .chain(stream::once(async move {
                    cancel.cancelled().await;
                    ExecEvent::error("cancelled")
                }))
                .boxed(),
        };

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::scripted::ScriptedExec;

    fn invocation() -> AgentInvocation {
        AgentInvocation {
            prompt: "test prompt".to_string(),
            thread_id: "t1".to_string(),
            branch_id: None,
            workdir: "/workspace".to_string(),
        }
    }

    async fn run(provider: &MockAgentProvider) -> Result<Vec<ExecEvent>> {
        let events = provider
            .run(invocation(), Arc::new(ScriptedExec::new()), CancellationToken::new())
            .await?;
        Ok(events.collect().await)
    }

    #[tokio::test]
    async fn test_mock_provider_success() {
        let provider = MockAgentProvider::always_succeed("test output");
        let events = run(&provider).await.unwrap();
        assert_eq!(events.len(), 3);
        assert!(events[2].is_complete());
    }

    #[tokio::test]
    async fn test_mock_provider_cycles_responses() {
        let provider = MockAgentProvider::new(vec![
            MockResponse::Success("first".to_string()),
            MockResponse::Error("second".to_string()),
        ]);

        assert!(run(&provider).await.is_ok());
        assert!(run(&provider).await.is_err());
        assert!(run(&provider).await.is_ok()); // Cycles back
        assert_eq!(provider.invocation_count(), 3);
        assert_eq!(provider.invocations()[0].prompt, "test prompt");
    }

    #[tokio::test]
    async fn test_mock_provider_hang_ends_on_cancel() {
        let provider = MockAgentProvider::always_hang();
        let cancel = CancellationToken::new();
        let mut events = provider
            .run(invocation(), Arc::new(ScriptedExec::new()), cancel.clone())
            .await
            .unwrap();

        assert!(matches!(events.next().await, Some(ExecEvent::Start { .. })));
        cancel.cancel();
        assert!(events.next().await.unwrap().is_error());
        assert!(events.next().await.is_none());
    }
}

//! Ties a conversation to a commit.
//!
//! Before an agent run, the working tree is put back to the last commit the
//! conversation recorded. A thread without one gets the current HEAD recorded
//! on its root message, so later runs in the same thread resolve to the same
//! commit.

use async_trait::async_trait;
use tracing::{debug, info};

use super::error::RuntimeError;
use crate::thread::{Checkpoint, MessagePart, ThreadMessage, ThreadStore};

pub(crate) const STARTING_POINT: &str = "Starting point";

/// The git operations checkpoint resolution needs.
#[async_trait]
pub(crate) trait CheckpointTarget: Send + Sync {
    async fn git_reset(&self, sha: &str) -> Result<(), RuntimeError>;
    async fn git_current_commit(&self) -> Result<String, RuntimeError>;
    fn commit_url(&self, sha: &str) -> Option<String>;
}

/// The most recent commit annotation in `messages`.
pub(crate) fn latest_checkpoint(messages: &[ThreadMessage]) -> Option<&Checkpoint> {
    messages.iter().rev().find_map(ThreadMessage::checkpoint)
}

/// Resets the sandbox to `checkpoint`.
pub(crate) async fn apply_checkpoint(
    checkpoint: &Checkpoint,
    target: &dyn CheckpointTarget,
) -> Result<(), RuntimeError> {
    target.git_reset(&checkpoint.sha).await
}

/// Finds the checkpoint for a thread and makes the sandbox match it.
///
/// Looks at `messages` first, then at the stored thread. If neither has a
/// commit annotation, HEAD becomes the "Starting point" checkpoint: it is
/// added to the root message in `messages` and that message is saved. An
/// empty thread has no root message, so nothing is saved for it.
pub(crate) async fn resolve_checkpoint(
    messages: &mut Vec<ThreadMessage>,
    thread_id: &str,
    store: &dyn ThreadStore,
    target: &dyn CheckpointTarget,
) -> Result<Checkpoint, RuntimeError> {
    if let Some(checkpoint) = latest_checkpoint(messages).cloned() {
        debug!("Thread {} resumes at {}", thread_id, checkpoint.sha);
        apply_checkpoint(&checkpoint, target).await?;
        return Ok(checkpoint);
    }

    let stored = store.load(thread_id).map_err(RuntimeError::Thread)?;
    if let Some(checkpoint) = latest_checkpoint(&stored).cloned() {
        debug!("Thread {} resumes at stored {}", thread_id, checkpoint.sha);
        apply_checkpoint(&checkpoint, target).await?;
        if let Some(root) = messages.first_mut() {
            root.parts.push(MessagePart::Commit(checkpoint.clone()));
        }
        return Ok(checkpoint);
    }

    let sha = target.git_current_commit().await?;
    let checkpoint = Checkpoint {
        url: target.commit_url(&sha),
        sha,
        title: STARTING_POINT.to_string(),
        description: "Sandbox state when the conversation started".to_string(),
    };

    let Some(root) = messages.first_mut() else {
        debug!("Thread {} is empty; starting point not saved", thread_id);
        return Ok(checkpoint);
    };
    root.parts.push(MessagePart::Commit(checkpoint.clone()));
    store
        .save_message(thread_id, root)
        .map_err(RuntimeError::Thread)?;

    info!("Thread {} starts at {}", thread_id, checkpoint.sha);
    Ok(checkpoint)
}

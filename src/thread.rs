//! Conversation threads and their commit annotations.
//!
//! Threads are stored one JSON file per thread. The runtime only ever reads
//! message parts and writes back a single message, so the store interface is
//! deliberately narrow.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// A git commit that a conversation agreed on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub sha: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text { text: String },
    Commit(Checkpoint),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

impl ThreadMessage {
    /// The last commit annotation on this message, if any.
    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        self.parts.iter().rev().find_map(|part| match part {
            MessagePart::Commit(checkpoint) => Some(checkpoint),
            MessagePart::Text { .. } => None,
        })
    }

    /// All text parts joined by newlines.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                MessagePart::Text { text } => Some(text.as_str()),
                MessagePart::Commit(_) => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
impl ThreadMessage {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
            parts: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.parts.push(MessagePart::Text { text: text.into() });
        self
    }

    #[must_use]
    pub fn with_commit(mut self, checkpoint: Checkpoint) -> Self {
        self.parts.push(MessagePart::Commit(checkpoint));
        self
    }
}

/// Persistence for conversation threads.
pub trait ThreadStore: Send + Sync {
    /// Loads a thread's messages in order. Unknown threads are empty.
    fn load(&self, thread_id: &str) -> Result<Vec<ThreadMessage>>;

    /// Replaces the stored message with the same id, or appends it.
    fn save_message(&self, thread_id: &str, message: &ThreadMessage) -> Result<()>;
}

/// Stores each thread as `<dir>/<thread_id>.json`.
#[derive(Debug, Clone)]
pub struct FileThreadStore {
    dir: PathBuf,
}

impl FileThreadStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn thread_path(&self, thread_id: &str) -> Result<PathBuf> {
        if thread_id.is_empty()
            || thread_id.starts_with('.')
            || thread_id.contains(['/', '\\'])
        {
            anyhow::bail!("Invalid thread id: '{thread_id}'");
        }
        Ok(self.dir.join(format!("{thread_id}.json")))
    }
}

impl ThreadStore for FileThreadStore {
    fn load(&self, thread_id: &str) -> Result<Vec<ThreadMessage>> {
        let path = self.thread_path(thread_id)?;

        if !path.exists() {
            return Ok(Vec::new());
        }

        read_thread(&path)
    }

    fn save_message(&self, thread_id: &str, message: &ThreadMessage) -> Result<()> {
        let path = self.thread_path(thread_id)?;
        let mut messages = if path.exists() {
            read_thread(&path)?
        } else {
            Vec::new()
        };

        match messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message.clone(),
            None => messages.push(message.clone()),
        }

        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create directory: {}", self.dir.display()))?;

        let content =
            serde_json::to_string_pretty(&messages).context("Failed to serialize thread")?;

        fs::write(&path, content)
            .with_context(|| format!("Failed to write thread file: {}", path.display()))?;

        Ok(())
    }
}

fn read_thread(path: &Path) -> Result<Vec<ThreadMessage>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read thread file: {}", path.display()))?;

    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse thread file: {}", path.display()))
}

/// In-memory store that counts writes.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MemoryThreadStore {
    threads: std::sync::Mutex<std::collections::HashMap<String, Vec<ThreadMessage>>>,
    saves: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl MemoryThreadStore {
    pub fn save_count(&self) -> usize {
        self.saves.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl ThreadStore for MemoryThreadStore {
    fn load(&self, thread_id: &str) -> Result<Vec<ThreadMessage>> {
        Ok(self
            .threads
            .lock()
            .unwrap()
            .get(thread_id)
            .cloned()
            .unwrap_or_default())
    }

    fn save_message(&self, thread_id: &str, message: &ThreadMessage) -> Result<()> {
        self.saves.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut threads = self.threads.lock().unwrap();
        let messages = threads.entry(thread_id.to_string()).or_default();
        match messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message.clone(),
            None => messages.push(message.clone()),
        }
        Ok(())
    }
}

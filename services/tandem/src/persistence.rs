//! Conversation Persistence
//!
//! Each agent's message history is written to `<results>/<role>/conversation.json`.
//! Saves are handed to a background writer per agent; if several arrive while a write is
//! in flight only the latest snapshot is written.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tandem_core::{AgentRole, Message};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error};

pub const CONVERSATION_FILE: &str = "conversation.json";

pub fn conversation_path(results_dir: &Path, role: AgentRole) -> PathBuf {
    results_dir.join(role.as_str()).join(CONVERSATION_FILE)
}

/// Writes the snapshot through a temporary file so readers never see half a file.
pub async fn write_snapshot(path: &Path, messages: &[Message]) -> Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let json = serde_json::to_vec_pretty(messages)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

struct Writer {
    tx: watch::Sender<Option<Vec<Message>>>,
    handle: JoinHandle<()>,
}

impl Writer {
    fn spawn(path: PathBuf) -> Self {
        let (tx, mut rx) = watch::channel::<Option<Vec<Message>>>(None);
        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let snapshot = rx.borrow_and_update().clone();
                let Some(messages) = snapshot else { continue };
                match write_snapshot(&path, &messages).await {
                    Ok(()) => debug!(path = %path.display(), messages = messages.len(), "Conversation saved"),
                    Err(e) => error!(path = %path.display(), error = ?e, "Failed to save conversation"),
                }
            }
        });
        Self { tx, handle }
    }
}

pub struct ConversationStore {
    results_dir: PathBuf,
    speech: Writer,
    action: Writer,
}

impl ConversationStore {
    /// Starts one writer task per agent. Must be called inside a tokio runtime.
    pub fn spawn(results_dir: impl Into<PathBuf>) -> Self {
        let results_dir = results_dir.into();
        Self {
            speech: Writer::spawn(conversation_path(&results_dir, AgentRole::Speech)),
            action: Writer::spawn(conversation_path(&results_dir, AgentRole::Action)),
            results_dir,
        }
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    fn writer(&self, role: AgentRole) -> &Writer {
        match role {
            AgentRole::Speech => &self.speech,
            AgentRole::Action => &self.action,
        }
    }

    /// Queues a snapshot without waiting for it to be written.
    pub fn save(&self, role: AgentRole, messages: Vec<Message>) {
        self.writer(role).tx.send_replace(Some(messages));
    }

    /// Waits for queued snapshots to reach disk and stops the writers.
    pub async fn close(self) {
        let Self { speech, action, .. } = self;
        for writer in [speech, action] {
            drop(writer.tx);
            if let Err(e) = writer.handle.await {
                error!(error = %e, "Conversation writer task failed");
            }
        }
    }
}

//! Session model — one spoken conversation per connected client.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::latency::LatencyTracker;

/// Speaker role in the conversation history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One entry of the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// One client's conversation state. Lives exactly as long as the
/// connection; nothing is persisted.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub history: Vec<ChatMessage>,
    /// Synthesis context of the in-flight or most recent turn.
    pub context_id: Option<String>,
    pub latency: LatencyTracker,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            history: Vec::new(),
            context_id: None,
            latency: LatencyTracker::new(),
        }
    }

    /// Allocate a fresh synthesis context id for a new turn.
    pub fn begin_context(&mut self) -> String {
        let id = format!("ctx_{}", Uuid::new_v4().simple());
        self.context_id = Some(id.clone());
        id
    }

    /// Commit a completed turn: exactly one user and one assistant entry,
    /// in that order. Aborted turns never reach this point, so history
    /// stays consistent without rollback.
    pub fn commit_turn(&mut self, transcript: impl Into<String>, reply: impl Into<String>) {
        self.history.push(ChatMessage::user(transcript));
        self.history.push(ChatMessage::assistant(reply));
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

//! Chat persistence interface.
//!
//! The runtime only reads history to build prompts and reports finished
//! turns; how chats are stored is up to the implementation.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::prompt::ImagePayload;

/// Store errors.
#[derive(Debug, Error)]
#[error("chat store error: {0}")]
pub struct StoreError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

/// One stored message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: TurnRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImagePayload>,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
            reasoning: String::new(),
            images: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>, reasoning: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
            reasoning: reasoning.into(),
            images: Vec::new(),
        }
    }
}

/// How a generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    Completed,
    Cancelled,
}

/// Final text of an assistant reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletedTurn {
    pub chat_id: String,
    pub content: String,
    pub reasoning: String,
    pub elapsed_ms: u64,
    pub outcome: TurnOutcome,
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Prior turns of `chat_id`, oldest first.
    async fn history(&self, chat_id: &str) -> Result<Vec<ChatTurn>, StoreError>;

    /// Record the user's message before generation starts.
    async fn append_user_turn(&self, chat_id: &str, turn: ChatTurn) -> Result<(), StoreError>;

    /// Record a finished or cancelled reply.
    async fn complete_turn(&self, turn: CompletedTurn) -> Result<(), StoreError>;
}

/// Process-local store, used by the CLI and in tests.
#[derive(Debug, Default)]
pub struct MemoryChatStore {
    chats: Mutex<HashMap<String, Vec<ChatTurn>>>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All turns of `chat_id`.
    pub fn turns(&self, chat_id: &str) -> Vec<ChatTurn> {
        self.chats
            .lock()
            .map(|chats| chats.get(chat_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    fn push(&self, chat_id: &str, turn: ChatTurn) -> Result<(), StoreError> {
        let mut chats = self
            .chats
            .lock()
            .map_err(|e| StoreError(e.to_string()))?;
        chats.entry(chat_id.to_string()).or_default().push(turn);
        Ok(())
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn history(&self, chat_id: &str) -> Result<Vec<ChatTurn>, StoreError> {
        Ok(self.turns(chat_id))
    }

    async fn append_user_turn(&self, chat_id: &str, turn: ChatTurn) -> Result<(), StoreError> {
        self.push(chat_id, turn)
    }

    async fn complete_turn(&self, turn: CompletedTurn) -> Result<(), StoreError> {
        self.push(&turn.chat_id, ChatTurn::assistant(turn.content, turn.reasoning))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_keeps_order() {
        let store = MemoryChatStore::new();
        store
            .append_user_turn("c", ChatTurn::user("hello"))
            .await
            .unwrap();
        store
            .complete_turn(CompletedTurn {
                chat_id: "c".into(),
                content: "hi".into(),
                reasoning: "greet back".into(),
                elapsed_ms: 5,
                outcome: TurnOutcome::Completed,
            })
            .await
            .unwrap();

        let history = store.history("c").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, TurnRole::User);
        assert_eq!(history[1], ChatTurn::assistant("hi", "greet back"));
        assert!(store.history("other").await.unwrap().is_empty());
    }
}

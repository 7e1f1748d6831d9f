use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "tool" => Some(Self::Tool),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self { role, content: content.into(), created_at: Utc::now() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("conversation memory backend failure: {0}")]
    Backend(String),
}

/// Thread-scoped conversation history, keyed by `(channel_id, thread_id)`.
#[async_trait]
pub trait ConversationMemory: Send + Sync {
    /// Most recent `limit` messages, oldest first.
    async fn get_history(
        &self,
        channel_id: &str,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, MemoryError>;

    async fn append_message(
        &self,
        channel_id: &str,
        thread_id: &str,
        message: ChatMessage,
    ) -> Result<(), MemoryError>;
}

#[derive(Debug, Default)]
pub struct InMemoryConversationMemory {
    threads: RwLock<HashMap<(String, String), Vec<ChatMessage>>>,
}

#[async_trait]
impl ConversationMemory for InMemoryConversationMemory {
    async fn get_history(
        &self,
        channel_id: &str,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, MemoryError> {
        let threads = self.threads.read().await;
        let Some(messages) = threads.get(&(channel_id.to_owned(), thread_id.to_owned())) else {
            return Ok(Vec::new());
        };
        let skip = messages.len().saturating_sub(limit);
        Ok(messages[skip..].to_vec())
    }

    async fn append_message(
        &self,
        channel_id: &str,
        thread_id: &str,
        message: ChatMessage,
    ) -> Result<(), MemoryError> {
        let mut threads = self.threads.write().await;
        threads.entry((channel_id.to_owned(), thread_id.to_owned())).or_default().push(message);
        Ok(())
    }
}

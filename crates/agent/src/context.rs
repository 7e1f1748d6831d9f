use std::sync::Arc;

use helmsman_core::audit::AuditContext;
use helmsman_core::memory::ChatMessage;
use helmsman_mcp::ConnectionManager;
use uuid::Uuid;

/// Per-message execution scope. Built once by the gateway and handed to
/// tools read-only; never persisted.
#[derive(Clone)]
pub struct ExecutionContext {
    pub request_id: String,
    pub channel_id: String,
    pub thread_id: String,
    pub user_id: String,
    pub history: Vec<ChatMessage>,
    connections: Option<Arc<ConnectionManager>>,
}

impl ExecutionContext {
    pub fn new(
        channel_id: impl Into<String>,
        thread_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            channel_id: channel_id.into(),
            thread_id: thread_id.into(),
            user_id: user_id.into(),
            history: Vec::new(),
            connections: None,
        }
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn with_connections(mut self, connections: Arc<ConnectionManager>) -> Self {
        self.connections = Some(connections);
        self
    }

    /// Connection manager scoped to this request's user, if one was attached.
    pub fn connections(&self) -> Option<&Arc<ConnectionManager>> {
        self.connections.as_ref()
    }

    pub fn audit_context(&self) -> AuditContext {
        AuditContext::new(&self.request_id, &self.channel_id, &self.thread_id, &self.user_id)
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("request_id", &self.request_id)
            .field("channel_id", &self.channel_id)
            .field("thread_id", &self.thread_id)
            .field("user_id", &self.user_id)
            .field("history_len", &self.history.len())
            .field("has_connections", &self.connections.is_some())
            .finish()
    }
}

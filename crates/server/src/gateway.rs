use std::sync::Arc;

use async_trait::async_trait;
use helmsman_agent::{AdmissionController, AgentResponse, ExecutionContext, Orchestrator};
use helmsman_core::config::McpConfig;
use helmsman_core::errors::AgentError;
use helmsman_core::memory::ConversationMemory;
use helmsman_mcp::{ConnectionManager, Connector};
use helmsman_slack::{EventContext, EventHandlerError, ThreadMessageEvent, ThreadMessageService};
use tracing::{info, warn};

/// Inbound message path: admission, history, a per-request connection
/// manager, the orchestrator, then cleanup. Returns the reply for the thread.
pub struct MessageGateway {
    orchestrator: Arc<Orchestrator>,
    admission: AdmissionController,
    memory: Arc<dyn ConversationMemory>,
    connector: Arc<dyn Connector>,
    mcp: McpConfig,
    history_limit: usize,
}

impl MessageGateway {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        admission: AdmissionController,
        memory: Arc<dyn ConversationMemory>,
        connector: Arc<dyn Connector>,
        mcp: McpConfig,
        history_limit: usize,
    ) -> Self {
        Self { orchestrator, admission, memory, connector, mcp, history_limit }
    }

    pub async fn handle(&self, event: &ThreadMessageEvent, correlation_id: &str) -> Option<String> {
        if event.is_bot || event.text.trim().is_empty() {
            return None;
        }

        if let Err(limit) = self
            .admission
            .admit(&event.user_id, &event.channel_id, &event.thread_ts, &event.text)
            .await
        {
            if limit.is_silent() {
                return None;
            }
            return Some(AgentResponse::from_error(&AgentError::RateLimited(limit)).render());
        }

        let history = match self
            .memory
            .get_history(&event.channel_id, &event.thread_ts, self.history_limit)
            .await
        {
            Ok(history) => history,
            Err(error) => {
                warn!(
                    event_name = "gateway.history.unavailable",
                    correlation_id = %correlation_id,
                    thread_id = %event.thread_ts,
                    user_id = %event.user_id,
                    error = %error,
                    "continuing without conversation history"
                );
                Vec::new()
            }
        };

        let connections =
            Arc::new(ConnectionManager::from_config(self.connector.clone(), &self.mcp));
        let context = ExecutionContext::new(&event.channel_id, &event.thread_ts, &event.user_id)
            .with_history(history)
            .with_connections(connections.clone());

        info!(
            event_name = "gateway.request.started",
            correlation_id = %context.request_id,
            envelope_id = %correlation_id,
            thread_id = %context.thread_id,
            user_id = %context.user_id,
            "processing thread message"
        );

        let response = self.orchestrator.process(&event.text, &context).await;
        connections.disconnect_all().await;

        info!(
            event_name = "gateway.request.completed",
            correlation_id = %context.request_id,
            thread_id = %context.thread_id,
            user_id = %context.user_id,
            success = response.success,
            error_code = response.error_code.unwrap_or("none"),
            "thread message processed"
        );
        Some(response.render())
    }
}

#[async_trait]
impl ThreadMessageService for MessageGateway {
    async fn handle_thread_message(
        &self,
        event: &ThreadMessageEvent,
        ctx: &EventContext,
    ) -> Result<Option<String>, EventHandlerError> {
        Ok(self.handle(event, &ctx.correlation_id).await)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use helmsman_agent::llm::{CompletionRequest, IntentResolver, LlmError, Resolution};
    use helmsman_agent::{
        AdmissionController, Orchestrator, OrchestratorSettings, RemoteTool, ToolCache,
        ToolRegistry,
    };
    use helmsman_core::audit::InMemoryAuditSink;
    use helmsman_core::config::{
        AdmissionConfig, CacheConfig, McpConfig, McpServerConfig, TransportKind,
    };
    use helmsman_core::domain::tool::{ToolCall, ToolParameters};
    use helmsman_core::memory::{ConversationMemory, InMemoryConversationMemory};
    use helmsman_core::store::InMemoryAtomicStore;
    use helmsman_mcp::protocol::{JsonRpcRequest, JsonRpcResponse};
    use helmsman_mcp::{Connection, Connector, McpError};
    use helmsman_slack::ThreadMessageEvent;
    use serde_json::{json, Value};

    use super::MessageGateway;

    /// Answers "issue <KEY>" with a lookup call, anything else with text.
    struct KeywordResolver;

    #[async_trait]
    impl IntentResolver for KeywordResolver {
        async fn resolve(&self, request: &CompletionRequest) -> Result<Resolution, LlmError> {
            let latest = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            if let Some(key) = latest.strip_prefix("issue ") {
                let mut parameters = ToolParameters::new();
                parameters.insert("key".to_owned(), json!(key));
                return Ok(Resolution::calls(vec![ToolCall::new("jira__lookup", parameters)]));
            }
            let history = request.messages.len() - 2;
            Ok(Resolution::text(format!("heard `{latest}` with {history} earlier messages")))
        }
    }

    #[derive(Default)]
    struct CountingConnector {
        opened: AtomicUsize,
        closed: Arc<AtomicUsize>,
    }

    struct IssueServer {
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Connection for IssueServer {
        fn transport(&self) -> TransportKind {
            TransportKind::Http
        }

        async fn send(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, McpError> {
            let result = match request.method.as_str() {
                "initialize" => json!({"capabilities": {}}),
                "tools/call" => {
                    let key = request
                        .params
                        .as_ref()
                        .and_then(|params| params.pointer("/arguments/key"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_owned();
                    json!({"content": [{"type": "text", "text": format!("{key} is in review")}]})
                }
                _ => return Ok(JsonRpcResponse::failure(request.id, -32601, "Method not found")),
            };
            Ok(JsonRpcResponse::success(request.id, result))
        }

        async fn notify(&self, _: &str, _: Option<Value>) -> Result<(), McpError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), McpError> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl Connector for CountingConnector {
        async fn open(&self, _: &McpServerConfig) -> Result<Arc<dyn Connection>, McpError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(IssueServer { closed: self.closed.clone() }))
        }
    }

    struct Harness {
        gateway: MessageGateway,
        memory: Arc<InMemoryConversationMemory>,
        connector: Arc<CountingConnector>,
    }

    fn harness(user_max_requests: u32) -> Harness {
        let server = McpServerConfig {
            id: "jira".to_owned(),
            transport: TransportKind::Http,
            endpoint: "https://jira.example.test/mcp".to_owned(),
            headers: BTreeMap::new(),
        };
        let mcp = McpConfig { connect_timeout_ms: 1_000, call_timeout_ms: 1_000, servers: vec![server.clone()] };

        let mut registry = ToolRegistry::new();
        registry
            .register(RemoteTool::new(
                server,
                serde_json::from_value(json!({"name": "lookup", "inputSchema": {
                    "type": "object",
                    "properties": {"key": {"type": "string"}},
                    "required": ["key"]
                }}))
                .expect("definition"),
            ))
            .expect("register");

        let store = Arc::new(InMemoryAtomicStore::new());
        let memory = Arc::new(InMemoryConversationMemory::default());
        let orchestrator = Orchestrator::new(
            Arc::new(registry),
            Arc::new(KeywordResolver),
            ToolCache::new(store.clone(), &CacheConfig { enabled: false, default_ttl_secs: 300 }),
            memory.clone(),
            Arc::new(InMemoryAuditSink::default()),
            OrchestratorSettings::default(),
        );
        let admission = AdmissionController::new(
            store,
            AdmissionConfig { dedup_ttl_secs: 120, user_window_secs: 60, user_max_requests },
        );
        let connector = Arc::new(CountingConnector::default());

        Harness {
            gateway: MessageGateway::new(
                Arc::new(orchestrator),
                admission,
                memory.clone(),
                connector.clone(),
                mcp,
                10,
            ),
            memory,
            connector,
        }
    }

    fn message(user: &str, text: &str) -> ThreadMessageEvent {
        ThreadMessageEvent {
            channel_id: "C1".to_owned(),
            thread_ts: "17.1".to_owned(),
            message_ts: "17.2".to_owned(),
            user_id: user.to_owned(),
            is_bot: false,
            text: text.to_owned(),
        }
    }

    #[tokio::test]
    async fn bots_and_blank_messages_are_ignored() {
        let harness = harness(10);
        let mut bot = message("U1", "hello");
        bot.is_bot = true;

        assert_eq!(harness.gateway.handle(&bot, "env-1").await, None);
        assert_eq!(harness.gateway.handle(&message("U1", "   "), "env-2").await, None);
        assert!(harness.memory.get_history("C1", "17.1", 10).await.expect("history").is_empty());
    }

    #[tokio::test]
    async fn replies_carry_history_and_are_remembered() {
        let harness = harness(10);

        let first = harness.gateway.handle(&message("U1", "hello"), "env-1").await;
        assert_eq!(first.as_deref(), Some("heard `hello` with 0 earlier messages"));

        let second = harness.gateway.handle(&message("U1", "and again"), "env-2").await;
        assert_eq!(second.as_deref(), Some("heard `and again` with 2 earlier messages"));

        let history = harness.memory.get_history("C1", "17.1", 10).await.expect("history");
        assert_eq!(history.len(), 4);
    }

    #[tokio::test]
    async fn duplicates_are_silent_and_throttling_is_visible() {
        let harness = harness(2);

        assert!(harness.gateway.handle(&message("U1", "hello"), "env-1").await.is_some());
        assert_eq!(harness.gateway.handle(&message("U1", "hello"), "env-2").await, None);
        assert!(harness.gateway.handle(&message("U1", "second"), "env-3").await.is_some());

        let throttled =
            harness.gateway.handle(&message("U1", "third"), "env-4").await.expect("throttle reply");
        assert!(throttled.contains("try again in"), "unexpected reply: {throttled}");

        let other_user = harness.gateway.handle(&message("U2", "hello"), "env-5").await;
        assert!(other_user.is_some());
    }

    #[tokio::test]
    async fn remote_calls_use_a_request_scoped_manager_that_is_torn_down() {
        let harness = harness(10);

        let reply = harness.gateway.handle(&message("U1", "issue PROJ-7"), "env-1").await;
        assert_eq!(reply.as_deref(), Some("PROJ-7 is in review"));

        let again = harness.gateway.handle(&message("U1", "issue PROJ-8"), "env-2").await;
        assert_eq!(again.as_deref(), Some("PROJ-8 is in review"));

        assert_eq!(harness.connector.opened.load(Ordering::SeqCst), 2);
        assert_eq!(harness.connector.closed.load(Ordering::SeqCst), 2);
    }
}

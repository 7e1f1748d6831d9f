use std::sync::Arc;
use std::time::Duration;

use helmsman_core::audit::{AuditSink, ExecutionRecord};
use helmsman_core::config::LlmConfig;
use helmsman_core::deadline::with_timeout;
use helmsman_core::domain::tool::{ToolCall, ToolResult};
use helmsman_core::errors::{AgentError, RateLimitError, RateLimitType};
use helmsman_core::memory::{ChatMessage, ConversationMemory, MessageRole};
use helmsman_core::retry::{retry_with_backoff, RetryPolicy};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::cache::ToolCache;
use crate::context::ExecutionContext;
use crate::llm::{timeout_error, CompletionRequest, IntentResolver, LlmError, PromptMessage, Resolution};
use crate::response::{tool_suggestion, AgentResponse, ToolOutcome};
use crate::tools::ToolRegistry;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Helmsman, an assistant working inside a chat thread. \
Call the provided tools when they can answer the request, in the order they should run. \
Reply briefly in plain text when no tool applies.";

#[derive(Clone, Debug)]
pub struct OrchestratorSettings {
    pub system_prompt: String,
    pub max_history_messages: usize,
    pub llm_timeout: Duration,
    /// Upper bound on a single tool execution, local or remote.
    pub tool_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_history_messages: 10,
            llm_timeout: Duration::from_secs(30),
            tool_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl OrchestratorSettings {
    pub fn from_llm_config(config: &LlmConfig) -> Self {
        Self {
            max_history_messages: config.max_history_messages,
            llm_timeout: config.timeout(),
            retry: config.retry_policy(),
            ..Self::default()
        }
    }
}

pub struct Orchestrator {
    registry: Arc<ToolRegistry>,
    resolver: Arc<dyn IntentResolver>,
    cache: ToolCache,
    memory: Arc<dyn ConversationMemory>,
    audit: Arc<dyn AuditSink>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<ToolRegistry>,
        resolver: Arc<dyn IntentResolver>,
        cache: ToolCache,
        memory: Arc<dyn ConversationMemory>,
        audit: Arc<dyn AuditSink>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self { registry, resolver, cache, memory, audit, settings }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Resolves intent, runs the tool chain and records the exchange. Never
    /// fails: pipeline errors become a user-safe response.
    pub async fn process(&self, message: &str, context: &ExecutionContext) -> AgentResponse {
        let response = match self.run(message, context).await {
            Ok(response) => response,
            Err(error) => {
                warn!(
                    event_name = "agent.request.failed",
                    correlation_id = %context.request_id,
                    thread_id = %context.thread_id,
                    user_id = %context.user_id,
                    error_code = error.code(),
                    error = %error,
                    "request failed"
                );
                AgentResponse::from_error(&error)
            }
        };

        self.remember(message, &response, context).await;
        response
    }

    async fn run(&self, message: &str, context: &ExecutionContext) -> Result<AgentResponse, AgentError> {
        let request = self.build_request(message, context);
        let resolution = self.resolve(&request, context).await?;

        if resolution.tool_calls.is_empty() {
            let text = resolution
                .text
                .unwrap_or_else(|| "I'm not sure how to help with that yet.".to_string());
            return Ok(AgentResponse::text(text));
        }

        let mut outcomes = Vec::with_capacity(resolution.tool_calls.len());
        for call in &resolution.tool_calls {
            let result = self.execute_call(call, context).await;
            let failed = !result.success;
            outcomes.push(ToolOutcome { tool_name: call.tool_name.clone(), result });
            if failed {
                break;
            }
        }

        info!(
            event_name = "agent.request.completed",
            correlation_id = %context.request_id,
            thread_id = %context.thread_id,
            user_id = %context.user_id,
            requested_calls = resolution.tool_calls.len(),
            executed_calls = outcomes.len(),
            "tool chain finished"
        );
        Ok(AgentResponse::from_outcomes(outcomes))
    }

    fn build_request(&self, message: &str, context: &ExecutionContext) -> CompletionRequest {
        let skip = context.history.len().saturating_sub(self.settings.max_history_messages);
        let mut messages = Vec::with_capacity(context.history.len() - skip + 2);
        messages.push(PromptMessage::new(MessageRole::System, self.settings.system_prompt.clone()));
        messages.extend(
            context.history[skip..]
                .iter()
                .map(|entry| PromptMessage::new(entry.role, entry.content.clone())),
        );
        messages.push(PromptMessage::new(MessageRole::User, message));

        CompletionRequest { messages, tools: self.registry.to_function_schemas() }
    }

    async fn resolve(
        &self,
        request: &CompletionRequest,
        context: &ExecutionContext,
    ) -> Result<Resolution, AgentError> {
        let limit = self.settings.llm_timeout;
        let outcome = retry_with_backoff(&self.settings.retry, "intent.resolve", |attempt| {
            if attempt > 0 {
                info!(
                    event_name = "agent.intent.retry",
                    correlation_id = %context.request_id,
                    attempt = attempt + 1,
                    "retrying intent resolution"
                );
            }
            with_timeout(limit, self.resolver.resolve(request), || timeout_error(limit))
        })
        .await;

        outcome.map_err(|error| match error {
            LlmError::RateLimited { retry_after_secs } => AgentError::RateLimited(
                RateLimitError::new(RateLimitType::Api, retry_after_secs.unwrap_or(30)),
            ),
            LlmError::Timeout(ms) => AgentError::Timeout(format!("intent resolution after {ms}ms")),
            other => AgentError::IntentResolution(other.to_string()),
        })
    }

    async fn execute_call(&self, call: &ToolCall, context: &ExecutionContext) -> ToolResult {
        let started = Instant::now();
        let (result, from_cache) = self.run_tool(call, context).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        info!(
            event_name = "agent.tool.executed",
            correlation_id = %context.request_id,
            thread_id = %context.thread_id,
            user_id = %context.user_id,
            tool = %call.tool_name,
            success = result.success,
            from_cache,
            duration_ms,
            "tool call finished"
        );

        let record = ExecutionRecord::new(
            &context.audit_context(),
            &call.tool_name,
            Value::Object(call.parameters.clone()),
            serde_json::to_value(&result).unwrap_or(Value::Null),
            result.success,
        )
        .with_duration_ms(duration_ms)
        .with_from_cache(from_cache);

        if let Err(error) = self.audit.append(record).await {
            warn!(
                event_name = "agent.audit.append_failed",
                correlation_id = %context.request_id,
                tool = %call.tool_name,
                error = %error,
                "execution record dropped"
            );
        }

        result
    }

    async fn run_tool(&self, call: &ToolCall, context: &ExecutionContext) -> (ToolResult, bool) {
        let Some(tool) = self.registry.get(&call.tool_name) else {
            return (
                ToolResult::failure(format!("I don't have a tool called `{}`.", call.tool_name)),
                false,
            );
        };
        let descriptor = tool.descriptor();

        if let Err(error) = descriptor.parameter_schema.validate(&call.parameters) {
            let error = AgentError::from(error);
            return (
                ToolResult::failure(format!("{} {}", error.user_message(), error.suggestion())),
                false,
            );
        }

        let cacheable = self.cache.applies_to(descriptor);
        if cacheable {
            if let Some(hit) = self.cache.get(descriptor, &call.parameters).await {
                return (hit, true);
            }
        }

        let limit = self.settings.tool_timeout;
        let execution =
            async { tool.execute(&call.parameters, context).await.map_err(AgentError::from) };
        let result = match with_timeout(limit, execution, || {
            AgentError::Timeout(format!("tool `{}` after {}ms", call.tool_name, limit.as_millis()))
        })
        .await
        {
            Ok(result) => result,
            Err(error) => {
                warn!(
                    event_name = "agent.tool.failed",
                    correlation_id = %context.request_id,
                    tool = %call.tool_name,
                    error_code = error.code(),
                    error = %error,
                    "tool returned an error"
                );
                ToolResult::failure(format!(
                    "{} {}",
                    error.user_message(),
                    tool_suggestion(&call.tool_name)
                ))
            }
        };

        if cacheable {
            self.cache.put(descriptor, &call.parameters, &result).await;
        }
        (result, false)
    }

    async fn remember(&self, message: &str, response: &AgentResponse, context: &ExecutionContext) {
        let exchange = [ChatMessage::user(message), ChatMessage::assistant(response.render())];
        for entry in exchange {
            if let Err(error) =
                self.memory.append_message(&context.channel_id, &context.thread_id, entry).await
            {
                warn!(
                    event_name = "agent.memory.append_failed",
                    correlation_id = %context.request_id,
                    thread_id = %context.thread_id,
                    error = %error,
                    "conversation history not persisted"
                );
                return;
            }
        }
    }
}

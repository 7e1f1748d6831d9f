use std::time::Duration;

use async_trait::async_trait;
use helmsman_core::config::{LlmConfig, LlmProvider};
use helmsman_core::domain::tool::{ToolCall, ToolParameters};
use helmsman_core::memory::MessageRole;
use helmsman_core::retry::Retryable;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

const OPENAI_BASE_URL: &str = "https://api.openai.com";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PromptMessage {
    pub role: MessageRole,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<PromptMessage>,
    /// Function-calling schemas, as produced by the tool registry.
    pub tools: Vec<Value>,
}

/// What the model decided: free text, tool calls in execution order, or both.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Resolution {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl Resolution {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: Some(text.into()), tool_calls: Vec::new() }
    }

    pub fn calls(tool_calls: Vec<ToolCall>) -> Self {
        Self { text: None, tool_calls }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("LLM provider rate limited the request")]
    RateLimited { retry_after_secs: Option<u64> },
    #[error("transient LLM failure: {0}")]
    Transient(String),
    #[error("LLM call timed out after {0}ms")]
    Timeout(u64),
    #[error("invalid LLM exchange: {0}")]
    Invalid(String),
}

impl Retryable for LlmError {
    fn is_retryable(&self) -> bool {
        !matches!(self, Self::Invalid(_))
    }
}

#[async_trait]
pub trait IntentResolver: Send + Sync {
    async fn resolve(&self, request: &CompletionRequest) -> Result<Resolution, LlmError>;
}

/// `/v1/chat/completions` client. Works against OpenAI and Ollama's
/// compatible endpoint.
pub struct OpenAiCompatibleResolver {
    client: Client,
    endpoint: String,
    api_key: Option<SecretString>,
    model: String,
}

impl OpenAiCompatibleResolver {
    pub fn new(
        client: Client,
        base_url: &str,
        api_key: Option<SecretString>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            endpoint: format!("{}/v1/chat/completions", base_url.trim_end_matches('/')),
            api_key,
            model: model.into(),
        }
    }

    pub fn from_config(config: &LlmConfig) -> Self {
        let base_url = match (&config.base_url, config.provider) {
            (Some(base_url), _) => base_url.clone(),
            (None, LlmProvider::OpenAi) => OPENAI_BASE_URL.to_string(),
            (None, LlmProvider::Ollama) => "http://localhost:11434".to_string(),
        };
        Self::new(Client::new(), &base_url, config.api_key.clone(), config.model.clone())
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn body(&self, request: &CompletionRequest) -> Value {
        let messages = request
            .messages
            .iter()
            .map(|message| json!({"role": message.role.as_str(), "content": message.content}))
            .collect::<Vec<_>>();

        let mut body = json!({"model": self.model, "messages": messages});
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools.clone());
            body["tool_choice"] = json!("auto");
        }
        body
    }
}

#[async_trait]
impl IntentResolver for OpenAiCompatibleResolver {
    async fn resolve(&self, request: &CompletionRequest) -> Result<Resolution, LlmError> {
        let mut builder = self.client.post(&self.endpoint).json(&self.body(request));
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key.expose_secret());
        }

        let response = builder.send().await.map_err(|error| {
            if error.is_timeout() || error.is_connect() || error.is_request() {
                LlmError::Transient(error.to_string())
            } else {
                LlmError::Invalid(error.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok());
            return Err(classify_status(status, retry_after_secs));
        }

        let payload = response
            .json::<Value>()
            .await
            .map_err(|error| LlmError::Invalid(format!("unreadable completion body: {error}")))?;
        parse_completion(&payload)
    }
}

pub(crate) fn classify_status(status: StatusCode, retry_after_secs: Option<u64>) -> LlmError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        LlmError::RateLimited { retry_after_secs }
    } else if status.is_server_error() {
        LlmError::Transient(format!("provider responded with HTTP {status}"))
    } else {
        LlmError::Invalid(format!("provider responded with HTTP {status}"))
    }
}

pub(crate) fn parse_completion(payload: &Value) -> Result<Resolution, LlmError> {
    let message = payload
        .pointer("/choices/0/message")
        .ok_or_else(|| LlmError::Invalid("completion has no choices".to_string()))?;

    let text = message
        .get("content")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|content| !content.is_empty())
        .map(str::to_string);

    let mut tool_calls = Vec::new();
    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        for call in calls {
            let name = call
                .pointer("/function/name")
                .and_then(Value::as_str)
                .ok_or_else(|| LlmError::Invalid("tool call without a function name".to_string()))?;
            let parameters = parse_arguments(name, call.pointer("/function/arguments"))?;
            let mut tool_call = ToolCall::new(name, parameters);
            tool_call.id = call.get("id").and_then(Value::as_str).map(str::to_string);
            tool_calls.push(tool_call);
        }
    }

    Ok(Resolution { text, tool_calls })
}

// OpenAI sends arguments as a JSON string, Ollama as an object.
fn parse_arguments(name: &str, raw: Option<&Value>) -> Result<ToolParameters, LlmError> {
    let value = match raw {
        None | Some(Value::Null) => return Ok(ToolParameters::new()),
        Some(Value::String(encoded)) if encoded.trim().is_empty() => {
            return Ok(ToolParameters::new())
        }
        Some(Value::String(encoded)) => serde_json::from_str::<Value>(encoded).map_err(|error| {
            LlmError::Invalid(format!("arguments for `{name}` are not valid JSON: {error}"))
        })?,
        Some(other) => other.clone(),
    };

    match value {
        Value::Object(parameters) => Ok(parameters),
        _ => Err(LlmError::Invalid(format!("arguments for `{name}` must be a JSON object"))),
    }
}

pub(crate) fn timeout_error(limit: Duration) -> LlmError {
    LlmError::Timeout(limit.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use helmsman_core::memory::MessageRole;
    use helmsman_core::retry::Retryable;
    use reqwest::StatusCode;
    use secrecy::SecretString;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::{
        classify_status, parse_completion, CompletionRequest, IntentResolver, LlmError,
        OpenAiCompatibleResolver, PromptMessage,
    };

    #[test]
    fn parses_string_and_object_arguments_in_order() {
        let payload = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [
                        {"id": "call_1", "type": "function", "function": {"name": "ci_status", "arguments": "{\"branch\":\"main\"}"}},
                        {"id": "call_2", "type": "function", "function": {"name": "jira_issue", "arguments": {"key": "PROJ-7"}}}
                    ]
                }
            }]
        });

        let resolution = parse_completion(&payload).expect("parse");
        assert_eq!(resolution.text, None);
        assert_eq!(resolution.tool_calls.len(), 2);
        assert_eq!(resolution.tool_calls[0].tool_name, "ci_status");
        assert_eq!(resolution.tool_calls[0].id.as_deref(), Some("call_1"));
        assert_eq!(resolution.tool_calls[0].parameters["branch"], json!("main"));
        assert_eq!(resolution.tool_calls[1].parameters["key"], json!("PROJ-7"));
    }

    #[test]
    fn plain_text_reply_has_no_calls() {
        let payload = json!({"choices": [{"message": {"content": "  Hello there  "}}]});
        let resolution = parse_completion(&payload).expect("parse");
        assert_eq!(resolution.text.as_deref(), Some("Hello there"));
        assert!(resolution.tool_calls.is_empty());
    }

    #[test]
    fn malformed_completions_are_not_retryable() {
        let missing = parse_completion(&json!({"choices": []})).expect_err("no choices");
        assert!(!missing.is_retryable());

        let bad_args = parse_completion(&json!({
            "choices": [{"message": {"tool_calls": [{"function": {"name": "x", "arguments": "[1,2]"}}]}}]
        }))
        .expect_err("array arguments");
        assert!(matches!(bad_args, LlmError::Invalid(ref message) if message.contains("`x`")));
    }

    #[test]
    fn status_classification_drives_retry() {
        let limited = classify_status(StatusCode::TOO_MANY_REQUESTS, Some(7));
        assert_eq!(limited, LlmError::RateLimited { retry_after_secs: Some(7) });
        assert!(limited.is_retryable());
        assert!(classify_status(StatusCode::BAD_GATEWAY, None).is_retryable());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, None).is_retryable());
        assert!(LlmError::Timeout(100).is_retryable());
    }

    async fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut buffer = vec![0_u8; 16 * 1024];
            let mut received = Vec::new();
            loop {
                let read = stream.read(&mut buffer).await.expect("read");
                if read == 0 {
                    break;
                }
                received.extend_from_slice(&buffer[..read]);
                let text = String::from_utf8_lossy(&received);
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if received.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
            }
            let response = format!(
                "{status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.expect("write");
        });
        format!("http://{address}")
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            messages: vec![PromptMessage::new(MessageRole::User, "is main green?")],
            tools: vec![json!({"type": "function", "function": {"name": "ci_status"}})],
        }
    }

    #[tokio::test]
    async fn resolver_reads_tool_calls_over_http() {
        let base_url = serve_once(
            "HTTP/1.1 200 OK",
            r#"{"choices":[{"message":{"content":"","tool_calls":[{"id":"c1","function":{"name":"ci_status","arguments":"{}"}}]}}]}"#,
        )
        .await;
        let resolver = OpenAiCompatibleResolver::new(
            reqwest::Client::new(),
            &base_url,
            Some(SecretString::from("sk-test".to_string())),
            "gpt-4o-mini",
        );

        let resolution = resolver.resolve(&request()).await.expect("resolve");
        assert_eq!(resolution.tool_calls.len(), 1);
        assert_eq!(resolution.tool_calls[0].tool_name, "ci_status");
        assert!(resolver.endpoint().ends_with("/v1/chat/completions"));
    }

    #[tokio::test]
    async fn resolver_maps_http_429_to_rate_limited() {
        let base_url =
            serve_once("HTTP/1.1 429 Too Many Requests", r#"{"error":{"message":"slow down"}}"#)
                .await;
        let resolver =
            OpenAiCompatibleResolver::new(reqwest::Client::new(), &base_url, None, "llama3.1");

        let error = resolver.resolve(&request()).await.expect_err("429");
        assert!(matches!(error, LlmError::RateLimited { .. }));
    }
}

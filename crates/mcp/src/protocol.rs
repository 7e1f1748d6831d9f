use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::McpError;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self { jsonrpc: "2.0".to_string(), id, method: method.to_string(), params }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self { jsonrpc: "2.0".to_string(), id: Some(id), result: Some(result), error: None }
    }

    pub fn failure(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            result: None,
            error: Some(JsonRpcError { code, message: message.into(), data: None }),
        }
    }

    /// Unwraps `result`, turning an `error` object into `McpError::Server`.
    pub fn into_result(self) -> Result<Value, McpError> {
        if let Some(error) = self.error {
            return Err(McpError::Server {
                code: error.code,
                message: error.message,
                data: error.data,
            });
        }

        self.result.ok_or(McpError::Server {
            code: error_codes::INTERNAL_ERROR,
            message: "response missing both result and error".to_string(),
            data: None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "helmsman",
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InitializeResult {
    #[serde(default, rename = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default, rename = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema", alias = "input_schema")]
    pub input_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub uri: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "mimeType")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

impl CallToolResult {
    /// Text blocks joined by newlines; non-text blocks are skipped.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub(crate) fn parse_list<T>(result: Value, field: &str) -> Result<Vec<T>, McpError>
where
    T: for<'de> Deserialize<'de>,
{
    match result.get(field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(items) => serde_json::from_value(items.clone())
            .map_err(|error| McpError::Protocol(format!("malformed `{field}` list: {error}"))),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        error_codes, next_request_id, parse_list, CallToolResult, JsonRpcRequest, JsonRpcResponse,
        RemoteToolDefinition,
    };
    use crate::McpError;

    #[test]
    fn request_omits_absent_params() {
        let request = JsonRpcRequest::new(7, "tools/list", None);
        let encoded = serde_json::to_value(&request).expect("serialize");
        assert_eq!(encoded, json!({"jsonrpc": "2.0", "id": 7, "method": "tools/list"}));
    }

    #[test]
    fn request_ids_are_monotonic() {
        let first = next_request_id();
        let second = next_request_id();
        assert!(second > first);
    }

    #[test]
    fn error_response_becomes_server_error() {
        let response: JsonRpcResponse = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 2,
            "error": {"code": -32601, "message": "Method not found"}
        }))
        .expect("deserialize");

        match response.into_result() {
            Err(McpError::Server { code, message, .. }) => {
                assert_eq!(code, error_codes::METHOD_NOT_FOUND);
                assert_eq!(message, "Method not found");
            }
            other => panic!("expected server error, got {other:?}"),
        }
    }

    #[test]
    fn empty_response_is_an_internal_error() {
        let response = JsonRpcResponse { jsonrpc: "2.0".into(), id: Some(1), result: None, error: None };
        assert!(matches!(
            response.into_result(),
            Err(McpError::Server { code: error_codes::INTERNAL_ERROR, .. })
        ));
    }

    #[test]
    fn tool_list_accepts_camel_case_schema_and_missing_description() {
        let tools: Vec<RemoteToolDefinition> = parse_list(
            json!({"tools": [{"name": "search", "inputSchema": {"type": "object"}}]}),
            "tools",
        )
        .expect("parse");
        assert_eq!(tools[0].name, "search");
        assert_eq!(tools[0].description, "");
        assert_eq!(tools[0].input_schema, json!({"type": "object"}));

        let empty: Vec<RemoteToolDefinition> = parse_list(json!({}), "tools").expect("parse");
        assert!(empty.is_empty());
    }

    #[test]
    fn call_result_joins_text_blocks() {
        let result: CallToolResult = serde_json::from_value(json!({
            "content": [
                {"type": "text", "text": "build #41 passed"},
                {"type": "image", "data": "..."},
                {"type": "text", "text": "build #42 running"}
            ],
            "isError": false
        }))
        .expect("deserialize");
        assert_eq!(result.text(), "build #41 passed\nbuild #42 running");
        assert!(!result.is_error);
    }
}

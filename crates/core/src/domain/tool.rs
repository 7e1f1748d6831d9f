use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::domain::schema::{ParameterSchema, ValidationError};

pub type ToolParameters = Map<String, Value>;

/// Static description of a tool: what the intent resolver sees plus caching hints.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameter_schema: ParameterSchema,
    pub cacheable: bool,
    pub cache_ttl_secs: Option<u64>,
}

impl ToolDescriptor {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameter_schema: ParameterSchema,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameter_schema,
            cacheable: false,
            cache_ttl_secs: None,
        }
    }

    pub fn cacheable(mut self, ttl_secs: Option<u64>) -> Self {
        self.cacheable = true;
        self.cache_ttl_secs = ttl_secs;
        self
    }

    pub fn to_function_schema(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameter_schema.to_json(),
            }
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub tool_name: String,
    #[serde(default)]
    pub parameters: ToolParameters,
}

impl ToolCall {
    pub fn new(tool_name: impl Into<String>, parameters: ToolParameters) -> Self {
        Self { id: None, tool_name: tool_name.into(), parameters }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_text: Option<String>,
}

impl ToolResult {
    pub fn ok(data: Value) -> Self {
        Self { success: true, data: Some(data), error: None, display_text: None }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self { success: false, data: None, error: Some(error.into()), display_text: None }
    }

    pub fn with_display_text(mut self, text: impl Into<String>) -> Self {
        self.display_text = Some(text.into());
        self
    }

    /// Best human-readable rendering: display text, then error, then raw data.
    pub fn summary_text(&self) -> String {
        if let Some(text) = &self.display_text {
            return text.clone();
        }
        if let Some(error) = &self.error {
            return error.clone();
        }
        match &self.data {
            Some(Value::String(text)) => text.clone(),
            Some(data) => data.to_string(),
            None if self.success => "Done.".to_string(),
            None => "The tool failed without details.".to_string(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("tool `{tool}` failed: {message}")]
    Execution { tool: String, message: String },
    #[error("tool `{tool}` is unavailable: {message}")]
    Unavailable { tool: String, message: String },
}

impl ToolError {
    pub fn execution(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution { tool: tool.into(), message: message.into() }
    }

    pub fn unavailable(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable { tool: tool.into(), message: message.into() }
    }
}

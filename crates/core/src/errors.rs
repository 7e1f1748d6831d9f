use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::schema::ValidationError;
use crate::domain::tool::ToolError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitType {
    Duplicate,
    User,
    Api,
}

impl fmt::Display for RateLimitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Duplicate => "duplicate",
            Self::User => "user",
            Self::Api => "api",
        })
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{limit_type} rate limit exceeded; retry after {retry_after_secs}s")]
pub struct RateLimitError {
    pub limit_type: RateLimitType,
    pub retry_after_secs: u64,
}

impl RateLimitError {
    pub fn new(limit_type: RateLimitType, retry_after_secs: u64) -> Self {
        Self { limit_type, retry_after_secs }
    }

    /// Duplicates are dropped without telling the user anything.
    pub fn is_silent(&self) -> bool {
        self.limit_type == RateLimitType::Duplicate
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    RateLimited(#[from] RateLimitError),
    #[error("tool `{tool}` failed: {message}")]
    ToolExecution { tool: String, message: String },
    #[error("capability server connection failed: {0}")]
    Connection(String),
    #[error("operation timed out: {0}")]
    Timeout(String),
    #[error("intent resolution failed: {0}")]
    IntentResolution(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ToolError> for AgentError {
    fn from(value: ToolError) -> Self {
        match value {
            ToolError::Validation(error) => Self::Validation(error),
            ToolError::Execution { tool, message } => Self::ToolExecution { tool, message },
            ToolError::Unavailable { message, .. } => Self::Connection(message),
        }
    }
}

impl AgentError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::RateLimited(_) => "RATE_LIMITED",
            Self::ToolExecution { .. } => "TOOL_ERROR",
            Self::Connection(_) => "CONNECTION_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::IntentResolution(_) | Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Text safe to show in chat. Internal details never appear here.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(error) => format!("I couldn't use that input: {error}."),
            Self::RateLimited(error) => format!(
                "You're sending requests faster than I can handle. Please try again in {} seconds.",
                error.retry_after_secs.max(1)
            ),
            Self::ToolExecution { tool, .. } => format!("The `{tool}` tool ran into a problem."),
            Self::Connection(_) => "A connected service is unavailable right now.".to_string(),
            Self::Timeout(_) => "A connected service took too long to respond.".to_string(),
            Self::IntentResolution(_) => {
                "I couldn't reach the language model to understand that request.".to_string()
            }
            Self::Internal(_) => "An unexpected internal error occurred.".to_string(),
        }
    }

    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::Validation(_) => "Rephrase the request with the missing or corrected details.",
            Self::RateLimited(_) => "Wait a moment before sending another request.",
            Self::ToolExecution { .. } => {
                "Try again shortly, or check that the referenced item exists."
            }
            Self::Connection(_) | Self::Timeout(_) => "Try again in a few minutes.",
            Self::IntentResolution(_) => "Try again shortly.",
            Self::Internal(_) => "Try again, and contact an administrator if it keeps happening.",
        }
    }
}

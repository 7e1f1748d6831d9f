//! Capability-server client.
//!
//! Speaks JSON-RPC 2.0 to external MCP servers over one of three transports
//! and tracks one connection per configured server id.
//!
//! - `protocol`: request/response envelopes and MCP payloads
//! - `transport`: the `Connection` contract plus HTTP, event-stream and socket clients
//! - `manager`: the per-request `ConnectionManager`

pub mod manager;
pub mod protocol;
pub mod transport;

pub use manager::{ConnectionManager, ConnectionState, McpConnection};
pub use protocol::{CallToolResult, RemoteToolDefinition, Resource};
pub use transport::{Connection, Connector, TransportConnector};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum McpError {
    #[error("failed to connect to `{config_id}`: {reason}")]
    Connection { config_id: String, reason: String },

    #[error("{method} timed out after {timeout_ms}ms on {config_id}")]
    Timeout { method: String, timeout_ms: u64, config_id: String },

    #[error("transport failure on `{config_id}`: {reason}")]
    Transport { config_id: String, reason: String },

    #[error("server error [{code}]: {message}")]
    Server { code: i64, message: String, data: Option<serde_json::Value> },

    #[error("no open connection for `{0}`")]
    NotConnected(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl McpError {
    pub fn transport(config_id: &str, reason: impl Into<String>) -> Self {
        Self::Transport { config_id: config_id.to_string(), reason: reason.into() }
    }

    pub fn connection(config_id: &str, reason: impl Into<String>) -> Self {
        Self::Connection { config_id: config_id.to_string(), reason: reason.into() }
    }

    /// Stable classification used in logs and operator output.
    pub fn error_class(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Timeout { .. } => "timeout",
            Self::Transport { .. } => "transport",
            Self::Server { .. } => "server",
            Self::NotConnected(_) => "not_connected",
            Self::Protocol(_) => "protocol",
        }
    }
}

pub type McpResult<T> = Result<T, McpError>;

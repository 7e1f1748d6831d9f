pub mod audit;
pub mod config;
pub mod deadline;
pub mod domain;
pub mod errors;
pub mod fingerprint;
pub mod memory;
pub mod retry;
pub mod store;

pub use audit::{AuditContext, AuditError, AuditSink, ExecutionRecord, InMemoryAuditSink};
pub use config::{AppConfig, McpServerConfig, TransportKind};
pub use domain::schema::{ParameterSchema, PropertySchema, PropertyType, ValidationError};
pub use domain::tool::{ToolCall, ToolDescriptor, ToolError, ToolParameters, ToolResult};
pub use errors::{AgentError, RateLimitError, RateLimitType};
pub use memory::{ChatMessage, ConversationMemory, InMemoryConversationMemory, MessageRole};
pub use retry::{RetryPolicy, Retryable};
pub use store::{AtomicStore, InMemoryAtomicStore, StoreError};

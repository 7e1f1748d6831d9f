//! Agent execution framework.
//!
//! A message flows through a constrained loop:
//! 1. **Admission** (`admission`): duplicate suppression and per-user throttling
//! 2. **Intent resolution** (`llm`): the LLM picks zero or more tool calls
//! 3. **Tool execution** (`orchestrator`): validate, consult the cache, execute, audit
//! 4. **Response assembly** (`response`): one chat reply for the whole chain
//!
//! The LLM only selects tools and fills parameters. Every parameter is
//! checked against the tool's declared schema before anything runs.

pub mod admission;
pub mod cache;
pub mod context;
pub mod llm;
pub mod orchestrator;
pub mod remote;
pub mod response;
pub mod tools;

pub use admission::AdmissionController;
pub use cache::ToolCache;
pub use context::ExecutionContext;
pub use llm::{IntentResolver, LlmError, OpenAiCompatibleResolver, Resolution};
pub use orchestrator::{Orchestrator, OrchestratorSettings};
pub use remote::{discover_remote_tools, DiscoveryReport, RemoteTool};
pub use response::AgentResponse;
pub use tools::{RegistryError, Tool, ToolRegistry};

use std::sync::Arc;

use async_trait::async_trait;
use helmsman_core::config::{McpConfig, McpServerConfig};
use helmsman_core::domain::schema::ParameterSchema;
use helmsman_core::domain::tool::{ToolDescriptor, ToolError, ToolParameters, ToolResult};
use helmsman_mcp::{ConnectionManager, Connector, McpError, RemoteToolDefinition};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::context::ExecutionContext;
use crate::tools::{Tool, ToolRegistry};

/// A tool served by a capability server, registered as `<server_id>__<tool>`.
pub struct RemoteTool {
    server: McpServerConfig,
    remote_name: String,
    descriptor: ToolDescriptor,
}

impl RemoteTool {
    pub fn new(server: McpServerConfig, definition: RemoteToolDefinition) -> Self {
        let name = registry_name(&server.id, &definition.name);
        let descriptor = ToolDescriptor::new(
            name,
            definition.description.clone(),
            ParameterSchema::from_json(&definition.input_schema),
        );
        Self { server, remote_name: definition.name, descriptor }
    }

    pub fn server_id(&self) -> &str {
        &self.server.id
    }

    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }
}

/// Function names only allow `[A-Za-z0-9_-]`; anything else becomes `_`.
pub fn registry_name(server_id: &str, tool_name: &str) -> String {
    let sanitized = tool_name
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' { ch } else { '_' })
        .collect::<String>();
    format!("{server_id}__{sanitized}")
}

#[async_trait]
impl Tool for RemoteTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(
        &self,
        parameters: &ToolParameters,
        context: &ExecutionContext,
    ) -> Result<ToolResult, ToolError> {
        let tool = &self.descriptor.name;
        let Some(connections) = context.connections() else {
            return Err(ToolError::unavailable(tool, "no connection manager for this request"));
        };

        connections
            .connect(&self.server)
            .await
            .map_err(|error| ToolError::unavailable(tool, error.to_string()))?;

        let outcome = connections
            .call_tool(&self.server.id, &self.remote_name, Value::Object(parameters.clone()))
            .await
            .map_err(|error| match error {
                McpError::Server { .. } | McpError::Protocol(_) => {
                    ToolError::execution(tool, error.to_string())
                }
                other => ToolError::unavailable(tool, other.to_string()),
            })?;

        let text = outcome.text();
        if outcome.is_error {
            let message =
                if text.is_empty() { "the remote tool reported an error".to_string() } else { text };
            return Ok(ToolResult::failure(message));
        }

        let result = ToolResult::ok(json!({"content": text}));
        Ok(if text.is_empty() { result } else { result.with_display_text(text) })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub registered: Vec<String>,
    pub failed_servers: Vec<(String, String)>,
}

/// Lists tools on every configured server through a throwaway manager and
/// registers an adapter for each. A failing server is skipped.
pub async fn discover_remote_tools(
    connector: Arc<dyn Connector>,
    config: &McpConfig,
    registry: &mut ToolRegistry,
) -> DiscoveryReport {
    let mut report = DiscoveryReport::default();
    if config.servers.is_empty() {
        return report;
    }

    let manager = ConnectionManager::from_config(connector, config);
    let connected = manager.connect_all(&config.servers).await;

    for (server, (server_id, outcome)) in config.servers.iter().zip(connected) {
        let listed = match outcome {
            Ok(_) => manager.list_tools(&server_id).await,
            Err(error) => Err(error),
        };

        let definitions = match listed {
            Ok(definitions) => definitions,
            Err(error) => {
                warn!(
                    event_name = "agent.remote.discovery_failed",
                    config_id = %server_id,
                    error_class = error.error_class(),
                    error = %error,
                    "skipping capability server"
                );
                report.failed_servers.push((server_id, error.to_string()));
                continue;
            }
        };

        for definition in definitions {
            let tool = RemoteTool::new(server.clone(), definition);
            let name = tool.descriptor().name.clone();
            match registry.register(tool) {
                Ok(()) => report.registered.push(name),
                Err(error) => warn!(
                    event_name = "agent.remote.duplicate_tool",
                    config_id = %server_id,
                    error = %error,
                    "remote tool name collides with a registered tool"
                ),
            }
        }
    }

    manager.disconnect_all().await;
    info!(
        event_name = "agent.remote.discovered",
        registered = report.registered.len(),
        failed_servers = report.failed_servers.len(),
        "remote tool discovery finished"
    );
    report
}

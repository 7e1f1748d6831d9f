use std::sync::Arc;

use helmsman_agent::{discover_remote_tools, ToolRegistry};
use helmsman_core::config::LoadOptions;
use helmsman_mcp::TransportConnector;

use crate::commands::{load_config, runtime, CommandResult, EXIT_RUNTIME};

/// Connects to every configured capability server and lists the tool names
/// the agent would register. Fails only when every server is unreachable.
pub fn run(options: LoadOptions) -> CommandResult {
    let config = match load_config("tools", options) {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    if config.mcp.servers.is_empty() {
        return CommandResult::success("tools", "no capability servers configured");
    }
    let runtime = match runtime("tools") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let mut registry = ToolRegistry::new();
    let report = runtime.block_on(discover_remote_tools(
        Arc::new(TransportConnector::new()),
        &config.mcp,
        &mut registry,
    ));

    if report.failed_servers.len() == config.mcp.servers.len() {
        let reasons = report
            .failed_servers
            .iter()
            .map(|(server_id, reason)| format!("{server_id}: {reason}"))
            .collect::<Vec<_>>()
            .join("; ");
        return CommandResult::failure(
            "tools",
            "capability_servers",
            format!("no capability server answered ({reasons})"),
            EXIT_RUNTIME,
        );
    }

    let mut lines = vec![format!("{} remote tools registered", report.registered.len())];
    lines.extend(report.registered.iter().map(|name| format!("- {name}")));
    lines.extend(
        report
            .failed_servers
            .iter()
            .map(|(server_id, reason)| format!("! {server_id} skipped: {reason}")),
    );
    CommandResult::success("tools", lines.join("\n"))
}

use std::sync::Arc;
use std::time::Duration;

use helmsman_agent::{
    discover_remote_tools, AdmissionController, OpenAiCompatibleResolver, Orchestrator,
    OrchestratorSettings, ToolCache, ToolRegistry,
};
use helmsman_core::config::{AppConfig, ConfigError, LoadOptions};
use helmsman_db::{
    connect_with_settings, migrations, DbPool, SqlAtomicStore, SqlConversationRepository,
    SqlExecutionLogRepository,
};
use helmsman_mcp::{Connector, TransportConnector};
use helmsman_slack::{
    message_dispatcher, ReconnectPolicy, SlackSocketTransport, SlackWebClient, SocketModeRunner,
};
use thiserror::Error;
use tracing::info;

use crate::gateway::MessageGateway;

/// Every long-lived service, constructed once and shared through `Arc`s.
pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub store: Arc<SqlAtomicStore>,
    pub registry: Arc<ToolRegistry>,
    pub gateway: Arc<MessageGateway>,
    pub slack_runner: SocketModeRunner,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let http = reqwest::Client::new();
    let store = Arc::new(SqlAtomicStore::new(db_pool.clone()));
    let memory = Arc::new(SqlConversationRepository::new(db_pool.clone()));
    let audit = Arc::new(SqlExecutionLogRepository::new(db_pool.clone()));
    let connector: Arc<dyn Connector> = Arc::new(TransportConnector::with_client(http.clone()));

    let mut registry = ToolRegistry::new();
    let report = discover_remote_tools(connector.clone(), &config.mcp, &mut registry).await;
    let registry = Arc::new(registry);
    info!(
        event_name = "system.bootstrap.tools_registered",
        correlation_id = "bootstrap",
        tool_count = registry.len(),
        failed_servers = report.failed_servers.len(),
        "tool registry ready"
    );

    let orchestrator = Arc::new(Orchestrator::new(
        registry.clone(),
        Arc::new(OpenAiCompatibleResolver::from_config(&config.llm)),
        ToolCache::new(store.clone(), &config.cache),
        memory.clone(),
        audit,
        OrchestratorSettings {
            tool_timeout: Duration::from_millis(
                config.mcp.connect_timeout_ms.saturating_add(config.mcp.call_timeout_ms),
            ),
            ..OrchestratorSettings::from_llm_config(&config.llm)
        },
    ));

    let gateway = Arc::new(MessageGateway::new(
        orchestrator,
        AdmissionController::new(store.clone(), config.admission.clone()),
        memory,
        connector,
        config.mcp.clone(),
        config.llm.max_history_messages,
    ));

    let web = SlackWebClient::new(http, &config.slack);
    let slack_runner = SocketModeRunner::new(
        Arc::new(SlackSocketTransport::new(web.clone())),
        message_dispatcher(gateway.clone()),
        Arc::new(web),
        ReconnectPolicy::default(),
    );

    Ok(Application { config, db_pool, store, registry, gateway, slack_runner })
}

#[cfg(test)]
mod tests {
    use helmsman_core::config::{ConfigOverrides, LoadOptions};

    use crate::bootstrap::bootstrap;

    fn overrides(database_url: &str, app_token: &str) -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(database_url.to_string()),
                slack_app_token: Some(app_token.to_string()),
                slack_bot_token: Some("xoxb-test".to_string()),
                mcp_servers: Some(Vec::new()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_fails_fast_without_required_slack_tokens() {
        let result = bootstrap(overrides("sqlite::memory:", "invalid-token")).await;

        assert!(result.is_err());
        let message = result.err().expect("error").to_string();
        assert!(message.contains("slack.app_token"));
    }

    #[tokio::test]
    async fn bootstrap_wires_storage_and_an_empty_registry() {
        let app = bootstrap(overrides("sqlite::memory:", "xapp-test"))
            .await
            .expect("bootstrap should succeed with valid overrides");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN ('kv_store', 'tool_execution_log', 'conversation_message')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("tables should exist after bootstrap");
        assert_eq!(table_count, 3);
        assert!(app.registry.is_empty());

        app.db_pool.close().await;
    }
}

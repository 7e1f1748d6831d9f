mod bootstrap;
mod gateway;
mod health;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use helmsman_core::config::{AppConfig, LoadOptions};
use helmsman_db::SqlAtomicStore;
use tracing::{info, warn};

const STORE_PURGE_INTERVAL: Duration = Duration::from_secs(300);

fn init_logging(config: &AppConfig) {
    use helmsman_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;

    health::spawn(
        &app.config.server.bind_address,
        app.config.server.health_check_port,
        health::HealthState::new(app.db_pool.clone(), app.registry.clone()),
    )
    .await?;

    let purge = spawn_store_purge(app.store.clone());
    let runner = app.slack_runner;
    let mut slack = tokio::spawn(async move { runner.start().await });

    info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        tool_count = app.registry.len(),
        "helmsman-server started"
    );

    tokio::select! {
        signal = tokio::signal::ctrl_c() => signal?,
        _ = &mut slack => warn!(
            event_name = "system.server.slack_stopped",
            correlation_id = "runtime",
            "slack runner exited; waiting for shutdown signal"
        ),
    }

    info!(event_name = "system.server.stopping", correlation_id = "shutdown", "helmsman-server stopping");

    slack.abort();
    purge.abort();

    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    if tokio::time::timeout(grace, app.db_pool.close()).await.is_err() {
        warn!(
            event_name = "system.server.pool_close_timeout",
            correlation_id = "shutdown",
            grace_secs = grace.as_secs(),
            "database pool did not close within the grace period"
        );
    }
    Ok(())
}

fn spawn_store_purge(store: Arc<SqlAtomicStore>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STORE_PURGE_INTERVAL);
        loop {
            interval.tick().await;
            match store.purge_expired().await {
                Ok(purged) if purged > 0 => info!(
                    event_name = "system.store.purged",
                    correlation_id = "maintenance",
                    purged,
                    "expired store keys removed"
                ),
                Ok(_) => {}
                Err(error) => warn!(
                    event_name = "system.store.purge_failed",
                    correlation_id = "maintenance",
                    error = %error,
                    "expired store keys not removed"
                ),
            }
        }
    })
}

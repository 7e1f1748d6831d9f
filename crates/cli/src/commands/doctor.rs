use std::sync::Arc;

use helmsman_core::config::{AppConfig, LoadOptions};
use helmsman_db::connect_with_settings;
use helmsman_mcp::{ConnectionManager, TransportConnector};
use serde::Serialize;
use tokio::runtime::Runtime;

use crate::commands::{runtime, CommandResult, EXIT_CONFIG, EXIT_RUNTIME};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

impl DoctorCheck {
    fn new(name: &'static str, status: CheckStatus, details: impl Into<String>) -> Self {
        Self { name, status, details: details.into() }
    }
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

impl DoctorReport {
    fn from_checks(checks: Vec<DoctorCheck>) -> Self {
        let healthy = checks.iter().all(|check| check.status != CheckStatus::Fail);
        let (overall_status, summary) = if healthy {
            (CheckStatus::Pass, "doctor: all readiness checks passed")
        } else {
            (CheckStatus::Fail, "doctor: one or more readiness checks failed")
        };
        Self { overall_status, summary: summary.to_string(), checks }
    }

    fn failed(&self, name: &str) -> bool {
        self.checks.iter().any(|check| check.name == name && check.status == CheckStatus::Fail)
    }

    fn exit_code(&self) -> u8 {
        if self.failed("config_validation") {
            EXIT_CONFIG
        } else if self.overall_status == CheckStatus::Fail {
            EXIT_RUNTIME
        } else {
            0
        }
    }
}

pub fn run(options: LoadOptions, json_output: bool) -> CommandResult {
    let report = build_report(options);
    let exit_code = report.exit_code();

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
            )
        })
    } else {
        render_human(&report)
    };

    CommandResult { exit_code, output }
}

fn build_report(options: LoadOptions) -> DoctorReport {
    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => {
            let skipped = "skipped because configuration did not load";
            return DoctorReport::from_checks(vec![
                DoctorCheck::new("config_validation", CheckStatus::Fail, error.to_string()),
                DoctorCheck::new("database_connectivity", CheckStatus::Skipped, skipped),
                DoctorCheck::new("capability_servers", CheckStatus::Skipped, skipped),
            ]);
        }
    };

    let mut checks = vec![DoctorCheck::new(
        "config_validation",
        CheckStatus::Pass,
        "configuration loaded; slack tokens carry xapp-/xoxb- prefixes",
    )];

    match runtime("doctor") {
        Ok(runtime) => {
            checks.push(check_database_connectivity(&runtime, &config));
            checks.push(check_capability_servers(&runtime, &config));
        }
        Err(failure) => {
            checks.push(DoctorCheck::new("database_connectivity", CheckStatus::Fail, failure.output));
            checks.push(DoctorCheck::new(
                "capability_servers",
                CheckStatus::Skipped,
                "skipped because the async runtime did not start",
            ));
        }
    }

    DoctorReport::from_checks(checks)
}

fn check_database_connectivity(runtime: &Runtime, config: &AppConfig) -> DoctorCheck {
    let result = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| format!("failed to connect to database: {error}"))?;
        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|error| format!("database did not answer: {error}"))?;
        pool.close().await;
        Ok::<(), String>(())
    });

    match result {
        Ok(()) => DoctorCheck::new(
            "database_connectivity",
            CheckStatus::Pass,
            format!("connected using `{}`", config.database.url),
        ),
        Err(error) => DoctorCheck::new("database_connectivity", CheckStatus::Fail, error),
    }
}

fn check_capability_servers(runtime: &Runtime, config: &AppConfig) -> DoctorCheck {
    if config.mcp.servers.is_empty() {
        return DoctorCheck::new(
            "capability_servers",
            CheckStatus::Skipped,
            "no capability servers configured",
        );
    }

    let failures = runtime.block_on(async {
        let manager = ConnectionManager::from_config(Arc::new(TransportConnector::new()), &config.mcp);
        let failures = manager
            .connect_all(&config.mcp.servers)
            .await
            .into_iter()
            .filter_map(|(server_id, outcome)| {
                outcome.err().map(|error| format!("{server_id}: {error}"))
            })
            .collect::<Vec<_>>();
        manager.disconnect_all().await;
        failures
    });

    let total = config.mcp.servers.len();
    if failures.is_empty() {
        DoctorCheck::new(
            "capability_servers",
            CheckStatus::Pass,
            format!("{total} of {total} servers completed the handshake"),
        )
    } else {
        DoctorCheck::new(
            "capability_servers",
            CheckStatus::Fail,
            format!("{} of {total} servers failed: {}", failures.len(), failures.join("; ")),
        )
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = vec![report.summary.clone()];

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

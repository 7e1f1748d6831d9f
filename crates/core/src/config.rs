use std::collections::{BTreeMap, HashSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub slack: SlackConfig,
    pub llm: LlmConfig,
    pub admission: AdmissionConfig,
    pub cache: CacheConfig,
    pub mcp: McpConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct SlackConfig {
    pub app_token: SecretString,
    pub bot_token: SecretString,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_history_messages: usize,
}

impl LlmConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries.saturating_add(1),
            base_delay_ms: self.retry_base_delay_ms,
            max_delay_ms: self.retry_max_delay_ms,
            backoff_multiplier: self.backoff_multiplier,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdmissionConfig {
    pub dedup_ttl_secs: u64,
    pub user_window_secs: u64,
    pub user_max_requests: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    pub enabled: bool,
    pub default_ttl_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct McpConfig {
    pub connect_timeout_ms: u64,
    pub call_timeout_ms: u64,
    pub servers: Vec<McpServerConfig>,
}

/// One external capability server the agent may talk to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub id: String,
    pub transport: TransportKind,
    /// URL for `http`/`event_stream`, `host:port` for `socket`.
    pub endpoint: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Http,
    EventStream,
    Socket,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::EventStream => "event_stream",
            Self::Socket => "socket",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub health_check_port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    OpenAi,
    Ollama,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub llm_api_key: Option<String>,
    pub slack_app_token: Option<String>,
    pub slack_bot_token: Option<String>,
    pub cache_enabled: Option<bool>,
    pub user_max_requests: Option<u32>,
    pub mcp_servers: Option<Vec<McpServerConfig>>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://helmsman.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            slack: SlackConfig { app_token: String::new().into(), bot_token: String::new().into() },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434".to_string()),
                model: "llama3.1".to_string(),
                timeout_secs: 30,
                max_retries: 2,
                retry_base_delay_ms: 1_000,
                retry_max_delay_ms: 10_000,
                backoff_multiplier: 2.0,
                max_history_messages: 10,
            },
            admission: AdmissionConfig {
                dedup_ttl_secs: 120,
                user_window_secs: 60,
                user_max_requests: 10,
            },
            cache: CacheConfig { enabled: true, default_ttl_secs: 300 },
            mcp: McpConfig { connect_timeout_ms: 5_000, call_timeout_ms: 30_000, servers: Vec::new() },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                health_check_port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("helmsman.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(slack) = patch.slack {
            if let Some(app_token) = slack.app_token {
                self.slack.app_token = secret_value(app_token);
            }
            if let Some(bot_token) = slack.bot_token {
                self.slack.bot_token = secret_value(bot_token);
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(api_key) = llm.api_key {
                self.llm.api_key = Some(secret_value(api_key));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = llm.max_retries {
                self.llm.max_retries = max_retries;
            }
            if let Some(retry_base_delay_ms) = llm.retry_base_delay_ms {
                self.llm.retry_base_delay_ms = retry_base_delay_ms;
            }
            if let Some(retry_max_delay_ms) = llm.retry_max_delay_ms {
                self.llm.retry_max_delay_ms = retry_max_delay_ms;
            }
            if let Some(backoff_multiplier) = llm.backoff_multiplier {
                self.llm.backoff_multiplier = backoff_multiplier;
            }
            if let Some(max_history_messages) = llm.max_history_messages {
                self.llm.max_history_messages = max_history_messages;
            }
        }

        if let Some(admission) = patch.admission {
            if let Some(dedup_ttl_secs) = admission.dedup_ttl_secs {
                self.admission.dedup_ttl_secs = dedup_ttl_secs;
            }
            if let Some(user_window_secs) = admission.user_window_secs {
                self.admission.user_window_secs = user_window_secs;
            }
            if let Some(user_max_requests) = admission.user_max_requests {
                self.admission.user_max_requests = user_max_requests;
            }
        }

        if let Some(cache) = patch.cache {
            if let Some(enabled) = cache.enabled {
                self.cache.enabled = enabled;
            }
            if let Some(default_ttl_secs) = cache.default_ttl_secs {
                self.cache.default_ttl_secs = default_ttl_secs;
            }
        }

        if let Some(mcp) = patch.mcp {
            if let Some(connect_timeout_ms) = mcp.connect_timeout_ms {
                self.mcp.connect_timeout_ms = connect_timeout_ms;
            }
            if let Some(call_timeout_ms) = mcp.call_timeout_ms {
                self.mcp.call_timeout_ms = call_timeout_ms;
            }
            if let Some(servers) = mcp.servers {
                self.mcp.servers = servers;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("HELMSMAN_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("HELMSMAN_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("HELMSMAN_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("HELMSMAN_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("HELMSMAN_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("HELMSMAN_SLACK_APP_TOKEN") {
            self.slack.app_token = secret_value(value);
        }
        if let Some(value) = read_env("HELMSMAN_SLACK_BOT_TOKEN") {
            self.slack.bot_token = secret_value(value);
        }

        if let Some(value) = read_env("HELMSMAN_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("HELMSMAN_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("HELMSMAN_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("HELMSMAN_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("HELMSMAN_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("HELMSMAN_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("HELMSMAN_LLM_MAX_RETRIES") {
            self.llm.max_retries = parse_u32("HELMSMAN_LLM_MAX_RETRIES", &value)?;
        }

        if let Some(value) = read_env("HELMSMAN_ADMISSION_DEDUP_TTL_SECS") {
            self.admission.dedup_ttl_secs = parse_u64("HELMSMAN_ADMISSION_DEDUP_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("HELMSMAN_ADMISSION_USER_WINDOW_SECS") {
            self.admission.user_window_secs =
                parse_u64("HELMSMAN_ADMISSION_USER_WINDOW_SECS", &value)?;
        }
        if let Some(value) = read_env("HELMSMAN_ADMISSION_USER_MAX_REQUESTS") {
            self.admission.user_max_requests =
                parse_u32("HELMSMAN_ADMISSION_USER_MAX_REQUESTS", &value)?;
        }

        if let Some(value) = read_env("HELMSMAN_CACHE_ENABLED") {
            self.cache.enabled = parse_bool("HELMSMAN_CACHE_ENABLED", &value)?;
        }
        if let Some(value) = read_env("HELMSMAN_CACHE_DEFAULT_TTL_SECS") {
            self.cache.default_ttl_secs = parse_u64("HELMSMAN_CACHE_DEFAULT_TTL_SECS", &value)?;
        }

        if let Some(value) = read_env("HELMSMAN_MCP_CONNECT_TIMEOUT_MS") {
            self.mcp.connect_timeout_ms = parse_u64("HELMSMAN_MCP_CONNECT_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read_env("HELMSMAN_MCP_CALL_TIMEOUT_MS") {
            self.mcp.call_timeout_ms = parse_u64("HELMSMAN_MCP_CALL_TIMEOUT_MS", &value)?;
        }

        if let Some(value) = read_env("HELMSMAN_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("HELMSMAN_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port =
                parse_u16("HELMSMAN_SERVER_HEALTH_CHECK_PORT", &value)?;
        }
        if let Some(value) = read_env("HELMSMAN_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("HELMSMAN_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level =
            read_env("HELMSMAN_LOGGING_LEVEL").or_else(|| read_env("HELMSMAN_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("HELMSMAN_LOGGING_FORMAT").or_else(|| read_env("HELMSMAN_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(llm_api_key) = overrides.llm_api_key {
            self.llm.api_key = Some(secret_value(llm_api_key));
        }
        if let Some(slack_app_token) = overrides.slack_app_token {
            self.slack.app_token = secret_value(slack_app_token);
        }
        if let Some(slack_bot_token) = overrides.slack_bot_token {
            self.slack.bot_token = secret_value(slack_bot_token);
        }
        if let Some(cache_enabled) = overrides.cache_enabled {
            self.cache.enabled = cache_enabled;
        }
        if let Some(user_max_requests) = overrides.user_max_requests {
            self.admission.user_max_requests = user_max_requests;
        }
        if let Some(mcp_servers) = overrides.mcp_servers {
            self.mcp.servers = mcp_servers;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_slack(&self.slack)?;
        validate_llm(&self.llm)?;
        validate_admission(&self.admission)?;
        validate_cache(&self.cache)?;
        validate_mcp(&self.mcp)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("helmsman.toml"), PathBuf::from("config/helmsman.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_slack(slack: &SlackConfig) -> Result<(), ConfigError> {
    let app_token = slack.app_token.expose_secret();
    if app_token.is_empty() {
        return Err(ConfigError::Validation(
            "slack.app_token is required. Get it from https://api.slack.com/apps > Your App > Basic Information > App-Level Tokens".to_string()
        ));
    }
    if !app_token.starts_with("xapp-") {
        let hint = if app_token.starts_with("xoxb-") {
            " (hint: you may have used the bot token instead of the app token)"
        } else {
            ""
        };
        return Err(ConfigError::Validation(format!(
            "slack.app_token must start with `xapp-`{hint}. Get it from https://api.slack.com/apps"
        )));
    }

    let bot_token = slack.bot_token.expose_secret();
    if bot_token.is_empty() {
        return Err(ConfigError::Validation(
            "slack.bot_token is required. Get it from https://api.slack.com/apps > Your App > OAuth & Permissions > Bot User OAuth Token".to_string()
        ));
    }
    if !bot_token.starts_with("xoxb-") {
        let hint = if bot_token.starts_with("xapp-") {
            " (hint: you may have used the app token instead of the bot token)"
        } else {
            ""
        };
        return Err(ConfigError::Validation(format!(
            "slack.bot_token must start with `xoxb-`{hint}. Get it from https://api.slack.com/apps"
        )));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if llm.max_retries > 10 {
        return Err(ConfigError::Validation("llm.max_retries must be at most 10".to_string()));
    }

    if !(llm.backoff_multiplier >= 1.0 && llm.backoff_multiplier.is_finite()) {
        return Err(ConfigError::Validation(
            "llm.backoff_multiplier must be a finite number >= 1.0".to_string(),
        ));
    }

    if llm.retry_max_delay_ms < llm.retry_base_delay_ms {
        return Err(ConfigError::Validation(
            "llm.retry_max_delay_ms must be >= llm.retry_base_delay_ms".to_string(),
        ));
    }

    if llm.max_history_messages == 0 {
        return Err(ConfigError::Validation(
            "llm.max_history_messages must be greater than zero".to_string(),
        ));
    }

    match llm.provider {
        LlmProvider::OpenAi => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for the openai provider".to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for ollama provider".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn validate_admission(admission: &AdmissionConfig) -> Result<(), ConfigError> {
    if admission.dedup_ttl_secs == 0 {
        return Err(ConfigError::Validation(
            "admission.dedup_ttl_secs must be greater than zero".to_string(),
        ));
    }
    if admission.user_window_secs == 0 {
        return Err(ConfigError::Validation(
            "admission.user_window_secs must be greater than zero".to_string(),
        ));
    }
    if admission.user_max_requests == 0 {
        return Err(ConfigError::Validation(
            "admission.user_max_requests must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_cache(cache: &CacheConfig) -> Result<(), ConfigError> {
    if cache.default_ttl_secs == 0 {
        return Err(ConfigError::Validation(
            "cache.default_ttl_secs must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_mcp(mcp: &McpConfig) -> Result<(), ConfigError> {
    if mcp.connect_timeout_ms == 0 || mcp.call_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "mcp.connect_timeout_ms and mcp.call_timeout_ms must be greater than zero".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for server in &mcp.servers {
        let valid_id = !server.id.is_empty()
            && server.id.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
        if !valid_id {
            return Err(ConfigError::Validation(format!(
                "mcp.servers id `{}` must be non-empty and use only [A-Za-z0-9_-]",
                server.id
            )));
        }
        if !seen.insert(server.id.as_str()) {
            return Err(ConfigError::Validation(format!(
                "mcp.servers id `{}` is declared more than once",
                server.id
            )));
        }

        let endpoint = server.endpoint.trim();
        match server.transport {
            TransportKind::Http | TransportKind::EventStream => {
                if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                    return Err(ConfigError::Validation(format!(
                        "mcp.servers `{}` endpoint must start with http:// or https://",
                        server.id
                    )));
                }
            }
            TransportKind::Socket => {
                let host_port = endpoint
                    .rsplit_once(':')
                    .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
                if endpoint.contains("://") || !host_port {
                    return Err(ConfigError::Validation(format!(
                        "mcp.servers `{}` socket endpoint must be `host:port`",
                        server.id
                    )));
                }
            }
        }
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.health_check_port == 0 {
        return Err(ConfigError::Validation(
            "server.health_check_port must be greater than zero".to_string(),
        ));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    slack: Option<SlackPatch>,
    llm: Option<LlmPatch>,
    admission: Option<AdmissionPatch>,
    cache: Option<CachePatch>,
    mcp: Option<McpPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct SlackPatch {
    app_token: Option<String>,
    bot_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    retry_max_delay_ms: Option<u64>,
    backoff_multiplier: Option<f64>,
    max_history_messages: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct AdmissionPatch {
    dedup_ttl_secs: Option<u64>,
    user_window_secs: Option<u64>,
    user_max_requests: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct CachePatch {
    enabled: Option<bool>,
    default_ttl_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct McpPatch {
    connect_timeout_ms: Option<u64>,
    call_timeout_ms: Option<u64>,
    servers: Option<Vec<McpServerConfig>>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    health_check_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

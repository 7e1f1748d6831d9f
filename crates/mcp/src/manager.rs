use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::join_all;
use helmsman_core::config::{McpConfig, McpServerConfig, TransportKind};
use helmsman_core::deadline::with_timeout;
use serde_json::Value;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::protocol::{
    initialize_params, next_request_id, parse_list, CallToolResult, InitializeResult,
    JsonRpcRequest, RemoteToolDefinition, Resource, ServerInfo,
};
use crate::transport::{Connection, Connector};
use crate::McpError;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5_000);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(30_000);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Failed,
    Closed,
}

/// A handshaken client for one configured server.
pub struct McpConnection {
    config_id: String,
    transport: TransportKind,
    client: Arc<dyn Connection>,
    capabilities: Value,
    server_info: Option<ServerInfo>,
    state: RwLock<ConnectionState>,
}

impl McpConnection {
    fn new(config_id: &str, client: Arc<dyn Connection>, init: InitializeResult) -> Self {
        Self {
            config_id: config_id.to_string(),
            transport: client.transport(),
            client,
            capabilities: init.capabilities,
            server_info: init.server_info,
            state: RwLock::new(ConnectionState::Connected),
        }
    }

    pub fn config_id(&self) -> &str {
        &self.config_id
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn capabilities(&self) -> &Value {
        &self.capabilities
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    pub fn state(&self) -> ConnectionState {
        match self.state.read() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_state(&self, next: ConnectionState) {
        match self.state.write() {
            Ok(mut state) => *state = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }
}

type Slot = Arc<OnceCell<Arc<McpConnection>>>;

/// Owns at most one connection per server id. Built per request and torn
/// down with `disconnect_all`; never shared between users.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    call_timeout: Duration,
    slots: Mutex<HashMap<String, Slot>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self::with_timeouts(connector, DEFAULT_CONNECT_TIMEOUT, DEFAULT_CALL_TIMEOUT)
    }

    pub fn with_timeouts(
        connector: Arc<dyn Connector>,
        connect_timeout: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self { connector, connect_timeout, call_timeout, slots: Mutex::new(HashMap::new()) }
    }

    pub fn from_config(connector: Arc<dyn Connector>, config: &McpConfig) -> Self {
        Self::with_timeouts(
            connector,
            Duration::from_millis(config.connect_timeout_ms),
            Duration::from_millis(config.call_timeout_ms),
        )
    }

    /// Returns the existing connection for `config.id`, or opens one and runs
    /// the `initialize` handshake within the connect timeout. Concurrent
    /// callers for the same id share a single handshake. A connection that
    /// failed or was closed is replaced with a fresh handshake.
    pub async fn connect(&self, config: &McpServerConfig) -> Result<Arc<McpConnection>, McpError> {
        let (slot, stale) = {
            let mut slots = self.slots.lock().await;
            let stale = slots
                .get(&config.id)
                .and_then(|slot| slot.get())
                .filter(|connection| connection.state() != ConnectionState::Connected)
                .cloned();
            if stale.is_some() {
                slots.remove(&config.id);
            }
            let slot =
                slots.entry(config.id.clone()).or_insert_with(|| Arc::new(OnceCell::new())).clone();
            (slot, stale)
        };

        if let Some(stale) = stale {
            info!(
                event_name = "mcp.connection.replacing",
                config_id = %config.id,
                previous_state = ?stale.state(),
                "replacing unusable capability server connection"
            );
            if stale.state() != ConnectionState::Closed {
                close_connection(&stale).await;
            }
        }

        match slot.get_or_try_init(|| self.handshake(config)).await {
            Ok(connection) => {
                let connection = connection.clone();
                let still_owned = {
                    let slots = self.slots.lock().await;
                    slots.get(&config.id).is_some_and(|current| Arc::ptr_eq(current, &slot))
                };
                if still_owned {
                    return Ok(connection);
                }

                // The slot was drained by a disconnect while the handshake ran.
                close_connection(&connection).await;
                Err(McpError::connection(
                    &config.id,
                    "connection was torn down while the handshake was in flight",
                ))
            }
            Err(error) => {
                let mut slots = self.slots.lock().await;
                if slots.get(&config.id).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
                    slots.remove(&config.id);
                }
                warn!(
                    event_name = "mcp.connection.failed",
                    config_id = %config.id,
                    transport = config.transport.as_str(),
                    error_class = error.error_class(),
                    error = %error,
                    "capability server connection failed"
                );
                Err(error)
            }
        }
    }

    /// Connects to every server concurrently. One server failing does not
    /// affect the others; results come back in input order.
    pub async fn connect_all(
        &self,
        configs: &[McpServerConfig],
    ) -> Vec<(String, Result<Arc<McpConnection>, McpError>)> {
        let attempts = configs.iter().map(|config| async move {
            (config.id.clone(), self.connect(config).await)
        });
        join_all(attempts).await
    }

    async fn handshake(&self, config: &McpServerConfig) -> Result<Arc<McpConnection>, McpError> {
        let timeout_ms = self.connect_timeout.as_millis() as u64;
        let connection = with_timeout(self.connect_timeout, self.open_and_initialize(config), || {
            McpError::Timeout {
                method: "initialize".to_string(),
                timeout_ms,
                config_id: config.id.clone(),
            }
        })
        .await?;

        info!(
            event_name = "mcp.connection.opened",
            config_id = %config.id,
            transport = config.transport.as_str(),
            server_name = connection
                .server_info()
                .and_then(|info| info.name.as_deref())
                .unwrap_or("unknown"),
            "capability server connected"
        );
        Ok(connection)
    }

    async fn open_and_initialize(
        &self,
        config: &McpServerConfig,
    ) -> Result<Arc<McpConnection>, McpError> {
        let client = self.connector.open(config).await?;
        let request = JsonRpcRequest::new(next_request_id(), "initialize", Some(initialize_params()));

        let init = match client.send(request).await.and_then(|response| response.into_result()) {
            Ok(result) => serde_json::from_value::<InitializeResult>(result).map_err(|error| {
                McpError::Protocol(format!("malformed initialize result: {error}"))
            }),
            Err(error) => Err(error),
        };

        let init = match init {
            Ok(init) => init,
            Err(error) => {
                if let Err(close_error) = client.close().await {
                    debug!(
                        event_name = "mcp.connection.close_failed",
                        config_id = %config.id,
                        error = %close_error,
                        "closing half-open client failed"
                    );
                }
                return Err(error);
            }
        };

        if let Err(error) = client.notify("notifications/initialized", None).await {
            debug!(
                event_name = "mcp.connection.notify_failed",
                config_id = %config.id,
                error = %error,
                "initialized notification was not delivered"
            );
        }

        Ok(Arc::new(McpConnection::new(&config.id, client, init)))
    }

    async fn connected(&self, config_id: &str) -> Result<Arc<McpConnection>, McpError> {
        let slots = self.slots.lock().await;
        let connection = slots
            .get(config_id)
            .and_then(|slot| slot.get())
            .cloned()
            .ok_or_else(|| McpError::NotConnected(config_id.to_string()))?;

        if connection.state() != ConnectionState::Connected {
            return Err(McpError::NotConnected(config_id.to_string()));
        }
        Ok(connection)
    }

    /// Sends one request on an existing connection, bounded by the call timeout.
    pub async fn execute_call(
        &self,
        config_id: &str,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, McpError> {
        let connection = self.connected(config_id).await?;
        let request = JsonRpcRequest::new(next_request_id(), method, params);
        let timeout_ms = self.call_timeout.as_millis() as u64;

        let outcome = with_timeout(self.call_timeout, connection.client.send(request), || {
            McpError::Timeout {
                method: method.to_string(),
                timeout_ms,
                config_id: config_id.to_string(),
            }
        })
        .await;

        match outcome {
            Ok(response) => response.into_result(),
            Err(error @ McpError::Transport { .. }) => {
                connection.set_state(ConnectionState::Failed);
                warn!(
                    event_name = "mcp.connection.transport_failed",
                    config_id,
                    method,
                    error = %error,
                    "capability server transport failed; connection marked failed"
                );
                Err(error)
            }
            Err(error) => {
                if matches!(error, McpError::Timeout { .. }) {
                    warn!(event_name = "mcp.call.timeout", config_id, method, timeout_ms, "call timed out");
                }
                Err(error)
            }
        }
    }

    pub async fn list_tools(&self, config_id: &str) -> Result<Vec<RemoteToolDefinition>, McpError> {
        let result = self.execute_call(config_id, "tools/list", None).await?;
        parse_list(result, "tools")
    }

    /// Resource listing is optional for servers: any failure yields an empty list.
    pub async fn get_resources(&self, config_id: &str) -> Vec<Resource> {
        let listed = match self.execute_call(config_id, "resources/list", None).await {
            Ok(result) => parse_list(result, "resources"),
            Err(error) => Err(error),
        };

        match listed {
            Ok(resources) => resources,
            Err(error) => {
                debug!(
                    event_name = "mcp.resources.unavailable",
                    config_id,
                    error = %error,
                    "resource listing failed; treating as empty"
                );
                Vec::new()
            }
        }
    }

    pub async fn call_tool(
        &self,
        config_id: &str,
        name: &str,
        arguments: Value,
    ) -> Result<CallToolResult, McpError> {
        let params = serde_json::json!({"name": name, "arguments": arguments});
        let result = self.execute_call(config_id, "tools/call", Some(params)).await?;
        serde_json::from_value(result)
            .map_err(|error| McpError::Protocol(format!("malformed tools/call result: {error}")))
    }

    /// Closes and forgets the connection. Close errors are logged, never returned.
    pub async fn disconnect(&self, config_id: &str) {
        let slot = self.slots.lock().await.remove(config_id);
        let Some(connection) = slot.and_then(|slot| slot.get().cloned()) else {
            return;
        };
        close_connection(&connection).await;
    }

    /// Closes every connection concurrently, then empties the map regardless
    /// of individual close failures. A handshake still in flight finds its
    /// slot gone when it completes and closes its own client.
    pub async fn disconnect_all(&self) {
        let drained = {
            let mut slots = self.slots.lock().await;
            slots.drain().collect::<Vec<_>>()
        };

        let connections =
            drained.iter().filter_map(|(_, slot)| slot.get().cloned()).collect::<Vec<_>>();
        join_all(connections.iter().map(|connection| close_connection(connection))).await;

        self.slots.lock().await.clear();
    }

    pub async fn connection_state(&self, config_id: &str) -> Option<ConnectionState> {
        let slots = self.slots.lock().await;
        slots.get(config_id).map(|slot| match slot.get() {
            Some(connection) => connection.state(),
            None => ConnectionState::Connecting,
        })
    }

    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.lock().await.is_empty()
    }

    pub async fn connected_ids(&self) -> Vec<String> {
        let slots = self.slots.lock().await;
        let mut ids = slots
            .iter()
            .filter(|(_, slot)| {
                slot.get().is_some_and(|connection| connection.state() == ConnectionState::Connected)
            })
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }
}

async fn close_connection(connection: &McpConnection) {
    match connection.client.close().await {
        Ok(()) => {
            info!(
                event_name = "mcp.connection.closed",
                config_id = %connection.config_id,
                "capability server disconnected"
            );
        }
        Err(error) => {
            warn!(
                event_name = "mcp.connection.close_failed",
                config_id = %connection.config_id,
                error = %error,
                "closing capability server connection failed"
            );
        }
    }
    connection.set_state(ConnectionState::Closed);
}

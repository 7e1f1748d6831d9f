use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use helmsman_core::config::{McpServerConfig, TransportKind};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::McpError;

const SESSION_HEADER: &str = "mcp-session-id";

/// One open client to a capability server. Requests are answered in order;
/// implementations skip frames whose id does not match the outstanding request.
#[async_trait]
pub trait Connection: Send + Sync {
    fn transport(&self) -> TransportKind;

    async fn send(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, McpError>;

    /// Fire-and-forget JSON-RPC notification.
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError>;

    async fn close(&self) -> Result<(), McpError>;
}

/// Builds transport clients from server config. Swapped for a scripted
/// connector in tests.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, config: &McpServerConfig) -> Result<Arc<dyn Connection>, McpError>;
}

#[derive(Clone, Default)]
pub struct TransportConnector {
    client: Client,
}

impl TransportConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Connector for TransportConnector {
    async fn open(&self, config: &McpServerConfig) -> Result<Arc<dyn Connection>, McpError> {
        let connection: Arc<dyn Connection> = match config.transport {
            TransportKind::Http => {
                Arc::new(HttpConnection::new(HttpEndpoint::new(config, self.client.clone())))
            }
            TransportKind::EventStream => Arc::new(EventStreamConnection::new(HttpEndpoint::new(
                config,
                self.client.clone(),
            ))),
            TransportKind::Socket => {
                Arc::new(SocketConnection::connect(&config.id, &config.endpoint).await?)
            }
        };
        Ok(connection)
    }
}

fn notification(method: &str, params: Option<Value>) -> Value {
    match params {
        Some(params) => json!({"jsonrpc": "2.0", "method": method, "params": params}),
        None => json!({"jsonrpc": "2.0", "method": method}),
    }
}

struct HttpEndpoint {
    config_id: String,
    url: String,
    headers: BTreeMap<String, String>,
    client: Client,
    session_id: Mutex<Option<String>>,
}

impl HttpEndpoint {
    fn new(config: &McpServerConfig, client: Client) -> Self {
        Self {
            config_id: config.id.clone(),
            url: config.endpoint.clone(),
            headers: config.headers.clone(),
            client,
            session_id: Mutex::new(None),
        }
    }

    fn session_id(&self) -> Option<String> {
        match self.session_id.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn remember_session(&self, response: &reqwest::Response) {
        let Some(value) = response.headers().get(SESSION_HEADER) else {
            return;
        };
        let Ok(value) = value.to_str() else {
            return;
        };
        match self.session_id.lock() {
            Ok(mut guard) => *guard = Some(value.to_string()),
            Err(poisoned) => *poisoned.into_inner() = Some(value.to_string()),
        }
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        body: &T,
        accept: &str,
    ) -> Result<reqwest::Response, McpError> {
        let mut request = self.client.post(&self.url).header(ACCEPT, accept).json(body);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(session_id) = self.session_id() {
            request = request.header(SESSION_HEADER, session_id);
        }

        let response = request
            .send()
            .await
            .map_err(|error| McpError::transport(&self.config_id, error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(McpError::transport(
                &self.config_id,
                format!("server responded with HTTP {status}"),
            ));
        }

        self.remember_session(&response);
        Ok(response)
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        self.post(&notification(method, params), "application/json, text/event-stream").await?;
        Ok(())
    }

    fn is_json(response: &reqwest::Response) -> bool {
        response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("application/json"))
    }
}

/// Plain request/response: one POST per call, JSON body back.
pub struct HttpConnection {
    endpoint: HttpEndpoint,
}

impl HttpConnection {
    fn new(endpoint: HttpEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl Connection for HttpConnection {
    fn transport(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn send(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, McpError> {
        let response = self.endpoint.post(&request, "application/json").await?;
        response.json::<JsonRpcResponse>().await.map_err(|error| {
            McpError::Protocol(format!(
                "invalid JSON-RPC body from `{}`: {error}",
                self.endpoint.config_id
            ))
        })
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        self.endpoint.notify(method, params).await
    }

    async fn close(&self) -> Result<(), McpError> {
        Ok(())
    }
}

/// POSTs each request and reads the `text/event-stream` reply until the
/// frame carrying the matching id arrives.
pub struct EventStreamConnection {
    endpoint: HttpEndpoint,
}

impl EventStreamConnection {
    fn new(endpoint: HttpEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl Connection for EventStreamConnection {
    fn transport(&self) -> TransportKind {
        TransportKind::EventStream
    }

    async fn send(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, McpError> {
        let id = request.id;
        let mut response =
            self.endpoint.post(&request, "application/json, text/event-stream").await?;

        // Servers may answer a single request with a plain JSON body.
        if HttpEndpoint::is_json(&response) {
            return response.json::<JsonRpcResponse>().await.map_err(|error| {
                McpError::Protocol(format!(
                    "invalid JSON-RPC body from `{}`: {error}",
                    self.endpoint.config_id
                ))
            });
        }

        let mut decoder = EventStreamDecoder::default();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|error| McpError::transport(&self.endpoint.config_id, error.to_string()))?
        {
            for payload in decoder.push(&chunk) {
                if let Some(matched) = match_response(&payload, id) {
                    return Ok(matched);
                }
            }
        }

        for payload in decoder.finish() {
            if let Some(matched) = match_response(&payload, id) {
                return Ok(matched);
            }
        }

        Err(McpError::transport(
            &self.endpoint.config_id,
            "event stream ended before a matching response arrived",
        ))
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        self.endpoint.notify(method, params).await
    }

    async fn close(&self) -> Result<(), McpError> {
        Ok(())
    }
}

fn match_response(payload: &str, id: u64) -> Option<JsonRpcResponse> {
    match serde_json::from_str::<JsonRpcResponse>(payload) {
        Ok(response) if response.id == Some(id) => Some(response),
        Ok(_) => None,
        Err(error) => {
            debug!(event_name = "mcp.transport.frame_skipped", error = %error, "non JSON-RPC frame");
            None
        }
    }
}

/// Incremental `text/event-stream` decoder yielding the joined `data:` payload
/// of each complete event.
#[derive(Debug, Default)]
pub(crate) struct EventStreamDecoder {
    pending: Vec<u8>,
    data_lines: Vec<String>,
}

impl EventStreamDecoder {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(position) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line = self.pending.drain(..=position).collect::<Vec<u8>>();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(event) = self.take_event() {
                    events.push(event);
                }
            } else if let Some(data) = line.strip_prefix("data:") {
                self.data_lines.push(data.strip_prefix(' ').unwrap_or(data).to_string());
            }
        }

        events
    }

    pub(crate) fn finish(&mut self) -> Vec<String> {
        let mut events = Vec::new();
        if !self.pending.is_empty() {
            let tail = std::mem::take(&mut self.pending);
            let line = String::from_utf8_lossy(&tail).trim_end().to_string();
            if let Some(data) = line.strip_prefix("data:") {
                self.data_lines.push(data.trim_start().to_string());
            }
        }
        if let Some(event) = self.take_event() {
            events.push(event);
        }
        events
    }

    fn take_event(&mut self) -> Option<String> {
        if self.data_lines.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.data_lines).join("\n"))
    }
}

/// Newline-delimited JSON-RPC over a TCP stream.
pub struct SocketConnection {
    config_id: String,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    reader: tokio::sync::Mutex<BufReader<OwnedReadHalf>>,
}

impl SocketConnection {
    pub async fn connect(config_id: &str, address: &str) -> Result<Self, McpError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|error| McpError::connection(config_id, error.to_string()))?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            config_id: config_id.to_string(),
            writer: tokio::sync::Mutex::new(write_half),
            reader: tokio::sync::Mutex::new(BufReader::new(read_half)),
        })
    }

    async fn write_line(&self, value: &impl Serialize) -> Result<(), McpError> {
        let mut line = serde_json::to_string(value).map_err(|error| {
            McpError::Protocol(format!("failed to serialize message: {error}"))
        })?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|error| McpError::transport(&self.config_id, error.to_string()))?;
        writer.flush().await.map_err(|error| McpError::transport(&self.config_id, error.to_string()))
    }
}

#[async_trait]
impl Connection for SocketConnection {
    fn transport(&self) -> TransportKind {
        TransportKind::Socket
    }

    async fn send(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, McpError> {
        let id = request.id;
        // Holding the reader across the write keeps request/response pairs ordered.
        let mut reader = self.reader.lock().await;
        self.write_line(&request).await?;

        let mut line = String::new();
        loop {
            line.clear();
            let read = reader
                .read_line(&mut line)
                .await
                .map_err(|error| McpError::transport(&self.config_id, error.to_string()))?;
            if read == 0 {
                return Err(McpError::transport(&self.config_id, "socket closed by server"));
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if let Some(response) = match_response(trimmed, id) {
                return Ok(response);
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        self.write_line(&notification(method, params)).await
    }

    async fn close(&self) -> Result<(), McpError> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await.map_err(|error| McpError::transport(&self.config_id, error.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    use super::{Connection, EventStreamDecoder, SocketConnection};
    use crate::protocol::JsonRpcRequest;

    #[test]
    fn decoder_handles_split_chunks_and_multiline_data() {
        let mut decoder = EventStreamDecoder::default();
        assert!(decoder.push(b"event: message\nda").is_empty());
        assert!(decoder.push(b"ta: {\"a\":\r\n").is_empty());
        let events = decoder.push(b"data: 1}\n\n: comment\n\ndata: second\n\n");
        assert_eq!(events, vec!["{\"a\":\n1}".to_string(), "second".to_string()]);
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn decoder_flushes_unterminated_event_on_finish() {
        let mut decoder = EventStreamDecoder::default();
        assert!(decoder.push(b"data: {\"id\":3}").is_empty());
        assert_eq!(decoder.finish(), vec!["{\"id\":3}".to_string()]);
    }

    #[tokio::test]
    async fn socket_connection_skips_unrelated_lines_until_matching_id() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("addr").to_string();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            let request = lines.next_line().await.expect("read").expect("line");
            let request: serde_json::Value = serde_json::from_str(&request).expect("json");
            let id = request["id"].as_u64().expect("id");

            let noise = "starting up\n{\"jsonrpc\":\"2.0\",\"id\":999999,\"result\":{}}\n";
            write_half.write_all(noise.as_bytes()).await.expect("write noise");
            let reply = json!({"jsonrpc": "2.0", "id": id, "result": {"tools": []}});
            write_half.write_all(format!("{reply}\n").as_bytes()).await.expect("write reply");
        });

        let connection = SocketConnection::connect("ci", &address).await.expect("connect");
        let response =
            connection.send(JsonRpcRequest::new(41, "tools/list", None)).await.expect("send");
        assert_eq!(response.id, Some(41));
        assert_eq!(response.result, Some(json!({"tools": []})));

        connection.close().await.expect("close");
        server.await.expect("server task");
    }

    #[tokio::test]
    async fn socket_connect_failure_is_a_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("addr").to_string();
        drop(listener);

        let error = match SocketConnection::connect("ci", &address).await {
            Ok(_) => panic!("connect to a closed port should fail"),
            Err(error) => error,
        };
        assert_eq!(error.error_class(), "connection");
    }
}

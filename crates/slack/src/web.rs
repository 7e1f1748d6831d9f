use async_trait::async_trait;
use helmsman_core::config::SlackConfig;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;

use crate::events::OutboundMessage;
use crate::socket::TransportError;

pub const SLACK_API_BASE: &str = "https://slack.com/api";

/// Posts replies back into a thread.
#[async_trait]
pub trait ReplyPoster: Send + Sync {
    async fn post_reply(&self, message: &OutboundMessage) -> Result<(), TransportError>;
}

/// Minimal Slack Web API client: opening Socket Mode connections with the app
/// token and posting thread replies with the bot token.
#[derive(Clone)]
pub struct SlackWebClient {
    client: reqwest::Client,
    base_url: String,
    app_token: SecretString,
    bot_token: SecretString,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

impl SlackWebClient {
    pub fn new(client: reqwest::Client, config: &SlackConfig) -> Self {
        Self {
            client,
            base_url: SLACK_API_BASE.to_owned(),
            app_token: config.app_token.clone(),
            bot_token: config.bot_token.clone(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_owned();
        self
    }

    /// `apps.connections.open`: a single-use websocket URL.
    pub async fn open_socket_url(&self) -> Result<String, TransportError> {
        let response = self
            .call("apps.connections.open", &self.app_token, None)
            .await
            .map_err(TransportError::Connect)?;
        response.url.ok_or_else(|| {
            TransportError::Connect("apps.connections.open returned no url".to_owned())
        })
    }

    async fn call(
        &self,
        method: &str,
        token: &SecretString,
        body: Option<serde_json::Value>,
    ) -> Result<ApiResponse, String> {
        let mut request = self
            .client
            .post(format!("{}/{method}", self.base_url))
            .bearer_auth(token.expose_secret());
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|error| format!("{method}: {error}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("{method}: http status {status}"));
        }

        let parsed = response
            .json::<ApiResponse>()
            .await
            .map_err(|error| format!("{method}: invalid response body: {error}"))?;
        if !parsed.ok {
            return Err(format!(
                "{method}: {}",
                parsed.error.as_deref().unwrap_or("request rejected")
            ));
        }
        Ok(parsed)
    }
}

#[async_trait]
impl ReplyPoster for SlackWebClient {
    async fn post_reply(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let body = json!({
            "channel": message.channel_id,
            "thread_ts": message.thread_ts,
            "text": message.text,
        });
        self.call("chat.postMessage", &self.bot_token, Some(body))
            .await
            .map(|_| ())
            .map_err(TransportError::Post)
    }
}

#[cfg(test)]
mod tests {
    use helmsman_core::config::SlackConfig;
    use secrecy::SecretString;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    use super::{ReplyPoster, SlackWebClient};
    use crate::events::OutboundMessage;
    use crate::socket::TransportError;

    async fn serve_once(body: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("addr");
        let (request_tx, request_rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut buffer = vec![0_u8; 16 * 1024];
            let mut received = Vec::new();
            loop {
                let read = stream.read(&mut buffer).await.expect("read");
                if read == 0 {
                    break;
                }
                received.extend_from_slice(&buffer[..read]);
                let text = String::from_utf8_lossy(&received);
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if received.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
            }
            let _ = request_tx.send(String::from_utf8_lossy(&received).into_owned());
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.expect("write");
        });
        (format!("http://{address}"), request_rx)
    }

    fn config() -> SlackConfig {
        SlackConfig {
            app_token: SecretString::from("xapp-test".to_owned()),
            bot_token: SecretString::from("xoxb-test".to_owned()),
        }
    }

    #[tokio::test]
    async fn post_reply_targets_the_thread_with_the_bot_token() {
        let (base_url, request) = serve_once(r#"{"ok":true}"#).await;
        let client = SlackWebClient::new(reqwest::Client::new(), &config()).with_base_url(&base_url);

        client
            .post_reply(&OutboundMessage {
                channel_id: "C1".to_owned(),
                thread_ts: "17.5".to_owned(),
                text: "main is green".to_owned(),
            })
            .await
            .expect("post");

        let raw = request.await.expect("request captured");
        assert!(raw.starts_with("POST /chat.postMessage"));
        assert!(raw.to_ascii_lowercase().contains("authorization: bearer xoxb-test"));
        assert!(raw.contains(r#""thread_ts":"17.5""#));
    }

    #[tokio::test]
    async fn api_level_errors_surface_with_the_slack_error_code() {
        let (base_url, _request) = serve_once(r#"{"ok":false,"error":"invalid_auth"}"#).await;
        let client = SlackWebClient::new(reqwest::Client::new(), &config()).with_base_url(&base_url);

        let error = client.open_socket_url().await.expect_err("rejected");
        assert_eq!(
            error,
            TransportError::Connect("apps.connections.open: invalid_auth".to_owned())
        );
    }
}

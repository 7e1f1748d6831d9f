use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::events::{SlackEnvelope, SlackEvent};
use crate::socket::{SocketTransport, TransportError};
use crate::web::SlackWebClient;

type SocketStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Socket Mode over a websocket. Each `connect` asks Slack for a fresh URL.
/// Server-initiated refreshes surface as receive errors so the runner
/// reconnects through its backoff policy.
pub struct SlackSocketTransport {
    web: SlackWebClient,
    stream: Mutex<Option<SocketStream>>,
}

impl SlackSocketTransport {
    pub fn new(web: SlackWebClient) -> Self {
        Self { web, stream: Mutex::new(None) }
    }
}

#[derive(Debug, PartialEq)]
pub(crate) enum SocketFrame {
    Hello,
    Disconnect(String),
    Envelope(SlackEnvelope),
    Ignored,
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    envelope_id: Option<String>,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    reason: Option<String>,
}

pub(crate) fn decode_frame(text: &str) -> Result<SocketFrame, TransportError> {
    let frame = serde_json::from_str::<RawFrame>(text)
        .map_err(|error| TransportError::Receive(format!("malformed socket frame: {error}")))?;

    Ok(match (frame.kind.as_str(), frame.envelope_id) {
        ("hello", _) => SocketFrame::Hello,
        ("disconnect", _) => {
            SocketFrame::Disconnect(frame.reason.unwrap_or_else(|| "unspecified".to_owned()))
        }
        ("events_api", Some(envelope_id)) => SocketFrame::Envelope(SlackEnvelope::from_events_api(
            envelope_id,
            &frame.payload.unwrap_or(Value::Null),
        )),
        // Slash commands and interactions still need an ack.
        (kind, Some(envelope_id)) => SocketFrame::Envelope(SlackEnvelope {
            envelope_id,
            event: SlackEvent::Unsupported { event_type: kind.to_owned() },
        }),
        _ => SocketFrame::Ignored,
    })
}

#[async_trait]
impl SocketTransport for SlackSocketTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let url = self.web.open_socket_url().await?;
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|error| TransportError::Connect(error.to_string()))?;
        *self.stream.lock().await = Some(stream);
        Ok(())
    }

    async fn next_envelope(&self) -> Result<Option<SlackEnvelope>, TransportError> {
        let mut guard = self.stream.lock().await;
        let stream = guard
            .as_mut()
            .ok_or_else(|| TransportError::Receive("socket is not connected".to_owned()))?;

        loop {
            let message = match stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(error)) => return Err(TransportError::Receive(error.to_string())),
                None => return Err(TransportError::Receive("socket stream ended".to_owned())),
            };

            let text = match message {
                Message::Text(text) => text,
                Message::Close(frame) => {
                    return Err(TransportError::Receive(format!("socket closed by server: {frame:?}")))
                }
                _ => continue,
            };

            match decode_frame(text.as_str())? {
                SocketFrame::Hello => info!(event_name = "slack.socket.hello", "socket mode session ready"),
                SocketFrame::Disconnect(reason) => {
                    return Err(TransportError::Receive(format!(
                        "server requested reconnect: {reason}"
                    )))
                }
                SocketFrame::Envelope(envelope) => return Ok(Some(envelope)),
                SocketFrame::Ignored => debug!(event_name = "slack.socket.frame_ignored", "ignored socket frame"),
            }
        }
    }

    async fn acknowledge(&self, envelope_id: &str) -> Result<(), TransportError> {
        let mut guard = self.stream.lock().await;
        let stream = guard
            .as_mut()
            .ok_or_else(|| TransportError::Acknowledge("socket is not connected".to_owned()))?;
        let ack = json!({ "envelope_id": envelope_id }).to_string();
        stream
            .send(Message::text(ack))
            .await
            .map_err(|error| TransportError::Acknowledge(error.to_string()))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let Some(mut stream) = self.stream.lock().await.take() else {
            return Ok(());
        };
        stream.close(None).await.map_err(|error| TransportError::Disconnect(error.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::{decode_frame, SocketFrame};
    use crate::events::SlackEvent;
    use crate::socket::TransportError;

    #[test]
    fn decodes_control_frames() {
        assert_eq!(
            decode_frame(r#"{"type":"hello","num_connections":1}"#).expect("hello"),
            SocketFrame::Hello
        );
        assert_eq!(
            decode_frame(r#"{"type":"disconnect","reason":"refresh_requested"}"#).expect("disconnect"),
            SocketFrame::Disconnect("refresh_requested".to_owned())
        );
    }

    #[test]
    fn decodes_events_and_acks_everything_with_an_envelope() {
        let frame = decode_frame(
            r#"{"type":"events_api","envelope_id":"e-1","payload":{"event":{"type":"message","channel":"C1","user":"U1","text":"hi","ts":"1.0"}}}"#,
        )
        .expect("events_api");
        let SocketFrame::Envelope(envelope) = frame else {
            panic!("expected an envelope, got {frame:?}");
        };
        assert_eq!(envelope.envelope_id, "e-1");
        assert!(matches!(envelope.event, SlackEvent::ThreadMessage(_)));

        let command = decode_frame(r#"{"type":"slash_commands","envelope_id":"e-2","payload":{}}"#)
            .expect("slash command");
        let SocketFrame::Envelope(envelope) = command else {
            panic!("expected an envelope, got {command:?}");
        };
        assert_eq!(envelope.event, SlackEvent::Unsupported { event_type: "slash_commands".to_owned() });
    }

    #[test]
    fn malformed_frames_are_receive_errors() {
        assert!(matches!(decode_frame("not json"), Err(TransportError::Receive(_))));
        assert_eq!(decode_frame(r#"{"type":"pong"}"#).expect("unknown"), SocketFrame::Ignored);
    }
}

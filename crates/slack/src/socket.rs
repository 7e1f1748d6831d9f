use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::events::{EventContext, EventDispatcher, HandlerResult, SlackEnvelope};
use crate::web::ReplyPoster;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport failed to connect: {0}")]
    Connect(String),
    #[error("transport read failed: {0}")]
    Receive(String),
    #[error("transport ack failed: {0}")]
    Acknowledge(String),
    #[error("transport disconnect failed: {0}")]
    Disconnect(String),
    #[error("reply post failed: {0}")]
    Post(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { max_retries: 5, base_delay_ms: 250, max_delay_ms: 5_000 }
    }
}

impl ReconnectPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let multiplier = 1_u64 << exponent;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

#[async_trait]
pub trait SocketTransport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;
    /// `Ok(None)` means the stream ended cleanly and the runner should stop.
    async fn next_envelope(&self) -> Result<Option<SlackEnvelope>, TransportError>;
    async fn acknowledge(&self, envelope_id: &str) -> Result<(), TransportError>;
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Pumps Socket Mode envelopes: acknowledge first, then dispatch on a
/// separate task so one slow agent request does not hold up the socket.
pub struct SocketModeRunner {
    transport: Arc<dyn SocketTransport>,
    dispatcher: Arc<EventDispatcher>,
    replies: Arc<dyn ReplyPoster>,
    reconnect_policy: ReconnectPolicy,
}

impl SocketModeRunner {
    pub fn new(
        transport: Arc<dyn SocketTransport>,
        dispatcher: EventDispatcher,
        replies: Arc<dyn ReplyPoster>,
        reconnect_policy: ReconnectPolicy,
    ) -> Self {
        Self { transport, dispatcher: Arc::new(dispatcher), replies, reconnect_policy }
    }

    /// Runs until the transport closes cleanly or reconnects are exhausted.
    /// A connection that was established resets the retry budget.
    pub async fn start(&self) {
        let mut in_flight = JoinSet::new();
        let mut failures = 0_u32;

        loop {
            let mut established = false;
            let outcome = self.connect_and_pump(failures, &mut established, &mut in_flight).await;
            let Err(transport_error) = outcome else {
                break;
            };
            if established {
                failures = 0;
            }

            warn!(
                event_name = "slack.socket.transport_failed",
                attempt = failures,
                max_retries = self.reconnect_policy.max_retries,
                error = %transport_error,
                "socket mode transport failed"
            );

            if failures >= self.reconnect_policy.max_retries {
                warn!(
                    event_name = "slack.socket.retries_exhausted",
                    max_retries = self.reconnect_policy.max_retries,
                    "socket mode retries exhausted; continuing process without crash"
                );
                break;
            }

            let delay = self.reconnect_policy.backoff(failures);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            failures += 1;
        }

        while in_flight.join_next().await.is_some() {}
    }

    async fn connect_and_pump(
        &self,
        attempt: u32,
        established: &mut bool,
        in_flight: &mut JoinSet<()>,
    ) -> Result<(), TransportError> {
        info!(event_name = "slack.socket.connecting", attempt, "opening socket mode transport connection");
        self.transport.connect().await?;
        *established = true;
        info!(event_name = "slack.socket.connected", attempt, "socket mode transport connected");

        loop {
            // Reap finished dispatch tasks so the set stays small.
            while in_flight.try_join_next().is_some() {}

            let Some(envelope) = self.transport.next_envelope().await? else {
                info!(event_name = "slack.socket.closed", attempt, "socket mode transport stream closed");
                self.transport.disconnect().await?;
                return Ok(());
            };
            let (thread_id, user_id) = correlation_fields(&envelope);

            info!(
                event_name = "slack.envelope.received",
                envelope_id = %envelope.envelope_id,
                event_type = ?envelope.event.event_type(),
                correlation_id = %envelope.envelope_id,
                thread_id = thread_id,
                user_id = user_id,
                "received slack envelope"
            );

            if let Err(error) = self.transport.acknowledge(&envelope.envelope_id).await {
                warn!(
                    event_name = "slack.envelope.ack_failed",
                    envelope_id = %envelope.envelope_id,
                    correlation_id = %envelope.envelope_id,
                    thread_id = thread_id,
                    error = %error,
                    "failed to acknowledge slack envelope"
                );
            } else {
                debug!(
                    event_name = "slack.envelope.ack_sent",
                    envelope_id = %envelope.envelope_id,
                    correlation_id = %envelope.envelope_id,
                    "acknowledged slack envelope"
                );
            }

            let dispatcher = self.dispatcher.clone();
            let replies = self.replies.clone();
            in_flight.spawn(async move {
                dispatch_and_reply(&dispatcher, replies.as_ref(), envelope).await;
            });
        }
    }
}

async fn dispatch_and_reply(
    dispatcher: &EventDispatcher,
    replies: &dyn ReplyPoster,
    envelope: SlackEnvelope,
) {
    let context = EventContext { correlation_id: envelope.envelope_id.clone() };
    let (thread_id, user_id) = correlation_fields(&envelope);

    let message = match dispatcher.dispatch(&envelope, &context).await {
        Ok(HandlerResult::Responded(message)) => message,
        Ok(_) => return,
        Err(error) => {
            warn!(
                event_name = "slack.dispatch.failed",
                envelope_id = %envelope.envelope_id,
                correlation_id = %envelope.envelope_id,
                thread_id = thread_id,
                user_id = user_id,
                error = %error,
                "event dispatch failed; continuing socket loop"
            );
            return;
        }
    };

    match replies.post_reply(&message).await {
        Ok(()) => debug!(
            event_name = "slack.reply.posted",
            correlation_id = %envelope.envelope_id,
            thread_id = %message.thread_ts,
            "reply posted"
        ),
        Err(error) => warn!(
            event_name = "slack.reply.failed",
            correlation_id = %envelope.envelope_id,
            thread_id = %message.thread_ts,
            error = %error,
            "failed to post reply"
        ),
    }
}

fn correlation_fields(envelope: &SlackEnvelope) -> (&str, &str) {
    match envelope.event.message() {
        Some(event) => (event.thread_ts.as_str(), event.user_id.as_str()),
        None => ("unknown", "unknown"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::{ReconnectPolicy, SocketModeRunner, SocketTransport, TransportError};
    use crate::events::{
        message_dispatcher, EventContext, EventDispatcher, EventHandlerError, OutboundMessage,
        SlackEnvelope, SlackEvent, ThreadMessageEvent, ThreadMessageService,
    };
    use crate::web::ReplyPoster;

    #[derive(Default)]
    struct ScriptedTransport {
        state: Mutex<ScriptedState>,
    }

    #[derive(Default)]
    struct ScriptedState {
        connect_results: VecDeque<Result<(), TransportError>>,
        envelopes: VecDeque<Result<Option<SlackEnvelope>, TransportError>>,
        connect_attempts: usize,
        acknowledgements: Vec<String>,
        disconnect_calls: usize,
    }

    impl ScriptedTransport {
        fn with_script(
            connect_results: Vec<Result<(), TransportError>>,
            envelopes: Vec<Result<Option<SlackEnvelope>, TransportError>>,
        ) -> Self {
            Self {
                state: Mutex::new(ScriptedState {
                    connect_results: connect_results.into(),
                    envelopes: envelopes.into(),
                    ..ScriptedState::default()
                }),
            }
        }

        async fn connect_attempts(&self) -> usize {
            self.state.lock().await.connect_attempts
        }

        async fn acknowledgements(&self) -> Vec<String> {
            self.state.lock().await.acknowledgements.clone()
        }
    }

    #[async_trait]
    impl SocketTransport for ScriptedTransport {
        async fn connect(&self) -> Result<(), TransportError> {
            let mut state = self.state.lock().await;
            state.connect_attempts += 1;
            state.connect_results.pop_front().unwrap_or(Ok(()))
        }

        async fn next_envelope(&self) -> Result<Option<SlackEnvelope>, TransportError> {
            let mut state = self.state.lock().await;
            state.envelopes.pop_front().unwrap_or(Ok(None))
        }

        async fn acknowledge(&self, envelope_id: &str) -> Result<(), TransportError> {
            let mut state = self.state.lock().await;
            state.acknowledgements.push(envelope_id.to_owned());
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), TransportError> {
            self.state.lock().await.disconnect_calls += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingPoster {
        posted: Mutex<Vec<OutboundMessage>>,
    }

    #[async_trait]
    impl ReplyPoster for RecordingPoster {
        async fn post_reply(&self, message: &OutboundMessage) -> Result<(), TransportError> {
            self.posted.lock().await.push(message.clone());
            Ok(())
        }
    }

    struct ShoutService;

    #[async_trait]
    impl ThreadMessageService for ShoutService {
        async fn handle_thread_message(
            &self,
            event: &ThreadMessageEvent,
            _ctx: &EventContext,
        ) -> Result<Option<String>, EventHandlerError> {
            Ok(Some(event.text.to_uppercase()))
        }
    }

    fn unsupported(envelope_id: &str) -> SlackEnvelope {
        SlackEnvelope {
            envelope_id: envelope_id.to_owned(),
            event: SlackEvent::Unsupported { event_type: "test".to_owned() },
        }
    }

    fn no_delay(max_retries: u32) -> ReconnectPolicy {
        ReconnectPolicy { max_retries, base_delay_ms: 0, max_delay_ms: 0 }
    }

    #[tokio::test]
    async fn reconnects_after_initial_connect_failure() {
        let transport = Arc::new(ScriptedTransport::with_script(
            vec![Err(TransportError::Connect("network down".to_owned())), Ok(())],
            vec![Ok(Some(unsupported("env-1"))), Ok(None)],
        ));

        let runner = SocketModeRunner::new(
            transport.clone(),
            EventDispatcher::default(),
            Arc::new(RecordingPoster::default()),
            no_delay(2),
        );
        runner.start().await;

        assert_eq!(transport.connect_attempts().await, 2);
        assert_eq!(transport.acknowledgements().await, vec!["env-1"]);
        assert_eq!(transport.state.lock().await.disconnect_calls, 1);
    }

    #[tokio::test]
    async fn exhausts_retries_without_crashing() {
        let transport = Arc::new(ScriptedTransport::with_script(
            vec![
                Err(TransportError::Connect("fail-1".to_owned())),
                Err(TransportError::Connect("fail-2".to_owned())),
                Err(TransportError::Connect("fail-3".to_owned())),
            ],
            vec![],
        ));

        let runner = SocketModeRunner::new(
            transport.clone(),
            EventDispatcher::default(),
            Arc::new(RecordingPoster::default()),
            no_delay(2),
        );
        runner.start().await;

        assert_eq!(transport.connect_attempts().await, 3);
    }

    #[tokio::test]
    async fn established_connections_reset_the_retry_budget() {
        let transport = Arc::new(ScriptedTransport::with_script(
            vec![
                Err(TransportError::Connect("fail-1".to_owned())),
                Ok(()),
                Err(TransportError::Connect("fail-2".to_owned())),
                Ok(()),
            ],
            vec![
                Ok(Some(unsupported("env-1"))),
                Err(TransportError::Receive("server requested reconnect".to_owned())),
                Ok(Some(unsupported("env-2"))),
                Ok(None),
            ],
        ));

        let runner = SocketModeRunner::new(
            transport.clone(),
            EventDispatcher::default(),
            Arc::new(RecordingPoster::default()),
            no_delay(2),
        );
        runner.start().await;

        assert_eq!(transport.connect_attempts().await, 4);
        assert_eq!(transport.acknowledgements().await, vec!["env-1", "env-2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_and_caps() {
        let policy = ReconnectPolicy { max_retries: 5, base_delay_ms: 250, max_delay_ms: 1_000 };
        assert_eq!(policy.backoff(0), Duration::from_millis(250));
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(3), Duration::from_millis(1_000));

        let transport = Arc::new(ScriptedTransport::with_script(
            vec![
                Err(TransportError::Connect("fail-1".to_owned())),
                Err(TransportError::Connect("fail-2".to_owned())),
            ],
            vec![],
        ));
        let runner = SocketModeRunner::new(
            transport,
            EventDispatcher::default(),
            Arc::new(RecordingPoster::default()),
            policy,
        );

        let started = tokio::time::Instant::now();
        runner.start().await;
        // fail-1, 250ms, fail-2, 500ms, then a clean connect with an empty stream
        assert_eq!(started.elapsed(), Duration::from_millis(750));
    }

    #[tokio::test]
    async fn responded_messages_are_posted_to_their_thread() {
        let message = ThreadMessageEvent {
            channel_id: "C1".to_owned(),
            thread_ts: "17.1".to_owned(),
            message_ts: "17.2".to_owned(),
            user_id: "U1".to_owned(),
            is_bot: false,
            text: "status".to_owned(),
        };
        let transport = Arc::new(ScriptedTransport::with_script(
            vec![Ok(())],
            vec![
                Ok(Some(SlackEnvelope {
                    envelope_id: "env-1".to_owned(),
                    event: SlackEvent::ThreadMessage(message),
                })),
                Ok(Some(unsupported("env-2"))),
                Ok(None),
            ],
        ));
        let poster = Arc::new(RecordingPoster::default());

        let runner = SocketModeRunner::new(
            transport,
            message_dispatcher(Arc::new(ShoutService)),
            poster.clone(),
            no_delay(0),
        );
        runner.start().await;

        let posted = poster.posted.lock().await.clone();
        assert_eq!(
            posted,
            vec![OutboundMessage {
                channel_id: "C1".to_owned(),
                thread_ts: "17.1".to_owned(),
                text: "STATUS".to_owned(),
            }]
        );
    }
}

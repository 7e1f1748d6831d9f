use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlackEnvelope {
    pub envelope_id: String,
    pub event: SlackEvent,
}

impl SlackEnvelope {
    /// Builds an envelope from a Socket Mode `events_api` payload. Anything
    /// that is not a plain user message or a mention maps to `Unsupported` so
    /// it can still be acknowledged.
    pub fn from_events_api(envelope_id: impl Into<String>, payload: &Value) -> Self {
        let event = payload
            .get("event")
            .cloned()
            .and_then(|event| serde_json::from_value::<RawMessageEvent>(event).ok())
            .map(SlackEvent::from_raw)
            .unwrap_or_else(|| SlackEvent::Unsupported {
                event_type: payload
                    .pointer("/event/type")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_owned(),
            });

        Self { envelope_id: envelope_id.into(), event }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SlackEvent {
    ThreadMessage(ThreadMessageEvent),
    AppMention(ThreadMessageEvent),
    Unsupported { event_type: String },
}

impl SlackEvent {
    pub fn event_type(&self) -> SlackEventType {
        match self {
            Self::ThreadMessage(_) => SlackEventType::ThreadMessage,
            Self::AppMention(_) => SlackEventType::AppMention,
            Self::Unsupported { .. } => SlackEventType::Unsupported,
        }
    }

    pub fn message(&self) -> Option<&ThreadMessageEvent> {
        match self {
            Self::ThreadMessage(event) | Self::AppMention(event) => Some(event),
            Self::Unsupported { .. } => None,
        }
    }

    fn from_raw(raw: RawMessageEvent) -> Self {
        let edited = raw.subtype.as_deref().is_some_and(|subtype| subtype != "thread_broadcast");
        let kind = raw.kind.clone();
        if edited || (kind != "message" && kind != "app_mention") {
            let event_type = match raw.subtype {
                Some(subtype) => format!("{kind}.{subtype}"),
                None => kind,
            };
            return Self::Unsupported { event_type };
        }

        let text = raw.text.unwrap_or_default();
        let event = ThreadMessageEvent {
            channel_id: raw.channel.unwrap_or_default(),
            thread_ts: raw.thread_ts.unwrap_or_else(|| raw.ts.clone()),
            message_ts: raw.ts,
            user_id: raw.user.unwrap_or_default(),
            is_bot: raw.bot_id.is_some(),
            text: if kind == "app_mention" { strip_leading_mentions(&text) } else { text },
        };

        if kind == "app_mention" {
            Self::AppMention(event)
        } else {
            Self::ThreadMessage(event)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SlackEventType {
    ThreadMessage,
    AppMention,
    Unsupported,
}

#[derive(Debug, Deserialize)]
struct RawMessageEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    ts: String,
    #[serde(default)]
    thread_ts: Option<String>,
}

/// A user message. `thread_ts` is the thread root; for a top-level message it
/// equals `message_ts`, so replies start a thread under it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadMessageEvent {
    pub channel_id: String,
    pub thread_ts: String,
    pub message_ts: String,
    pub user_id: String,
    pub is_bot: bool,
    pub text: String,
}

/// `<@U123> what's the build status` -> `what's the build status`
fn strip_leading_mentions(text: &str) -> String {
    let mut rest = text.trim_start();
    while let Some(after) = rest.strip_prefix("<@") {
        match after.find('>') {
            Some(end) => rest = after[end + 1..].trim_start(),
            None => break,
        }
    }
    rest.to_owned()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventContext {
    pub correlation_id: String,
}

impl Default for EventContext {
    fn default() -> Self {
        Self { correlation_id: "unknown-correlation-id".to_owned() }
    }
}

/// A reply addressed to the thread the triggering message lives in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    pub channel_id: String,
    pub thread_ts: String,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandlerResult {
    Responded(OutboundMessage),
    Processed,
    Ignored,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventHandlerError {
    #[error("thread message handler failure: {0}")]
    ThreadMessage(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error(transparent)]
    Handler(#[from] EventHandlerError),
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn event_type(&self) -> SlackEventType;
    async fn handle(
        &self,
        envelope: &SlackEnvelope,
        ctx: &EventContext,
    ) -> Result<HandlerResult, EventHandlerError>;
}

#[derive(Default)]
pub struct EventDispatcher {
    handlers: HashMap<SlackEventType, Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, handler: H)
    where
        H: EventHandler + 'static,
    {
        self.handlers.insert(handler.event_type(), Arc::new(handler));
    }

    pub async fn dispatch(
        &self,
        envelope: &SlackEnvelope,
        ctx: &EventContext,
    ) -> Result<HandlerResult, DispatchError> {
        let Some(handler) = self.handlers.get(&envelope.event.event_type()) else {
            return Ok(HandlerResult::Ignored);
        };

        handler.handle(envelope, ctx).await.map_err(DispatchError::from)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

/// Routes both thread messages and mentions to the same service.
pub fn message_dispatcher<S>(service: Arc<S>) -> EventDispatcher
where
    S: ThreadMessageService + 'static,
{
    let mut dispatcher = EventDispatcher::new();
    dispatcher.register(ThreadMessageHandler::new(service.clone(), SlackEventType::ThreadMessage));
    dispatcher.register(ThreadMessageHandler::new(service, SlackEventType::AppMention));
    dispatcher
}

/// The agent-facing seam: returns the reply text, or `None` to stay silent.
#[async_trait]
pub trait ThreadMessageService: Send + Sync {
    async fn handle_thread_message(
        &self,
        event: &ThreadMessageEvent,
        ctx: &EventContext,
    ) -> Result<Option<String>, EventHandlerError>;
}

pub struct ThreadMessageHandler<S> {
    service: Arc<S>,
    event_type: SlackEventType,
}

impl<S> ThreadMessageHandler<S>
where
    S: ThreadMessageService,
{
    pub fn new(service: Arc<S>, event_type: SlackEventType) -> Self {
        Self { service, event_type }
    }
}

#[async_trait]
impl<S> EventHandler for ThreadMessageHandler<S>
where
    S: ThreadMessageService + 'static,
{
    fn event_type(&self) -> SlackEventType {
        self.event_type
    }

    async fn handle(
        &self,
        envelope: &SlackEnvelope,
        ctx: &EventContext,
    ) -> Result<HandlerResult, EventHandlerError> {
        let Some(event) = envelope.event.message() else {
            return Ok(HandlerResult::Ignored);
        };

        let reply = self.service.handle_thread_message(event, ctx).await?;
        Ok(match reply {
            Some(text) => HandlerResult::Responded(OutboundMessage {
                channel_id: event.channel_id.clone(),
                thread_ts: event.thread_ts.clone(),
                text,
            }),
            None => HandlerResult::Processed,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;

    use super::{
        message_dispatcher, EventContext, EventDispatcher, EventHandlerError, HandlerResult,
        OutboundMessage, SlackEnvelope, SlackEvent, ThreadMessageEvent, ThreadMessageService,
    };

    struct EchoService;

    #[async_trait]
    impl ThreadMessageService for EchoService {
        async fn handle_thread_message(
            &self,
            event: &ThreadMessageEvent,
            _ctx: &EventContext,
        ) -> Result<Option<String>, EventHandlerError> {
            if event.text == "boom" {
                return Err(EventHandlerError::ThreadMessage("exploded".to_owned()));
            }
            Ok((!event.text.is_empty()).then(|| format!("echo: {}", event.text)))
        }
    }

    fn message(text: &str) -> ThreadMessageEvent {
        ThreadMessageEvent {
            channel_id: "C1".to_owned(),
            thread_ts: "1730000000.1000".to_owned(),
            message_ts: "1730000000.2000".to_owned(),
            user_id: "U1".to_owned(),
            is_bot: false,
            text: text.to_owned(),
        }
    }

    #[test]
    fn parses_thread_replies_and_top_level_messages() {
        let reply = SlackEnvelope::from_events_api(
            "env-1",
            &json!({"event": {
                "type": "message", "channel": "C1", "user": "U1", "text": "status of main",
                "ts": "1730000000.2000", "thread_ts": "1730000000.1000"
            }}),
        );
        let SlackEvent::ThreadMessage(event) = &reply.event else {
            panic!("expected a thread message, got {:?}", reply.event);
        };
        assert_eq!(event.thread_ts, "1730000000.1000");
        assert_eq!(event.message_ts, "1730000000.2000");
        assert!(!event.is_bot);

        let root = SlackEnvelope::from_events_api(
            "env-2",
            &json!({"event": {"type": "message", "channel": "C1", "user": "U1", "text": "hi", "ts": "17.5"}}),
        );
        assert_eq!(root.event.message().map(|event| event.thread_ts.as_str()), Some("17.5"));
    }

    #[test]
    fn mentions_are_stripped_and_bots_flagged() {
        let mention = SlackEnvelope::from_events_api(
            "env-3",
            &json!({"event": {
                "type": "app_mention", "channel": "C1", "user": "U1",
                "text": "<@UBOT> <@UOTHER>  is PROJ-12 done?", "ts": "1.0"
            }}),
        );
        let SlackEvent::AppMention(event) = &mention.event else {
            panic!("expected a mention, got {:?}", mention.event);
        };
        assert_eq!(event.text, "is PROJ-12 done?");

        let bot = SlackEnvelope::from_events_api(
            "env-4",
            &json!({"event": {"type": "message", "channel": "C1", "bot_id": "B1", "text": "beep", "ts": "2.0"}}),
        );
        assert!(bot.event.message().is_some_and(|event| event.is_bot));
    }

    #[test]
    fn edits_and_unknown_events_are_unsupported() {
        let edit = SlackEnvelope::from_events_api(
            "env-5",
            &json!({"event": {"type": "message", "subtype": "message_changed", "ts": "3.0"}}),
        );
        assert_eq!(
            edit.event,
            SlackEvent::Unsupported { event_type: "message.message_changed".to_owned() }
        );

        let reaction = SlackEnvelope::from_events_api(
            "env-6",
            &json!({"event": {"type": "reaction_added", "reaction": "thumbsup"}}),
        );
        assert_eq!(reaction.event, SlackEvent::Unsupported { event_type: "reaction_added".to_owned() });
    }

    #[tokio::test]
    async fn dispatcher_replies_into_the_originating_thread() {
        let dispatcher = message_dispatcher(Arc::new(EchoService));
        assert_eq!(dispatcher.handler_count(), 2);

        for event in [SlackEvent::ThreadMessage(message("hello")), SlackEvent::AppMention(message("hello"))] {
            let envelope = SlackEnvelope { envelope_id: "env-7".to_owned(), event };
            let result =
                dispatcher.dispatch(&envelope, &EventContext::default()).await.expect("dispatch");
            assert_eq!(
                result,
                HandlerResult::Responded(OutboundMessage {
                    channel_id: "C1".to_owned(),
                    thread_ts: "1730000000.1000".to_owned(),
                    text: "echo: hello".to_owned(),
                })
            );
        }
    }

    #[tokio::test]
    async fn silent_service_and_missing_handler_outcomes() {
        let dispatcher = message_dispatcher(Arc::new(EchoService));
        let quiet = SlackEnvelope {
            envelope_id: "env-8".to_owned(),
            event: SlackEvent::ThreadMessage(message("")),
        };
        assert_eq!(
            dispatcher.dispatch(&quiet, &EventContext::default()).await.expect("dispatch"),
            HandlerResult::Processed
        );

        let failing = SlackEnvelope {
            envelope_id: "env-9".to_owned(),
            event: SlackEvent::ThreadMessage(message("boom")),
        };
        assert!(dispatcher.dispatch(&failing, &EventContext::default()).await.is_err());

        let empty = EventDispatcher::new();
        assert_eq!(
            empty.dispatch(&quiet, &EventContext::default()).await.expect("dispatch"),
            HandlerResult::Ignored
        );
    }
}

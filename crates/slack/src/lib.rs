//! Slack ingress over Socket Mode.
//!
//! - `socket`: the envelope pump with reconnect backoff
//! - `websocket`: the Socket Mode transport
//! - `events`: envelope decoding and the dispatcher that hands thread
//!   messages and mentions to a `ThreadMessageService`
//! - `web`: Web API calls (connection URLs, thread replies)
//!
//! ```text
//! Socket Mode -> SocketModeRunner -> EventDispatcher -> ThreadMessageService
//!                      |                                        |
//!                  ack envelope                     ReplyPoster <- reply text
//! ```

pub mod events;
pub mod socket;
pub mod web;
pub mod websocket;

pub use events::{
    message_dispatcher, EventContext, EventDispatcher, EventHandlerError, HandlerResult,
    OutboundMessage, SlackEnvelope, SlackEvent, ThreadMessageEvent, ThreadMessageService,
};
pub use socket::{ReconnectPolicy, SocketModeRunner, SocketTransport, TransportError};
pub use web::{ReplyPoster, SlackWebClient};
pub use websocket::SlackSocketTransport;

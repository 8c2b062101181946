//! The `transport` module connects the broker core to agents.
//!
//! The core only sees the [`Transport`] trait: hand a message to a session
//! and report what happened. [`LocalTransport`] does this over in-process
//! channels, [`websocket`] over JSON frames on a WebSocket connection.

pub mod local;
pub mod message;
pub mod websocket;

pub use local::LocalTransport;
pub use websocket::WebSocketTransport;

use async_trait::async_trait;

use crate::broker::message::Message;
use crate::utils::TransportError;

/// Result of handing one message to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The recipient accepted the message.
    Acked,
    /// The recipient refused it; counts as a failed attempt.
    Nacked(String),
    /// Written to the session; the recipient acknowledges later through
    /// `Broker::acknowledge`.
    Pending,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, session_id: &str, message: &Message) -> Result<SendOutcome, TransportError>;

    /// Whether the agent currently has a usable connection.
    fn is_online(&self, agent_id: &str) -> bool;
}

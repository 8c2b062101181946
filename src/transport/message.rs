//! JSON frames exchanged with WebSocket clients.
//!
//! Payloads travel as UTF-8 text; the broker itself treats them as opaque
//! bytes.

use serde::{Deserialize, Serialize};

use crate::broker::message::{
    CorrelationId, DeadLetterReason, Destination, Message, MessageId, Pattern, RawMessage,
};

/// Message fields a client may set. The sender is always the connection's
/// agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct WireMessage {
    pub destination: Option<Destination>,
    pub pattern: Option<Pattern>,
    pub priority: Option<u8>,
    pub idempotency_key: Option<String>,
    pub correlation_id: Option<CorrelationId>,
    #[serde(default)]
    pub payload: String,
    pub ttl_ms: Option<u64>,
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub confirm_delivery: bool,
}

impl From<WireMessage> for RawMessage {
    fn from(wire: WireMessage) -> Self {
        RawMessage {
            sender: None,
            destination: wire.destination,
            pattern: wire.pattern,
            priority: wire.priority,
            idempotency_key: wire.idempotency_key,
            correlation_id: wire.correlation_id,
            payload: wire.payload.into_bytes(),
            ttl_ms: wire.ttl_ms,
            protocol_version: wire.protocol_version,
            confirm_delivery: wire.confirm_delivery,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Must be the first frame on a connection.
    Hello {
        agent_id: String,
        versions: Vec<String>,
    },
    Submit {
        message: WireMessage,
    },
    Subscribe {
        pattern: String,
    },
    Unsubscribe {
        pattern: String,
    },
    Request {
        message: WireMessage,
        timeout_ms: Option<u64>,
    },
    Cancel {
        correlation_id: CorrelationId,
    },
    Ack {
        message_id: MessageId,
    },
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Welcome {
        session_id: String,
        version: String,
    },
    Accepted {
        message_id: MessageId,
        duplicate: bool,
        recipients: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<CorrelationId>,
    },
    Subscribed {
        pattern: String,
    },
    Unsubscribed {
        pattern: String,
    },
    Deliver {
        message_id: MessageId,
        sender: String,
        pattern: Pattern,
        priority: u8,
        correlation_id: Option<CorrelationId>,
        payload: String,
        created_at: i64,
    },
    Response {
        correlation_id: CorrelationId,
        message_id: MessageId,
        sender: String,
        payload: String,
    },
    Report {
        message_id: MessageId,
        recipient: String,
        delivered: bool,
        reason: Option<DeadLetterReason>,
    },
    /// A request sent by this agent ended without a response.
    RequestTimedOut {
        correlation_id: CorrelationId,
    },
    Error {
        message: String,
    },
}

impl ServerFrame {
    pub fn deliver(message: &Message) -> Self {
        ServerFrame::Deliver {
            message_id: message.id.clone(),
            sender: message.sender.clone(),
            pattern: message.pattern,
            priority: message.priority.level() as u8,
            correlation_id: message.correlation_id.clone(),
            payload: String::from_utf8_lossy(&message.payload).into_owned(),
            created_at: message.created_at.timestamp_millis(),
        }
    }

    pub fn response(message: &Message) -> Self {
        ServerFrame::Response {
            correlation_id: message.correlation_id.clone().unwrap_or_default(),
            message_id: message.id.clone(),
            sender: message.sender.clone(),
            payload: String::from_utf8_lossy(&message.payload).into_owned(),
        }
    }

    pub fn error(err: impl std::fmt::Display) -> Self {
        ServerFrame::Error {
            message: err.to_string(),
        }
    }
}

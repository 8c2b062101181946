//! Message definitions for the broker
//!
//! `RawMessage` is what a transport hands the core after decoding wire
//! bytes: every field optional, nothing trusted. The validator turns it into
//! a canonical `Message`, which is immutable from then on. A `Delivery` is a
//! message bound to one recipient; fan-out patterns produce one delivery
//! per recipient, and deliveries are what queues, retries and the store
//! track.
//!
//! Notes on fields:
//! - `id`: assigned by the broker on admission, never by the sender
//! - `priority`: `0` is the highest level, `3` the lowest
//! - `ttl_ms`: measured from `created_at`; an expired delivery is
//!   dead-lettered instead of attempted
//! - `protocol_version`: the version negotiated for the sender's session

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type AgentId = String;
pub type MessageId = String;
pub type SessionId = String;
pub type CorrelationId = String;

/// Addressing target of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Destination {
    Agent(AgentId),
    Topic(String),
    Broadcast,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Agent(id) => write!(f, "agent:{id}"),
            Destination::Topic(topic) => write!(f, "topic:{topic}"),
            Destination::Broadcast => f.write_str("broadcast"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pattern {
    FireAndForget,
    Request,
    Response,
    Publish,
}

impl Pattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FireAndForget => "fire_and_forget",
            Self::Request => "request",
            Self::Response => "response",
            Self::Publish => "publish",
        }
    }
}

/// Scheduling priority. `0` is served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    pub const LEVELS: usize = 4;
    pub const HIGHEST: Priority = Priority(0);
    pub const LOWEST: Priority = Priority(3);

    pub fn new(level: u8) -> Option<Self> {
        (usize::from(level) < Self::LEVELS).then_some(Self(level))
    }

    pub fn level(self) -> usize {
        usize::from(self.0)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self(2)
    }
}

/// Unvalidated message as decoded by a transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    pub sender: Option<AgentId>,
    pub destination: Option<Destination>,
    /// Inferred from the destination when absent: topics publish, everything
    /// else is fire-and-forget.
    pub pattern: Option<Pattern>,
    pub priority: Option<u8>,
    pub idempotency_key: Option<String>,
    pub correlation_id: Option<CorrelationId>,
    #[serde(default)]
    pub payload: Vec<u8>,
    pub ttl_ms: Option<u64>,
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub confirm_delivery: bool,
}

impl RawMessage {
    fn new(sender: &str, destination: Destination, pattern: Pattern, payload: &[u8]) -> Self {
        Self {
            sender: Some(sender.to_string()),
            destination: Some(destination),
            pattern: Some(pattern),
            payload: payload.to_vec(),
            ..Self::default()
        }
    }

    pub fn direct(sender: &str, recipient: &str, payload: &[u8]) -> Self {
        Self::new(
            sender,
            Destination::Agent(recipient.to_string()),
            Pattern::FireAndForget,
            payload,
        )
    }

    pub fn publish(sender: &str, topic: &str, payload: &[u8]) -> Self {
        Self::new(
            sender,
            Destination::Topic(topic.to_string()),
            Pattern::Publish,
            payload,
        )
    }

    pub fn broadcast(sender: &str, payload: &[u8]) -> Self {
        Self::new(sender, Destination::Broadcast, Pattern::FireAndForget, payload)
    }

    pub fn request(sender: &str, recipient: &str, payload: &[u8]) -> Self {
        Self::new(
            sender,
            Destination::Agent(recipient.to_string()),
            Pattern::Request,
            payload,
        )
    }

    pub fn response(sender: &str, requester: &str, correlation_id: &str, payload: &[u8]) -> Self {
        let mut raw = Self::new(
            sender,
            Destination::Agent(requester.to_string()),
            Pattern::Response,
            payload,
        );
        raw.correlation_id = Some(correlation_id.to_string());
        raw
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_idempotency_key(mut self, key: &str) -> Self {
        self.idempotency_key = Some(key.to_string());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_string());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_ms = Some(ttl.as_millis() as u64);
        self
    }

    pub fn with_protocol_version(mut self, version: &str) -> Self {
        self.protocol_version = Some(version.to_string());
        self
    }

    pub fn with_confirmation(mut self) -> Self {
        self.confirm_delivery = true;
        self
    }
}

/// Canonical, validated message. Built only by the validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender: AgentId,
    pub destination: Destination,
    pub pattern: Pattern,
    pub priority: Priority,
    pub idempotency_key: Option<String>,
    pub correlation_id: Option<CorrelationId>,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub ttl_ms: u64,
    pub protocol_version: String,
    pub confirm_delivery: bool,
}

impl Message {
    pub fn expires_at(&self) -> DateTime<Utc> {
        let ttl = chrono::Duration::milliseconds(self.ttl_ms.min(i64::MAX as u64) as i64);
        self.created_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

/// Lifecycle of a single delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Queued,
    Attempting,
    Retrying,
    Delivered,
    DeadLettered,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Attempting => "attempting",
            Self::Retrying => "retrying",
            Self::Delivered => "delivered",
            Self::DeadLettered => "dead_lettered",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::DeadLettered)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure(String),
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub message_id: MessageId,
    pub recipient: AgentId,
    /// `None` when the recipient had no session at the time of the attempt.
    pub session_id: Option<SessionId>,
    pub at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    /// 1-based.
    pub attempt: u32,
}

/// A message bound to one recipient, the unit of queuing and retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub message: Message,
    pub recipient: AgentId,
    pub state: DeliveryState,
    pub attempts: Vec<DeliveryAttempt>,
    /// Admission order, used to rebuild queues after a restart.
    #[serde(default)]
    pub seq: u64,
}

impl Delivery {
    pub fn new(message: Message, recipient: AgentId) -> Self {
        Self {
            message,
            recipient,
            state: DeliveryState::Queued,
            attempts: Vec::new(),
            seq: 0,
        }
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    pub fn key(&self) -> String {
        delivery_key(&self.message.id, &self.recipient)
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }
}

pub fn delivery_key(message_id: &str, recipient: &str) -> String {
    format!("{message_id}/{recipient}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    MaxAttemptsExceeded,
    TtlExpired,
    /// A fan-out copy could not be queued because the subscriber's queue
    /// was full.
    Backpressure,
    /// A fan-out copy could not be stored after other copies of the same
    /// message were already admitted.
    StorageFailed,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaxAttemptsExceeded => "max_attempts_exceeded",
            Self::TtlExpired => "ttl_expired",
            Self::Backpressure => "backpressure",
            Self::StorageFailed => "storage_failed",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub message: Message,
    pub recipient: AgentId,
    pub attempts: Vec<DeliveryAttempt>,
    pub reason: DeadLetterReason,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn key(&self) -> String {
        delivery_key(&self.message.id, &self.recipient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_bounds() {
        assert_eq!(Priority::new(0), Some(Priority::HIGHEST));
        assert_eq!(Priority::new(3), Some(Priority::LOWEST));
        assert_eq!(Priority::new(4), None);
        assert_eq!(Priority::default().level(), 2);
    }

    #[test]
    fn destination_serializes_with_kind_tag() {
        let json = serde_json::to_value(Destination::Topic("alerts.cpu".into())).unwrap();
        assert_eq!(json["kind"], "topic");
        assert_eq!(json["value"], "alerts.cpu");

        let json = serde_json::to_value(Destination::Broadcast).unwrap();
        assert_eq!(json["kind"], "broadcast");
    }

    #[test]
    fn raw_message_defaults_missing_fields() {
        let raw: RawMessage =
            serde_json::from_str(r#"{"sender":"a","destination":{"kind":"broadcast"}}"#).unwrap();
        assert!(raw.payload.is_empty());
        assert!(!raw.confirm_delivery);
        assert_eq!(raw.pattern, None);
    }

    #[test]
    fn delivery_key_joins_message_and_recipient() {
        assert_eq!(delivery_key("m-1", "agent-b"), "m-1/agent-b");
    }
}

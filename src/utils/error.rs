//! The `error` module defines the error taxonomy surfaced by the broker.
//!
//! Only terminal or synchronous failures are represented here. Transient
//! transport failures never reach callers; the delivery engine retries them
//! internally and turns exhaustion into a dead letter.

use crate::broker::message::{AgentId, DeadLetterReason, MessageId};

pub type Result<T, E = BrokerError> = std::result::Result<T, E>;

/// Errors returned by the public broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Malformed input. Rejected at submission, never retried.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The destination queue is full. The caller owns the retry policy.
    #[error("queue for {destination} is full (capacity {capacity})")]
    Backpressure { destination: AgentId, capacity: usize },

    /// The caller may not address the destination.
    #[error("{caller} is not allowed to send to {destination}")]
    Authorization { caller: AgentId, destination: String },

    /// A request did not receive its response before the deadline.
    #[error("no response for request {correlation_id} before the deadline")]
    DeliveryTimeout { correlation_id: String },

    /// The message reached the dead-letter store.
    #[error("message {message_id} was dead-lettered: {reason}")]
    DeadLetter {
        message_id: MessageId,
        reason: DeadLetterReason,
    },

    /// Protocol negotiation failed or a message used a field the
    /// negotiated version does not carry.
    #[error("protocol negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    /// The owner cancelled the request before a response arrived.
    #[error("request {correlation_id} was cancelled")]
    RequestCancelled { correlation_id: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl BrokerError {
    /// Whether the caller may retry the same call later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backpressure { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("message has no destination")]
    MissingDestination,

    #[error("message has no sender")]
    MissingSender,

    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("priority {0} is outside 0..=3")]
    InvalidPriority(u8),

    #[error("response messages must carry a correlation id")]
    MissingCorrelationId,

    #[error("malformed correlation id {0:?}")]
    MalformedCorrelationId(String),

    #[error("correlation id {0} is already waiting for a response")]
    CorrelationInUse(String),

    #[error("invalid topic {topic:?}: {reason}")]
    InvalidTopic { topic: String, reason: &'static str },

    #[error("publish requires a topic destination")]
    PublishRequiresTopic,

    #[error("topic destinations require the publish pattern")]
    TopicRequiresPublish,

    #[error("requests and responses must be addressed to a single agent")]
    CorrelationRequiresAgent,

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(String),

    #[error("declared version {declared} does not match negotiated version {negotiated}")]
    VersionMismatch { declared: String, negotiated: String },

    #[error("idempotency key must be 1..=256 bytes")]
    InvalidIdempotencyKey,

    #[error("ttl must be greater than zero")]
    ZeroTtl,

    #[error("request repeats idempotency key of message {0}; its response cannot be awaited twice")]
    DuplicateRequest(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NegotiationError {
    #[error("no protocol versions offered")]
    EmptyOffer,

    #[error("malformed protocol version {0:?}")]
    InvalidVersion(String),

    #[error("no common protocol version (offered {offered:?}, supported {supported:?})")]
    NoCommonVersion {
        offered: Vec<String>,
        supported: Vec<String>,
    },

    #[error("field `{field}` requires protocol {required}, session negotiated {negotiated}")]
    UnsupportedField {
        field: &'static str,
        required: String,
        negotiated: String,
    },

    #[error("agent {0} has no open session")]
    NoSession(AgentId),
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(#[from] sled::Error),

    #[error("failed to encode or decode record: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("record {0} not found")]
    NotFound(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("agent {0} is offline")]
    Offline(AgentId),

    #[error("session {0} is closed")]
    SessionClosed(String),

    #[error("transport failure: {0}")]
    Io(String),
}

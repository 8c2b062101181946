//! Structured broker events
//!
//! Every observable transition is published on a broadcast channel. Metrics
//! exporters, audit sinks and transports that forward delivery reports to
//! senders subscribe here; the core never waits on them, and a subscriber
//! that falls behind only loses its own backlog.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::broker::message::{AgentId, CorrelationId, DeadLetterReason, MessageId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BrokerEvent {
    Admitted {
        message_id: MessageId,
        sender: AgentId,
        recipients: usize,
    },
    Duplicate {
        message_id: MessageId,
        sender: AgentId,
    },
    Delivered {
        message_id: MessageId,
        recipient: AgentId,
        attempts: u32,
    },
    RetryScheduled {
        message_id: MessageId,
        recipient: AgentId,
        attempt: u32,
        delay_ms: u64,
    },
    DeadLettered {
        message_id: MessageId,
        recipient: AgentId,
        reason: DeadLetterReason,
    },
    /// Terminal outcome report for a sender that asked for confirmation.
    DeliveryReport {
        sender: AgentId,
        message_id: MessageId,
        recipient: AgentId,
        delivered: bool,
        reason: Option<DeadLetterReason>,
    },
    RequestFulfilled {
        correlation_id: CorrelationId,
        requester: AgentId,
    },
    RequestTimedOut {
        correlation_id: CorrelationId,
        requester: AgentId,
    },
    RequestCancelled {
        correlation_id: CorrelationId,
        requester: AgentId,
    },
    LateResponseDiscarded {
        correlation_id: CorrelationId,
        sender: AgentId,
    },
    Recovered {
        requeued: usize,
        pending_requests: usize,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BrokerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn emit(&self, event: BrokerEvent) {
        trace!(?event, "broker event");
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events_emitted_after_subscribing() {
        let bus = EventBus::new(8);
        bus.emit(BrokerEvent::Duplicate {
            message_id: "before".into(),
            sender: "a".into(),
        });

        let mut rx = bus.subscribe();
        bus.emit(BrokerEvent::Duplicate {
            message_id: "after".into(),
            sender: "a".into(),
        });

        match rx.recv().await.unwrap() {
            BrokerEvent::Duplicate { message_id, .. } => assert_eq!(message_id, "after"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn events_serialize_with_a_tag() {
        let json = serde_json::to_value(BrokerEvent::Recovered {
            requeued: 2,
            pending_requests: 0,
        })
        .unwrap();
        assert_eq!(json["event"], "recovered");
        assert_eq!(json["requeued"], 2);
    }
}

//! Request/response correlation
//!
//! A pending request is a completion handle keyed by correlation id. The
//! handle is resolved exactly once: whoever removes the entry from the map
//! (a matching response, the timeout reaper, or the owner cancelling) is
//! the one that resolves it. Anything arriving for a correlation id that is
//! no longer in the map is late and gets discarded.
//!
//! Requests re-armed after a restart have no waiter, since the caller that
//! was suspended on them lived in the previous process. Their responses are
//! forwarded to the requester as ordinary direct messages instead.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::broker::message::{AgentId, CorrelationId, Destination, Message, MessageId};
use crate::utils::ValidationError;

/// Durable description of a pending request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub correlation_id: CorrelationId,
    pub request_id: MessageId,
    pub requester: AgentId,
    pub recipient: AgentId,
    pub deadline: DateTime<Utc>,
}

/// How a pending request ended.
#[derive(Debug)]
pub enum Resolution {
    Response(Message),
    TimedOut,
    Cancelled,
}

/// What the correlator did with an incoming response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// Handed to the suspended requester.
    Fulfilled(PendingRequest),
    /// Matched a re-armed request; forward to the requester's queue.
    Forward(PendingRequest),
    /// Matched a request whose deadline passed or whose caller stopped
    /// waiting. The request is over and the response is discarded.
    Expired(PendingRequest),
    /// No live request; the response is discarded.
    Unmatched,
}

#[derive(Debug)]
struct Waiting {
    request: PendingRequest,
    waiter: Option<oneshot::Sender<Resolution>>,
}

#[derive(Debug, Default)]
pub struct Correlator {
    pending: DashMap<CorrelationId, Waiting>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request whose caller will suspend on the returned handle.
    pub fn register(
        &self,
        request: PendingRequest,
    ) -> Result<oneshot::Receiver<Resolution>, ValidationError> {
        let (tx, rx) = oneshot::channel();
        self.insert(request, Some(tx))?;
        Ok(rx)
    }

    /// Re-arm a recovered request that nobody is waiting on.
    pub fn rearm(&self, request: PendingRequest) -> Result<(), ValidationError> {
        self.insert(request, None)
    }

    fn insert(
        &self,
        request: PendingRequest,
        waiter: Option<oneshot::Sender<Resolution>>,
    ) -> Result<(), ValidationError> {
        match self.pending.entry(request.correlation_id.clone()) {
            Entry::Occupied(_) => Err(ValidationError::CorrelationInUse(request.correlation_id)),
            Entry::Vacant(vacant) => {
                vacant.insert(Waiting { request, waiter });
                Ok(())
            }
        }
    }

    /// Match a response to its pending request.
    ///
    /// The response must come from the agent the request was sent to and be
    /// addressed to the requester, otherwise it does not match.
    pub fn deliver_response(&self, response: Message, now: DateTime<Utc>) -> ResponseOutcome {
        let Some(correlation_id) = response.correlation_id.clone() else {
            return ResponseOutcome::Unmatched;
        };

        let matches_pair = |entry: &Waiting| {
            entry.request.recipient == response.sender
                && response.destination == Destination::Agent(entry.request.requester.clone())
        };
        let Some((_, entry)) = self
            .pending
            .remove_if(&correlation_id, |_, entry| matches_pair(entry))
        else {
            debug!(%correlation_id, sender = %response.sender, "response matches no pending request");
            return ResponseOutcome::Unmatched;
        };

        let request = entry.request;
        if request.deadline <= now {
            // Past the deadline but not reaped yet: the requester has moved on.
            resolve(entry.waiter, Resolution::TimedOut);
            return ResponseOutcome::Expired(request);
        }

        match entry.waiter {
            None => ResponseOutcome::Forward(request),
            Some(waiter) => {
                if waiter.send(Resolution::Response(response)).is_err() {
                    warn!(%correlation_id, "requester stopped waiting before the response arrived");
                    return ResponseOutcome::Expired(request);
                }
                ResponseOutcome::Fulfilled(request)
            }
        }
    }

    /// Cancel a request on behalf of its owner.
    pub fn cancel(&self, correlation_id: &str, owner: &str) -> Option<PendingRequest> {
        let (_, entry) = self
            .pending
            .remove_if(correlation_id, |_, entry| entry.request.requester == owner)?;
        resolve(entry.waiter, Resolution::Cancelled);
        Some(entry.request)
    }

    /// Time out one request, as its suspended caller does when its own timer
    /// fires first. Returns `None` when something else already resolved it.
    pub fn expire(&self, correlation_id: &str) -> Option<PendingRequest> {
        let (_, entry) = self.pending.remove(correlation_id)?;
        resolve(entry.waiter, Resolution::TimedOut);
        Some(entry.request)
    }

    /// Time out every request whose deadline has passed.
    pub fn reap_expired(&self, now: DateTime<Utc>) -> Vec<PendingRequest> {
        let expired: Vec<CorrelationId> = self
            .pending
            .iter()
            .filter(|e| e.request.deadline <= now)
            .map(|e| e.key().clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| {
                let (_, entry) = self.pending.remove_if(&id, |_, e| e.request.deadline <= now)?;
                resolve(entry.waiter, Resolution::TimedOut);
                Some(entry.request)
            })
            .collect()
    }

    pub fn is_pending(&self, correlation_id: &str) -> bool {
        self.pending.contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

fn resolve(waiter: Option<oneshot::Sender<Resolution>>, resolution: Resolution) {
    if let Some(waiter) = waiter {
        let _ = waiter.send(resolution);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::message::{Pattern, Priority};

    fn pending(id: &str, deadline: DateTime<Utc>) -> PendingRequest {
        PendingRequest {
            correlation_id: id.to_string(),
            request_id: format!("req-{id}"),
            requester: "alice".into(),
            recipient: "bob".into(),
            deadline,
        }
    }

    fn response(id: &str, from: &str) -> Message {
        Message {
            id: "resp".into(),
            sender: from.into(),
            destination: Destination::Agent("alice".into()),
            pattern: Pattern::Response,
            priority: Priority::default(),
            idempotency_key: None,
            correlation_id: Some(id.into()),
            payload: b"pong".to_vec(),
            created_at: Utc::now(),
            ttl_ms: 1000,
            protocol_version: "2.0".into(),
            confirm_delivery: false,
        }
    }

    fn in_secs(secs: i64) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(secs)
    }

    #[tokio::test]
    async fn response_resolves_waiter_once() {
        let correlator = Correlator::new();
        let rx = correlator.register(pending("c1", in_secs(5))).unwrap();

        let outcome = correlator.deliver_response(response("c1", "bob"), Utc::now());
        assert!(matches!(outcome, ResponseOutcome::Fulfilled(_)));
        match rx.await.unwrap() {
            Resolution::Response(msg) => assert_eq!(msg.payload, b"pong"),
            other => panic!("unexpected resolution {other:?}"),
        }

        // second response for the same id is late
        assert_eq!(
            correlator.deliver_response(response("c1", "bob"), Utc::now()),
            ResponseOutcome::Unmatched
        );
    }

    #[test]
    fn duplicate_correlation_ids_are_refused() {
        let correlator = Correlator::new();
        let _rx = correlator.register(pending("c1", in_secs(5))).unwrap();
        assert!(matches!(
            correlator.register(pending("c1", in_secs(5))),
            Err(ValidationError::CorrelationInUse(_))
        ));
    }

    #[test]
    fn responses_from_the_wrong_agent_do_not_match() {
        let correlator = Correlator::new();
        let _rx = correlator.register(pending("c1", in_secs(5))).unwrap();
        assert_eq!(
            correlator.deliver_response(response("c1", "mallory"), Utc::now()),
            ResponseOutcome::Unmatched
        );
        assert!(correlator.is_pending("c1"));
    }

    #[tokio::test]
    async fn reaper_times_out_and_late_response_is_discarded() {
        let correlator = Correlator::new();
        let rx = correlator.register(pending("c1", in_secs(-1))).unwrap();
        let _live = correlator.register(pending("c2", in_secs(60))).unwrap();

        let reaped = correlator.reap_expired(Utc::now());
        assert_eq!(reaped.len(), 1);
        assert!(matches!(rx.await.unwrap(), Resolution::TimedOut));
        assert_eq!(
            correlator.deliver_response(response("c1", "bob"), Utc::now()),
            ResponseOutcome::Unmatched
        );
        assert_eq!(correlator.len(), 1);
    }

    #[tokio::test]
    async fn only_the_owner_can_cancel() {
        let correlator = Correlator::new();
        let rx = correlator.register(pending("c1", in_secs(5))).unwrap();
        assert!(correlator.cancel("c1", "bob").is_none());
        assert!(correlator.cancel("c1", "alice").is_some());
        assert!(matches!(rx.await.unwrap(), Resolution::Cancelled));
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn response_past_the_deadline_expires_the_request() {
        let correlator = Correlator::new();
        let rx = correlator.register(pending("c1", in_secs(-1))).unwrap();

        match correlator.deliver_response(response("c1", "bob"), Utc::now()) {
            ResponseOutcome::Expired(req) => assert_eq!(req.correlation_id, "c1"),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(matches!(rx.await.unwrap(), Resolution::TimedOut));
        assert!(correlator.is_empty());
    }

    #[test]
    fn response_for_an_abandoned_wait_expires_the_request() {
        let correlator = Correlator::new();
        let rx = correlator.register(pending("c1", in_secs(5))).unwrap();
        drop(rx);
        assert!(matches!(
            correlator.deliver_response(response("c1", "bob"), Utc::now()),
            ResponseOutcome::Expired(_)
        ));
    }

    #[test]
    fn rearmed_requests_forward_responses() {
        let correlator = Correlator::new();
        correlator.rearm(pending("c1", in_secs(5))).unwrap();
        match correlator.deliver_response(response("c1", "bob"), Utc::now()) {
            ResponseOutcome::Forward(req) => assert_eq!(req.requester, "alice"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}

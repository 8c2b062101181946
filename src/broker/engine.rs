//! Broker engine
//!
//! `Broker` is the facade transports talk to. It owns every core component
//! and runs a submission through them in a fixed order:
//!
//! 1. negotiate: the caller must hold an open session
//! 2. validate: `RawMessage` becomes a canonical `Message`
//! 3. authorize the destination
//! 4. idempotency check; this happens before anything is enqueued, so of
//!    two concurrent submissions with the same key only one gets past here
//! 5. route: direct, fan-out, or correlate a response
//! 6. persist each delivery, then enqueue it
//!
//! Everything after enqueue belongs to the [`DeliveryEngine`]. Background
//! work (the delivery loop and the request/idempotency reaper) runs on
//! tasks started by [`Broker::spawn_background`]; tests can drive the same
//! work by hand with [`Broker::tick`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::broker::acl::{AllowAll, Authorizer};
use crate::broker::correlator::{Correlator, PendingRequest, Resolution, ResponseOutcome};
use crate::broker::delivery::{DeliveryEngine, DeliverySettings, RetryPolicy};
use crate::broker::events::{BrokerEvent, EventBus};
use crate::broker::ledger::{Admission, IdempotencyLedger};
use crate::broker::message::{
    AgentId, CorrelationId, DeadLetterEntry, DeadLetterReason, Delivery, DeliveryState, Message,
    MessageId, Pattern, RawMessage, delivery_key,
};
use crate::broker::router::{Router, RoutingDecision};
use crate::broker::scheduler::{BackpressurePolicy, Scheduler};
use crate::broker::session::{ProtocolVersion, Session, SessionRegistry};
use crate::broker::topic::{TopicMatcher, TopicPattern};
use crate::broker::validator::Validator;
use crate::persistence::{MessageStore, SledStore};
use crate::transport::{LocalTransport, Transport};
use crate::utils::{BrokerError, Result, ValidationError};

/// What to do with requests that were pending when the process stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PendingRequestRecovery {
    /// Report them as timed out; the waiting caller is gone.
    #[default]
    TimeOut,
    /// Keep unexpired ones; a late response is forwarded to the requester.
    Rearm,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub max_payload_bytes: usize,
    pub queue_capacity: usize,
    /// Weighted round-robin weights, indexed by priority level.
    pub priority_weights: Vec<u32>,
    pub retry: RetryPolicy,
    pub attempt_timeout: Duration,
    pub ack_timeout: Duration,
    pub idempotency_retention: Duration,
    pub default_ttl: Duration,
    pub default_request_timeout: Duration,
    pub backpressure: BackpressurePolicy,
    pub pending_request_recovery: PendingRequestRecovery,
    pub supported_versions: Vec<ProtocolVersion>,
    pub tick_interval: Duration,
    pub reaper_interval: Duration,
    pub event_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: 1024 * 1024,
            queue_capacity: 10_000,
            priority_weights: vec![8, 4, 2, 1],
            retry: RetryPolicy::default(),
            attempt_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(5),
            idempotency_retention: Duration::from_secs(3600),
            default_ttl: Duration::from_secs(3600),
            default_request_timeout: Duration::from_secs(30),
            backpressure: BackpressurePolicy::FailFast,
            pending_request_recovery: PendingRequestRecovery::TimeOut,
            supported_versions: vec![ProtocolVersion::V1_0, ProtocolVersion::V1_1, ProtocolVersion::V2_0],
            tick_interval: Duration::from_millis(50),
            reaper_interval: Duration::from_secs(1),
            event_capacity: 1024,
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(BrokerError::Config(msg.to_string()));
        if self.queue_capacity == 0 {
            return invalid("queue_capacity must be at least 1");
        }
        if self.priority_weights.is_empty() || self.priority_weights.contains(&0) {
            return invalid("priority_weights must be non-empty and positive");
        }
        if self.retry.max_attempts == 0 {
            return invalid("max_attempts must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return invalid("jitter must be within 0.0..=1.0");
        }
        if self.supported_versions.is_empty() {
            return invalid("at least one protocol version must be supported");
        }
        if self.idempotency_retention < self.retry.max_retry_span() {
            return invalid("idempotency_retention must cover the longest retry span");
        }
        Ok(())
    }
}

/// Answer to a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    /// The admitted message, or the original one for a duplicate.
    pub message_id: MessageId,
    /// `false` when the submission was a duplicate and nothing was enqueued.
    pub accepted: bool,
    pub recipients: usize,
    pub correlation_id: Option<CorrelationId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub requests_rearmed: usize,
    pub requests_timed_out: usize,
}

pub struct BrokerBuilder {
    config: BrokerConfig,
    store: Option<Arc<dyn MessageStore>>,
    transport: Option<Arc<dyn Transport>>,
    authorizer: Option<Arc<dyn Authorizer>>,
}

impl BrokerBuilder {
    pub fn store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Falls back to a temporary sled store, an in-process transport and
    /// [`AllowAll`] for anything not set.
    pub fn build(self) -> Result<Arc<Broker>> {
        let config = self.config;
        config.validate()?;

        let store: Arc<dyn MessageStore> = match self.store {
            Some(store) => store,
            None => Arc::new(SledStore::temporary()?),
        };
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(LocalTransport::new()),
        };
        let authorizer: Arc<dyn Authorizer> = match self.authorizer {
            Some(authorizer) => authorizer,
            None => Arc::new(AllowAll),
        };

        let events = EventBus::new(config.event_capacity);
        let sessions = Arc::new(SessionRegistry::new(config.supported_versions.clone()));
        let scheduler = Arc::new(Scheduler::new(config.priority_weights.clone(), config.queue_capacity));
        let delivery = Arc::new(DeliveryEngine::new(
            DeliverySettings {
                retry: config.retry,
                attempt_timeout: config.attempt_timeout,
                ack_timeout: config.ack_timeout,
            },
            scheduler.clone(),
            sessions.clone(),
            transport,
            store.clone(),
            events.clone(),
        ));
        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(Broker {
            validator: Validator::new(
                config.max_payload_bytes,
                config.default_ttl,
                config.supported_versions.clone(),
            ),
            ledger: IdempotencyLedger::new(config.idempotency_retention),
            topics: TopicMatcher::new(),
            correlator: Correlator::new(),
            router: Router,
            sessions,
            scheduler,
            delivery,
            authorizer,
            store,
            events,
            shutdown,
            config,
        }))
    }
}

pub struct Broker {
    config: BrokerConfig,
    validator: Validator,
    ledger: IdempotencyLedger,
    topics: TopicMatcher,
    sessions: Arc<SessionRegistry>,
    scheduler: Arc<Scheduler>,
    delivery: Arc<DeliveryEngine>,
    correlator: Correlator,
    router: Router,
    authorizer: Arc<dyn Authorizer>,
    store: Arc<dyn MessageStore>,
    events: EventBus,
    shutdown: watch::Sender<bool>,
}

struct Admitted {
    receipt: SubmitReceipt,
    waiter: Option<oneshot::Receiver<Resolution>>,
}

impl Admitted {
    fn receipt(message: &Message, recipients: usize) -> Self {
        Self {
            receipt: SubmitReceipt {
                message_id: message.id.clone(),
                accepted: true,
                recipients,
                correlation_id: message.correlation_id.clone(),
            },
            waiter: None,
        }
    }
}

impl Broker {
    pub fn builder(config: BrokerConfig) -> BrokerBuilder {
        BrokerBuilder {
            config,
            store: None,
            transport: None,
            authorizer: None,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn events(&self) -> tokio::sync::broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    pub fn open_session(&self, agent_id: &str, offered: &[String]) -> Result<Session> {
        if agent_id.is_empty() {
            return Err(ValidationError::MissingSender.into());
        }
        let session = self.sessions.open(agent_id, offered)?;
        self.delivery.wake();
        Ok(session)
    }

    /// Close a session. When it was the agent's current one, the agent's
    /// subscriptions go with it; its queue stays and is delivered once it
    /// reconnects.
    pub fn close_session(&self, session_id: &str) -> Option<AgentId> {
        let agent = self.sessions.close(session_id)?;
        let dropped = self.topics.remove_agent(&agent);
        if !dropped.is_empty() {
            debug!(%agent, subscriptions = dropped.len(), "dropped subscriptions of closed session");
        }
        Some(agent)
    }

    pub fn session(&self, agent_id: &str) -> Option<Session> {
        self.sessions.current(agent_id)
    }

    pub fn subscribe(&self, agent_id: &str, pattern: &str) -> Result<bool> {
        let pattern = TopicPattern::parse(pattern)?;
        if !self.authorizer.can_subscribe(agent_id, &pattern) {
            return Err(BrokerError::Authorization {
                caller: agent_id.to_string(),
                destination: format!("topic pattern {pattern}"),
            });
        }
        let added = self.topics.subscribe(agent_id, &pattern);
        debug!(agent = agent_id, %pattern, added, "subscribe");
        Ok(added)
    }

    /// Deliveries already fanned out to the agent stay queued.
    pub fn unsubscribe(&self, agent_id: &str, pattern: &str) -> Result<bool> {
        let pattern = TopicPattern::parse(pattern)?;
        let removed = self.topics.unsubscribe(agent_id, &pattern);
        debug!(agent = agent_id, %pattern, removed, "unsubscribe");
        Ok(removed)
    }

    pub fn subscriptions(&self, agent_id: &str) -> Vec<String> {
        self.topics.subscriptions(agent_id)
    }

    /// Admit a message for delivery.
    ///
    /// A request submitted this way is tracked for
    /// `default_request_timeout` and its response is delivered to the
    /// requester's queue like any other message. Use [`Broker::request`]
    /// to suspend on the response instead.
    pub async fn submit(&self, caller: &str, raw: RawMessage) -> Result<SubmitReceipt> {
        Ok(self.admit(caller, raw, None).await?.receipt)
    }

    /// Send a request and wait up to `timeout` for the matching response.
    /// Dropping the returned future abandons the wait; the request then
    /// times out on its own. A request that is dead-lettered before any
    /// response arrives fails with `DeadLetter` right away.
    pub async fn request(&self, caller: &str, mut raw: RawMessage, timeout: Duration) -> Result<Message> {
        raw.pattern = Some(Pattern::Request);
        let mut events = self.events.subscribe();
        let admitted = self.admit(caller, raw, Some(timeout)).await?;
        let correlation_id = admitted.receipt.correlation_id.unwrap_or_default();
        let request_id = admitted.receipt.message_id;
        let Some(mut waiter) = admitted.waiter else {
            return Err(ValidationError::DuplicateRequest(request_id).into());
        };

        let resolved = tokio::select! {
            resolved = tokio::time::timeout(timeout, &mut waiter) => resolved,
            reason = dead_lettered(&mut events, &request_id) => {
                if let Some(request) = self.correlator.cancel(&correlation_id, caller) {
                    self.forget_pending(&request.correlation_id);
                }
                return Err(BrokerError::DeadLetter { message_id: request_id, reason });
            }
        };

        match resolved {
            Ok(Ok(Resolution::Response(response))) => Ok(response),
            Ok(Ok(Resolution::TimedOut)) => Err(BrokerError::DeliveryTimeout { correlation_id }),
            Ok(Ok(Resolution::Cancelled)) | Ok(Err(_)) => Err(BrokerError::RequestCancelled { correlation_id }),
            Err(_) => {
                if let Some(request) = self.correlator.expire(&correlation_id) {
                    self.request_timed_out(request);
                    return Err(BrokerError::DeliveryTimeout { correlation_id });
                }
                // Resolved between the timer firing and the expiry above.
                match waiter.try_recv() {
                    Ok(Resolution::Response(response)) => Ok(response),
                    Ok(Resolution::Cancelled) => Err(BrokerError::RequestCancelled { correlation_id }),
                    _ => Err(BrokerError::DeliveryTimeout { correlation_id }),
                }
            }
        }
    }

    /// Cancel a pending request. Only the requester may cancel it.
    pub fn cancel_request(&self, caller: &str, correlation_id: &str) -> bool {
        let Some(request) = self.correlator.cancel(correlation_id, caller) else {
            return false;
        };
        self.forget_pending(&request.correlation_id);
        info!(%correlation_id, requester = caller, "request cancelled");
        self.events.emit(BrokerEvent::RequestCancelled {
            correlation_id: request.correlation_id,
            requester: request.requester,
        });
        true
    }

    /// Confirm receipt of a delivery the transport left pending.
    pub fn acknowledge(&self, caller: &str, message_id: &str) -> bool {
        self.sessions.touch(caller);
        self.delivery.acknowledge(caller, message_id)
    }

    pub fn queue_depth(&self, agent_id: &str) -> usize {
        self.scheduler.depth(agent_id)
    }

    pub fn dead_letters(&self) -> Result<Vec<DeadLetterEntry>> {
        Ok(self.store.dead_letters()?)
    }

    pub fn purge_dead_letter(&self, message_id: &str, recipient: &str) -> Result<bool> {
        let purged = self.store.purge_dead_letter(&delivery_key(message_id, recipient))?;
        if purged {
            info!(%message_id, %recipient, "dead letter purged");
        }
        Ok(purged)
    }

    /// Rebuild in-memory state from the store after a restart.
    ///
    /// Every delivery that was queued, being attempted or waiting to retry
    /// goes back into its queue in admission order, so an interrupted
    /// attempt is retried rather than lost. Idempotency entries of those
    /// messages are restored too.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let now = Utc::now();

        let mut live = Vec::new();
        for state in [DeliveryState::Queued, DeliveryState::Attempting, DeliveryState::Retrying] {
            live.extend(self.store.list_by_state(state)?);
        }
        live.sort_by_key(|d| d.seq);

        for mut delivery in live {
            if delivery.state != DeliveryState::Queued {
                self.store.update_state(&delivery.key(), DeliveryState::Queued)?;
                delivery.state = DeliveryState::Queued;
            }
            let message = &delivery.message;
            self.ledger.check_and_record(
                &message.sender,
                message.idempotency_key.as_deref(),
                &message.id,
                message.created_at,
            );
            self.sessions.remember(&delivery.recipient);
            self.scheduler.restore(delivery);
            report.requeued += 1;
        }

        for request in self.store.pending_requests()? {
            let rearm = self.config.pending_request_recovery == PendingRequestRecovery::Rearm
                && request.deadline > now;
            if rearm {
                match self.correlator.rearm(request.clone()) {
                    Ok(()) => {
                        report.requests_rearmed += 1;
                        continue;
                    }
                    Err(e) => warn!(error = %e, "could not re-arm recovered request"),
                }
            }
            self.request_timed_out(request);
            report.requests_timed_out += 1;
        }

        info!(
            requeued = report.requeued,
            rearmed = report.requests_rearmed,
            timed_out = report.requests_timed_out,
            "recovery complete"
        );
        self.events.emit(BrokerEvent::Recovered {
            requeued: report.requeued,
            pending_requests: report.requests_rearmed,
        });
        self.delivery.wake();
        Ok(report)
    }

    /// One pass of all periodic work. Returns how many delivery attempts
    /// were started.
    pub fn tick(&self) -> usize {
        self.reap();
        self.delivery.pump()
    }

    /// Start the delivery loop and the reaper on the current runtime.
    pub fn spawn_background(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let delivery = tokio::spawn(
            self.delivery
                .clone()
                .run(self.shutdown.subscribe(), self.config.tick_interval),
        );

        let broker = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let reaper = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(broker.config.reaper_interval) => broker.reap(),
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("reaper stopped");
        });

        vec![delivery, reaper]
    }

    /// Stop background tasks started by [`Broker::spawn_background`].
    pub fn shutdown(&self) {
        info!("broker shutting down");
        self.shutdown.send_replace(true);
    }

    fn reap(&self) {
        for request in self.correlator.reap_expired(Utc::now()) {
            self.request_timed_out(request);
        }
        let purged = self.ledger.purge_expired(Utc::now());
        if purged > 0 {
            debug!(purged, "expired idempotency entries");
        }
    }

    async fn admit(&self, caller: &str, raw: RawMessage, wait: Option<Duration>) -> Result<Admitted> {
        let version = self.sessions.negotiated_version(caller)?;
        self.sessions.touch(caller);
        let message = self.validator.validate(caller, raw, version)?;

        if !self.authorizer.can_send(caller, &message.destination) {
            warn!(caller, destination = %message.destination, "submission refused");
            return Err(BrokerError::Authorization {
                caller: caller.to_string(),
                destination: message.destination.to_string(),
            });
        }

        let admission = self.ledger.check_and_record(
            &message.sender,
            message.idempotency_key.as_deref(),
            &message.id,
            Utc::now(),
        );
        if let Admission::Duplicate(original) = admission {
            info!(sender = %message.sender, original = %original, "duplicate submission");
            self.events.emit(BrokerEvent::Duplicate {
                message_id: original.clone(),
                sender: message.sender.clone(),
            });
            return Ok(Admitted {
                receipt: SubmitReceipt {
                    message_id: original,
                    accepted: false,
                    recipients: 0,
                    correlation_id: message.correlation_id,
                },
                waiter: None,
            });
        }

        let sender = message.sender.clone();
        let key = message.idempotency_key.clone();
        let message_id = message.id.clone();

        let admitted = match self.router.route(&message, &self.topics, &self.sessions) {
            RoutingDecision::Correlate(_) => self.correlate(message).await,
            RoutingDecision::Direct(recipient) => self.admit_direct(message, recipient, wait).await,
            RoutingDecision::Fanout(recipients) => self.fan_out(message, recipients).await,
        };

        match &admitted {
            Ok(a) => {
                debug!(message_id = %a.receipt.message_id, recipients = a.receipt.recipients, "admitted");
                self.events.emit(BrokerEvent::Admitted {
                    message_id,
                    sender,
                    recipients: a.receipt.recipients,
                });
            }
            Err(_) => {
                if let Some(key) = key {
                    self.ledger.forget(&sender, &key, &message_id);
                }
            }
        }
        admitted
    }

    async fn admit_direct(
        &self,
        message: Message,
        recipient: AgentId,
        wait: Option<Duration>,
    ) -> Result<Admitted> {
        let mut admitted = Admitted::receipt(&message, 1);

        let pending = match (message.pattern, &message.correlation_id) {
            (Pattern::Request, Some(correlation_id)) => {
                let timeout = wait.unwrap_or(self.config.default_request_timeout);
                let request = PendingRequest {
                    correlation_id: correlation_id.clone(),
                    request_id: message.id.clone(),
                    requester: message.sender.clone(),
                    recipient: recipient.clone(),
                    deadline: deadline_after(timeout),
                };
                match wait {
                    Some(_) => admitted.waiter = Some(self.correlator.register(request.clone())?),
                    None => self.correlator.rearm(request.clone())?,
                }
                if let Err(e) = self.store.save_pending_request(&request) {
                    self.correlator.cancel(&request.correlation_id, &request.requester);
                    return Err(e.into());
                }
                Some(request)
            }
            _ => None,
        };

        let queued = self.persist_and_enqueue(Delivery::new(message, recipient.clone())).await;
        if let Err(e) = queued {
            if let Some(request) = pending {
                self.correlator.cancel(&request.correlation_id, &request.requester);
                self.forget_pending(&request.correlation_id);
            }
            return Err(e);
        }
        Ok(admitted)
    }

    async fn fan_out(&self, message: Message, recipients: Vec<AgentId>) -> Result<Admitted> {
        if recipients.is_empty() {
            info!(message_id = %message.id, destination = %message.destination, "no recipients");
        }
        let admitted = Admitted::receipt(&message, recipients.len());
        let mut copies = recipients.into_iter();
        let mut stored_any = false;
        while let Some(recipient) = copies.next() {
            let delivery = Delivery::new(message.clone(), recipient);
            let stored = self.store.next_sequence().and_then(|seq| {
                let delivery = delivery.clone().with_seq(seq);
                self.store.append(&delivery).map(|()| delivery)
            });
            let delivery = match stored {
                Ok(delivery) => delivery,
                Err(e) if !stored_any => return Err(e.into()),
                Err(e) => {
                    // Earlier copies are already out, so the submission stands
                    // and keeps its idempotency key.
                    error!(message_id = %message.id, error = %e, "fan-out interrupted by storage failure");
                    let rest = copies
                        .by_ref()
                        .map(|recipient| Delivery::new(message.clone(), recipient));
                    for unstored in std::iter::once(delivery).chain(rest) {
                        self.delivery
                            .dead_letter_unqueued(unstored, DeadLetterReason::StorageFailed);
                    }
                    break;
                }
            };
            stored_any = true;
            if let Err(rejected) = self.enqueue(delivery).await {
                self.delivery
                    .dead_letter_unqueued(rejected, DeadLetterReason::Backpressure);
            }
        }
        Ok(admitted)
    }

    async fn correlate(&self, response: Message) -> Result<Admitted> {
        let correlation_id = response.correlation_id.clone().unwrap_or_default();
        match self.correlator.deliver_response(response.clone(), Utc::now()) {
            ResponseOutcome::Fulfilled(request) => {
                self.request_fulfilled(request);
                Ok(Admitted::receipt(&response, 1))
            }
            ResponseOutcome::Forward(request) => {
                let requester = request.requester.clone();
                self.request_fulfilled(request);
                let admitted = Admitted::receipt(&response, 1);
                self.persist_and_enqueue(Delivery::new(response, requester)).await?;
                Ok(admitted)
            }
            ResponseOutcome::Expired(request) => {
                self.request_timed_out(request);
                self.discard_late_response(correlation_id, &response)
            }
            ResponseOutcome::Unmatched => self.discard_late_response(correlation_id, &response),
        }
    }

    fn discard_late_response(&self, correlation_id: CorrelationId, response: &Message) -> Result<Admitted> {
        info!(%correlation_id, sender = %response.sender, "discarding response with no pending request");
        self.events.emit(BrokerEvent::LateResponseDiscarded {
            correlation_id,
            sender: response.sender.clone(),
        });
        Ok(Admitted::receipt(response, 0))
    }

    /// Write a direct delivery to the store and queue it. A full queue is
    /// the caller's problem: the record is dropped and `Backpressure`
    /// returned.
    async fn persist_and_enqueue(&self, delivery: Delivery) -> Result<()> {
        let delivery = delivery.with_seq(self.store.next_sequence()?);
        let key = delivery.key();
        self.store.append(&delivery)?;
        if let Err(rejected) = self.enqueue(delivery).await {
            self.store.remove(&key)?;
            warn!(destination = %rejected.recipient, "queue full, refusing submission");
            return Err(BrokerError::Backpressure {
                destination: rejected.recipient,
                capacity: self.scheduler.capacity(),
            });
        }
        Ok(())
    }

    async fn enqueue(&self, delivery: Delivery) -> std::result::Result<(), Delivery> {
        let mut delivery = match self.scheduler.enqueue(delivery) {
            Ok(()) => {
                self.delivery.wake();
                return Ok(());
            }
            Err(rejected) => rejected,
        };
        let BackpressurePolicy::Block { max_wait } = self.config.backpressure else {
            return Err(delivery);
        };

        let deadline = Instant::now() + max_wait;
        loop {
            let notified = self.scheduler.space_notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            delivery = match self.scheduler.enqueue(delivery) {
                Ok(()) => {
                    self.delivery.wake();
                    return Ok(());
                }
                Err(rejected) => rejected,
            };
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(delivery);
            }
        }
    }

    fn request_fulfilled(&self, request: PendingRequest) {
        self.forget_pending(&request.correlation_id);
        debug!(correlation_id = %request.correlation_id, "request fulfilled");
        self.events.emit(BrokerEvent::RequestFulfilled {
            correlation_id: request.correlation_id,
            requester: request.requester,
        });
    }

    fn request_timed_out(&self, request: PendingRequest) {
        self.forget_pending(&request.correlation_id);
        info!(correlation_id = %request.correlation_id, requester = %request.requester, "request timed out");
        self.events.emit(BrokerEvent::RequestTimedOut {
            correlation_id: request.correlation_id,
            requester: request.requester,
        });
    }

    fn forget_pending(&self, correlation_id: &str) {
        if let Err(e) = self.store.remove_pending_request(correlation_id) {
            error!(%correlation_id, error = %e, "failed to remove pending request");
        }
    }
}

/// Resolves once the given message is dead-lettered.
async fn dead_lettered(events: &mut broadcast::Receiver<BrokerEvent>, message_id: &str) -> DeadLetterReason {
    loop {
        match events.recv().await {
            Ok(BrokerEvent::DeadLettered { message_id: id, reason, .. }) if id == message_id => return reason,
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

fn deadline_after(timeout: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|delta| Utc::now().checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("config", &self.config)
            .field("delivery", &self.delivery)
            .field("pending_requests", &self.correlator.len())
            .finish()
    }
}

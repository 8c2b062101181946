//! Delivery engine
//!
//! Moves deliveries from the scheduler's queues to the transport and owns
//! everything that happens afterwards: attempt history, acknowledgement
//! deadlines, retries with backoff, and dead-lettering.
//!
//! Each destination has at most one delivery in flight. While a delivery is
//! being attempted, waiting for an acknowledgement, or waiting out a retry
//! delay, its destination stays busy and nothing behind it is sent. That is
//! what keeps per-destination order intact across retries; different
//! destinations proceed independently.
//!
//! Retries are not sleeping tasks. A failed delivery goes into a min-heap
//! keyed by its due time, and [`DeliveryEngine::pump`] puts due entries back
//! at the head of their queue.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::broker::events::{BrokerEvent, EventBus};
use crate::broker::message::{
    AgentId, AttemptOutcome, DeadLetterEntry, DeadLetterReason, Delivery, DeliveryAttempt,
    DeliveryState, SessionId, delivery_key,
};
use crate::broker::scheduler::Scheduler;
use crate::broker::session::SessionRegistry;
use crate::persistence::MessageStore;
use crate::transport::{SendOutcome, Transport};
use crate::utils::StorageError;

/// Exponential backoff with a cap and proportional jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
    /// Fraction of the delay, `0.0..=1.0`, added or removed at random.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, without jitter. `attempt` is the
    /// number of attempts made so far.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.cap)
            .min(self.cap)
    }

    /// `backoff` spread by jitter. `sample` is uniform in `0.0..1.0`.
    pub fn backoff_with_jitter(&self, attempt: u32, sample: f64) -> Duration {
        let delay = self.backoff(attempt).as_secs_f64();
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = 1.0 + jitter * (2.0 * sample.clamp(0.0, 1.0) - 1.0);
        Duration::from_secs_f64((delay * factor).max(0.0))
    }

    /// Worst-case time from the first attempt to the last, ignoring jitter.
    /// The idempotency window should be at least this long.
    pub fn max_retry_span(&self) -> Duration {
        (1..self.max_attempts).map(|n| self.backoff(n)).sum()
    }
}

#[derive(Debug)]
struct Scheduled {
    due: Instant,
    seq: u64,
    delivery: Delivery,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due.cmp(&other.due).then(self.seq.cmp(&other.seq))
    }
}

/// Deliveries waiting out a backoff delay, earliest first.
#[derive(Debug, Default)]
pub struct RetrySchedule {
    heap: Mutex<BinaryHeap<Reverse<Scheduled>>>,
    counter: AtomicU64,
}

impl RetrySchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&self, delivery: Delivery, due: Instant) {
        let seq = self.counter.fetch_add(1, AtomicOrdering::Relaxed);
        self.heap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Reverse(Scheduled { due, seq, delivery }));
    }

    /// Remove and return every delivery due at or before `now`.
    pub fn take_due(&self, now: Instant) -> Vec<Delivery> {
        let mut heap = self.heap.lock().unwrap_or_else(PoisonError::into_inner);
        let mut due = Vec::new();
        while heap.peek().is_some_and(|Reverse(s)| s.due <= now) {
            if let Some(Reverse(scheduled)) = heap.pop() {
                due.push(scheduled.delivery);
            }
        }
        due
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.heap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .peek()
            .map(|Reverse(s)| s.due)
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
struct AwaitingAck {
    delivery: Delivery,
    session_id: SessionId,
    deadline: Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct DeliverySettings {
    pub retry: RetryPolicy,
    /// Upper bound on a single `Transport::send`.
    pub attempt_timeout: Duration,
    /// How long a `Pending` send may wait for `acknowledge`.
    pub ack_timeout: Duration,
}

pub struct DeliveryEngine {
    settings: DeliverySettings,
    scheduler: Arc<Scheduler>,
    sessions: Arc<SessionRegistry>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn MessageStore>,
    events: EventBus,
    retries: RetrySchedule,
    busy: DashSet<AgentId>,
    awaiting_ack: DashMap<String, AwaitingAck>,
    wake: Notify,
}

impl DeliveryEngine {
    pub fn new(
        settings: DeliverySettings,
        scheduler: Arc<Scheduler>,
        sessions: Arc<SessionRegistry>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn MessageStore>,
        events: EventBus,
    ) -> Self {
        Self {
            settings,
            scheduler,
            sessions,
            transport,
            store,
            events,
            retries: RetrySchedule::new(),
            busy: DashSet::new(),
            awaiting_ack: DashMap::new(),
            wake: Notify::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.settings.retry
    }

    /// Ask the run loop to pump soon.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// One scheduling pass: release due retries, expire overdue
    /// acknowledgements, then start an attempt for every idle destination
    /// with queued work. Returns how many attempts were started.
    pub fn pump(self: &Arc<Self>) -> usize {
        let now = Instant::now();

        for delivery in self.retries.take_due(now) {
            let recipient = delivery.recipient.clone();
            self.persist("requeue", self.store.update_state(&delivery.key(), DeliveryState::Queued));
            self.scheduler.requeue_front(Delivery {
                state: DeliveryState::Queued,
                ..delivery
            });
            self.busy.remove(&recipient);
        }

        let overdue: Vec<String> = self
            .awaiting_ack
            .iter()
            .filter(|e| e.deadline <= now)
            .map(|e| e.key().clone())
            .collect();
        for key in overdue {
            if let Some((_, waiting)) = self.awaiting_ack.remove_if(&key, |_, w| w.deadline <= now) {
                debug!(delivery = %key, "acknowledgement deadline passed");
                let mut delivery = waiting.delivery;
                self.record_attempt(&mut delivery, Some(waiting.session_id), AttemptOutcome::Timeout);
                self.fail(delivery);
            }
        }

        let mut started = 0;
        for destination in self.scheduler.ready_destinations() {
            if !self.busy.insert(destination.clone()) {
                continue;
            }
            match self.scheduler.dequeue(&destination) {
                Some(delivery) => {
                    started += 1;
                    let engine = Arc::clone(self);
                    tokio::spawn(async move { engine.attempt(delivery).await });
                }
                None => {
                    self.busy.remove(&destination);
                }
            }
        }
        started
    }

    /// Pump until `shutdown` flips, sleeping at most `tick` between passes.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>, tick: Duration) {
        info!("delivery loop started");
        loop {
            self.pump();

            let mut sleep_for = tick;
            if let Some(due) = self.retries.next_due() {
                sleep_for = sleep_for.min(due.saturating_duration_since(Instant::now()));
            }

            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("delivery loop stopped");
    }

    async fn attempt(self: Arc<Self>, mut delivery: Delivery) {
        let key = delivery.key();

        if delivery.message.is_expired(Utc::now()) {
            self.dead_letter(delivery, DeadLetterReason::TtlExpired);
            return;
        }

        delivery.state = DeliveryState::Attempting;
        self.persist("attempting", self.store.update_state(&key, DeliveryState::Attempting));

        let session = self
            .sessions
            .current(&delivery.recipient)
            .filter(|_| self.transport.is_online(&delivery.recipient));
        let Some(session) = session else {
            debug!(delivery = %key, "recipient offline");
            self.record_attempt(&mut delivery, None, AttemptOutcome::Failure("recipient offline".into()));
            self.fail(delivery);
            return;
        };

        let sent = tokio::time::timeout(
            self.settings.attempt_timeout,
            self.transport.send(&session.id, &delivery.message),
        )
        .await;

        let outcome = match sent {
            Err(_) => AttemptOutcome::Timeout,
            Ok(Err(e)) => AttemptOutcome::Failure(e.to_string()),
            Ok(Ok(SendOutcome::Nacked(reason))) => AttemptOutcome::Failure(reason),
            Ok(Ok(SendOutcome::Acked)) => AttemptOutcome::Success,
            Ok(Ok(SendOutcome::Pending)) => {
                self.awaiting_ack.insert(
                    key,
                    AwaitingAck {
                        delivery,
                        session_id: session.id,
                        deadline: Instant::now() + self.settings.ack_timeout,
                    },
                );
                return;
            }
        };

        let success = outcome == AttemptOutcome::Success;
        self.record_attempt(&mut delivery, Some(session.id), outcome);
        if success {
            self.delivered(delivery);
        } else {
            self.fail(delivery);
        }
    }

    /// Settle a delivery that is waiting for the recipient's
    /// acknowledgement. Returns `false` for unknown or already settled ids.
    pub fn acknowledge(&self, recipient: &str, message_id: &str) -> bool {
        let key = delivery_key(message_id, recipient);
        let Some((_, waiting)) = self.awaiting_ack.remove(&key) else {
            warn!(%recipient, %message_id, "acknowledgement for unknown delivery");
            return false;
        };
        let mut delivery = waiting.delivery;
        self.record_attempt(&mut delivery, Some(waiting.session_id), AttemptOutcome::Success);
        self.delivered(delivery);
        true
    }

    fn record_attempt(&self, delivery: &mut Delivery, session_id: Option<SessionId>, outcome: AttemptOutcome) {
        let attempt = DeliveryAttempt {
            message_id: delivery.message.id.clone(),
            recipient: delivery.recipient.clone(),
            session_id,
            at: Utc::now(),
            outcome,
            attempt: delivery.attempt_count() + 1,
        };
        self.persist("attempt", self.store.record_attempt(&delivery.key(), &attempt));
        delivery.attempts.push(attempt);
    }

    fn delivered(&self, mut delivery: Delivery) {
        delivery.state = DeliveryState::Delivered;
        self.persist("delivered", self.store.update_state(&delivery.key(), DeliveryState::Delivered));
        debug!(message_id = %delivery.message.id, recipient = %delivery.recipient, "delivered");

        self.events.emit(BrokerEvent::Delivered {
            message_id: delivery.message.id.clone(),
            recipient: delivery.recipient.clone(),
            attempts: delivery.attempt_count(),
        });
        self.report(&delivery, true, None);
        self.release(&delivery.recipient);
    }

    fn fail(&self, mut delivery: Delivery) {
        let attempts = delivery.attempt_count();
        if attempts >= self.settings.retry.max_attempts {
            self.dead_letter(delivery, DeadLetterReason::MaxAttemptsExceeded);
            return;
        }
        if delivery.message.is_expired(Utc::now()) {
            self.dead_letter(delivery, DeadLetterReason::TtlExpired);
            return;
        }

        let delay = self
            .settings
            .retry
            .backoff_with_jitter(attempts, rand::random::<f64>());
        delivery.state = DeliveryState::Retrying;
        self.persist("retrying", self.store.update_state(&delivery.key(), DeliveryState::Retrying));
        debug!(
            message_id = %delivery.message.id,
            recipient = %delivery.recipient,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduling retry"
        );
        self.events.emit(BrokerEvent::RetryScheduled {
            message_id: delivery.message.id.clone(),
            recipient: delivery.recipient.clone(),
            attempt: attempts,
            delay_ms: delay.as_millis() as u64,
        });
        self.retries.schedule(delivery, Instant::now() + delay);
        self.wake();
    }

    fn dead_letter(&self, delivery: Delivery, reason: DeadLetterReason) {
        let recipient = delivery.recipient.clone();
        self.dead_letter_unqueued(delivery, reason);
        self.release(&recipient);
    }

    /// Dead-letter a delivery that never reached a queue, such as a fan-out
    /// copy refused by a full subscriber queue.
    pub fn dead_letter_unqueued(&self, delivery: Delivery, reason: DeadLetterReason) {
        warn!(
            message_id = %delivery.message.id,
            recipient = %delivery.recipient,
            %reason,
            attempts = delivery.attempt_count(),
            "dead-lettering delivery"
        );
        let entry = DeadLetterEntry {
            message: delivery.message.clone(),
            recipient: delivery.recipient.clone(),
            attempts: delivery.attempts.clone(),
            reason,
            dead_lettered_at: Utc::now(),
        };
        self.persist("dead letter", self.store.record_dead_letter(&entry));
        self.events.emit(BrokerEvent::DeadLettered {
            message_id: delivery.message.id.clone(),
            recipient: delivery.recipient.clone(),
            reason,
        });
        self.report(&delivery, false, Some(reason));
    }

    fn report(&self, delivery: &Delivery, delivered: bool, reason: Option<DeadLetterReason>) {
        if delivery.message.confirm_delivery {
            self.events.emit(BrokerEvent::DeliveryReport {
                sender: delivery.message.sender.clone(),
                message_id: delivery.message.id.clone(),
                recipient: delivery.recipient.clone(),
                delivered,
                reason,
            });
        }
    }

    fn release(&self, destination: &str) {
        self.busy.remove(destination);
        self.wake();
    }

    fn persist(&self, what: &str, result: Result<(), StorageError>) {
        if let Err(e) = result {
            error!(error = %e, "failed to persist {what}");
        }
    }

    /// Whether a delivery for `destination` is being attempted, awaiting an
    /// acknowledgement, or waiting to be retried.
    pub fn is_busy(&self, destination: &str) -> bool {
        self.busy.contains(destination)
    }

    pub fn pending_retries(&self) -> usize {
        self.retries.len()
    }

    pub fn awaiting_acks(&self) -> usize {
        self.awaiting_ack.len()
    }
}

impl std::fmt::Debug for DeliveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryEngine")
            .field("settings", &self.settings)
            .field("busy", &self.busy.len())
            .field("retries", &self.retries.len())
            .field("awaiting_ack", &self.awaiting_ack.len())
            .finish()
    }
}

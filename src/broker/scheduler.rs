//! Priority scheduler
//!
//! Every destination owns a bounded queue split into one FIFO per priority
//! level. Dequeue runs weighted round-robin over the levels: each level
//! starts a round with credit equal to its weight and spends one credit per
//! message served. The highest-priority level that has both work and credit
//! is served first, so with a single busy level the order is strictly by
//! priority. A round ends, and credits refill, once no level with pending
//! work has credit left or the round has served `sum(weights)` messages.
//! A waiting message therefore never sits behind more than
//! `sum(weights) - weight(own level)` others from higher levels.
//!
//! Queues live behind their own `Mutex` inside a sharded map; the shard lock
//! is only held long enough to clone the queue handle, so work on different
//! destinations does not contend.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;

use crate::broker::message::{AgentId, Delivery, Priority};

#[derive(Debug)]
pub struct PriorityQueue {
    levels: Vec<VecDeque<Delivery>>,
    weights: Vec<u32>,
    credits: Vec<u32>,
    served_in_round: u32,
    capacity: usize,
    len: usize,
}

impl PriorityQueue {
    /// `weights` is indexed by priority level; missing levels get weight 1
    /// and zero weights are raised to 1 so no level can be starved outright.
    pub fn new(weights: &[u32], capacity: usize) -> Self {
        let weights: Vec<u32> = (0..Priority::LEVELS)
            .map(|level| weights.get(level).copied().unwrap_or(1).max(1))
            .collect();
        Self {
            levels: (0..Priority::LEVELS).map(|_| VecDeque::new()).collect(),
            credits: weights.clone(),
            weights,
            served_in_round: 0,
            capacity,
            len: 0,
        }
    }

    /// Append to the tail of the delivery's level. Hands the delivery back
    /// when the queue is at capacity.
    pub fn push(&mut self, delivery: Delivery) -> Result<(), Delivery> {
        if self.len >= self.capacity {
            return Err(delivery);
        }
        self.push_back_unchecked(delivery);
        Ok(())
    }

    /// Return a delivery to the head of its level. Ignores capacity: the
    /// delivery was already admitted and must not be lost.
    pub fn push_front(&mut self, delivery: Delivery) {
        let level = delivery.message.priority.level();
        self.levels[level].push_front(delivery);
        self.len += 1;
    }

    pub fn pop(&mut self) -> Option<Delivery> {
        if self.len == 0 {
            return None;
        }
        if self.served_in_round >= self.round_length() {
            self.start_round();
        }

        let level = match self.eligible_level() {
            Some(level) => level,
            None => {
                self.start_round();
                self.eligible_level()?
            }
        };

        self.credits[level] -= 1;
        self.served_in_round += 1;
        self.len -= 1;
        self.levels[level].pop_front()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn level_len(&self, priority: Priority) -> usize {
        self.levels[priority.level()].len()
    }

    /// Upper bound on how many messages can be served ahead of the head of
    /// `priority` once that head is waiting.
    pub fn max_wait(&self, priority: Priority) -> u32 {
        self.round_length() - self.weights[priority.level()]
    }

    fn push_back_unchecked(&mut self, delivery: Delivery) {
        let level = delivery.message.priority.level();
        self.levels[level].push_back(delivery);
        self.len += 1;
    }

    fn eligible_level(&self) -> Option<usize> {
        (0..self.levels.len()).find(|&l| !self.levels[l].is_empty() && self.credits[l] > 0)
    }

    fn start_round(&mut self) {
        self.credits.copy_from_slice(&self.weights);
        self.served_in_round = 0;
    }

    fn round_length(&self) -> u32 {
        self.weights.iter().sum()
    }
}

/// What an enqueue onto a full queue should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    FailFast,
    /// Wait up to `max_wait` for space, then fail.
    Block { max_wait: std::time::Duration },
}

#[derive(Debug)]
pub struct Scheduler {
    queues: DashMap<AgentId, Arc<Mutex<PriorityQueue>>>,
    weights: Vec<u32>,
    capacity: usize,
    space: Notify,
}

impl Scheduler {
    pub fn new(weights: Vec<u32>, capacity: usize) -> Self {
        Self {
            queues: DashMap::new(),
            weights,
            capacity,
            space: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a delivery to its recipient's queue, creating the queue on
    /// first use. Hands the delivery back when the queue is full.
    pub fn enqueue(&self, delivery: Delivery) -> Result<(), Delivery> {
        let queue = self.queue(&delivery.recipient);
        let mut queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
        queue.push(delivery)
    }

    pub fn requeue_front(&self, delivery: Delivery) {
        let queue = self.queue(&delivery.recipient);
        let mut queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
        queue.push_front(delivery);
    }

    /// Append without a capacity check, for deliveries rebuilt from the
    /// store on recovery.
    pub fn restore(&self, delivery: Delivery) {
        let queue = self.queue(&delivery.recipient);
        let mut queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
        queue.push_back_unchecked(delivery);
    }

    pub fn dequeue(&self, destination: &str) -> Option<Delivery> {
        let queue = self.queues.get(destination).map(|q| q.value().clone())?;
        let delivery = queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        if delivery.is_some() {
            self.space.notify_waiters();
        }
        delivery
    }

    pub fn depth(&self, destination: &str) -> usize {
        self.queues
            .get(destination)
            .map(|q| q.value().clone())
            .map(|q| q.lock().unwrap_or_else(PoisonError::into_inner).len())
            .unwrap_or(0)
    }

    pub fn has_queue(&self, destination: &str) -> bool {
        self.queues.contains_key(destination)
    }

    /// Destinations with at least one queued delivery, sorted.
    pub fn ready_destinations(&self) -> Vec<AgentId> {
        let handles: Vec<(AgentId, Arc<Mutex<PriorityQueue>>)> = self
            .queues
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let mut ready: Vec<AgentId> = handles
            .into_iter()
            .filter(|(_, q)| !q.lock().unwrap_or_else(PoisonError::into_inner).is_empty())
            .map(|(dest, _)| dest)
            .collect();
        ready.sort();
        ready
    }

    /// Future that resolves after some queue gives up a slot. Create and
    /// `enable` it before retrying an enqueue so no wakeup is missed.
    pub fn space_notified(&self) -> Notified<'_> {
        self.space.notified()
    }

    fn queue(&self, destination: &str) -> Arc<Mutex<PriorityQueue>> {
        if let Some(queue) = self.queues.get(destination) {
            return queue.value().clone();
        }
        self.queues
            .entry(destination.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(PriorityQueue::new(&self.weights, self.capacity))))
            .value()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::message::{Destination, Message, Pattern};
    use chrono::Utc;

    fn delivery(id: &str, priority: u8) -> Delivery {
        let message = Message {
            id: id.to_string(),
            sender: "sender".into(),
            destination: Destination::Agent("dest".into()),
            pattern: Pattern::FireAndForget,
            priority: Priority::new(priority).unwrap(),
            idempotency_key: None,
            correlation_id: None,
            payload: Vec::new(),
            created_at: Utc::now(),
            ttl_ms: 60_000,
            protocol_version: "2.0".into(),
            confirm_delivery: false,
        };
        Delivery::new(message, "dest".into())
    }

    fn drain(queue: &mut PriorityQueue) -> Vec<String> {
        std::iter::from_fn(|| queue.pop())
            .map(|d| d.message.id)
            .collect()
    }

    #[test]
    fn fifo_within_a_level() {
        let mut queue = PriorityQueue::new(&[8, 4, 2, 1], 100);
        for i in 0..5 {
            queue.push(delivery(&format!("m{i}"), 1)).unwrap();
        }
        assert_eq!(drain(&mut queue), vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[test]
    fn strict_priority_under_light_load() {
        let mut queue = PriorityQueue::new(&[8, 4, 2, 1], 100);
        queue.push(delivery("low", 3)).unwrap();
        queue.push(delivery("mid", 2)).unwrap();
        queue.push(delivery("high", 0)).unwrap();
        assert_eq!(drain(&mut queue), vec!["high", "mid", "low"]);
    }

    #[test]
    fn low_priority_is_served_within_bounded_wait() {
        let mut queue = PriorityQueue::new(&[8, 4, 2, 1], 1_000);
        queue.push(delivery("starving", 3)).unwrap();

        let bound = queue.max_wait(Priority::LOWEST) as usize;
        let mut served_before = 0;
        loop {
            // keep the high-priority level saturated
            queue.push(delivery("flood", 0)).unwrap();
            let next = queue.pop().unwrap();
            if next.message.id == "starving" {
                break;
            }
            served_before += 1;
            assert!(served_before <= bound, "priority 3 starved past {bound}");
        }
        assert_eq!(served_before, 8);
    }

    #[test]
    fn weighted_shares_under_sustained_load() {
        let mut queue = PriorityQueue::new(&[8, 4, 2, 1], 10_000);
        for i in 0..200 {
            for p in 0..4u8 {
                queue.push(delivery(&format!("p{p}-{i}"), p)).unwrap();
            }
        }
        let first_round: Vec<String> = (0..15).map(|_| queue.pop().unwrap().message.id).collect();
        let count = |p: &str| first_round.iter().filter(|id| id.starts_with(p)).count();
        assert_eq!((count("p0"), count("p1"), count("p2"), count("p3")), (8, 4, 2, 1));
    }

    #[test]
    fn capacity_is_enforced_but_requeue_is_not_dropped() {
        let mut queue = PriorityQueue::new(&[8, 4, 2, 1], 2);
        queue.push(delivery("a", 1)).unwrap();
        queue.push(delivery("b", 1)).unwrap();
        let rejected = queue.push(delivery("c", 1)).unwrap_err();
        assert_eq!(rejected.message.id, "c");

        let head = queue.pop().unwrap();
        queue.push(delivery("c", 1)).unwrap();
        queue.push_front(head);
        assert_eq!(queue.len(), 3);
        assert_eq!(drain(&mut queue), vec!["a", "b", "c"]);
    }

    #[test]
    fn scheduler_keeps_destinations_apart() {
        let scheduler = Scheduler::new(vec![8, 4, 2, 1], 10);
        let mut for_b = delivery("b1", 2);
        for_b.recipient = "b".into();
        scheduler.enqueue(delivery("d1", 2)).unwrap();
        scheduler.enqueue(for_b).unwrap();

        assert_eq!(scheduler.ready_destinations(), vec!["b".to_string(), "dest".to_string()]);
        assert_eq!(scheduler.dequeue("b").unwrap().message.id, "b1");
        assert_eq!(scheduler.depth("b"), 0);
        assert_eq!(scheduler.depth("dest"), 1);
        assert!(scheduler.dequeue("nobody").is_none());
        assert!(!scheduler.has_queue("nobody"));
    }
}

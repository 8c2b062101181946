//! The `persistence` module defines the storage contract the broker relies
//! on and ships a `sled`-backed implementation of it.
//!
//! The store is the source of truth after a crash: every live delivery is
//! written before it is queued, every state change is written before the
//! in-memory state moves on, and `recover` rebuilds queues from it.

pub mod sled_store;

pub use sled_store::SledStore;

use crate::broker::correlator::PendingRequest;
use crate::broker::message::{DeadLetterEntry, Delivery, DeliveryAttempt, DeliveryState};
use crate::utils::StorageError;

/// Durable storage for deliveries, dead letters and pending requests.
///
/// Keys for deliveries are `"{message_id}/{recipient}"`
/// (see [`crate::broker::message::delivery_key`]).
pub trait MessageStore: Send + Sync + 'static {
    /// Monotonic sequence number used to restore queue order on recovery.
    fn next_sequence(&self) -> Result<u64, StorageError>;

    /// Persist a newly admitted delivery.
    fn append(&self, delivery: &Delivery) -> Result<(), StorageError>;

    /// Move a live delivery to `state`. Terminal states drop the record
    /// from the live set. Unknown keys are ignored.
    fn update_state(&self, key: &str, state: DeliveryState) -> Result<(), StorageError>;

    fn record_attempt(&self, key: &str, attempt: &DeliveryAttempt) -> Result<(), StorageError>;

    /// Live deliveries currently in `state`, in admission order.
    fn list_by_state(&self, state: DeliveryState) -> Result<Vec<Delivery>, StorageError>;

    /// Drop a live delivery that was never queued.
    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Store a dead letter and drop the matching live delivery.
    fn record_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), StorageError>;

    fn dead_letters(&self) -> Result<Vec<DeadLetterEntry>, StorageError>;

    /// Explicitly purge one dead letter. Returns whether it existed.
    fn purge_dead_letter(&self, key: &str) -> Result<bool, StorageError>;

    fn save_pending_request(&self, request: &PendingRequest) -> Result<(), StorageError>;

    fn remove_pending_request(&self, correlation_id: &str) -> Result<(), StorageError>;

    fn pending_requests(&self) -> Result<Vec<PendingRequest>, StorageError>;
}

#[cfg(test)]
mod tests;

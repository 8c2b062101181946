use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use sled::{Db, Tree};
use tracing::warn;

use crate::broker::correlator::PendingRequest;
use crate::broker::message::{DeadLetterEntry, Delivery, DeliveryAttempt, DeliveryState};
use crate::persistence::MessageStore;
use crate::utils::StorageError;

const DELIVERIES: &str = "deliveries";
const DEAD_LETTERS: &str = "dead_letters";
const PENDING_REQUESTS: &str = "pending_requests";

/// `MessageStore` backed by an embedded sled database. Records are JSON
/// encoded, one tree per record kind.
#[derive(Clone)]
pub struct SledStore {
    db: Db,
    deliveries: Tree,
    dead_letters: Tree,
    pending: Tree,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::from_db(sled::open(path)?)
    }

    /// In-memory database that is removed when dropped.
    pub fn temporary() -> Result<Self, StorageError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        Ok(Self {
            deliveries: db.open_tree(DELIVERIES)?,
            dead_letters: db.open_tree(DEAD_LETTERS)?,
            pending: db.open_tree(PENDING_REQUESTS)?,
            db,
        })
    }

    /// Block until every write so far is on disk.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    fn load_delivery(&self, key: &str) -> Result<Option<Delivery>, StorageError> {
        self.deliveries
            .get(key)?
            .map(|bytes| serde_json::from_slice(&bytes))
            .transpose()
            .map_err(StorageError::from)
    }
}

fn put<T: Serialize>(tree: &Tree, key: &str, value: &T) -> Result<(), StorageError> {
    tree.insert(key, serde_json::to_vec(value)?)?;
    Ok(())
}

/// Decode every value in a tree, skipping (and logging) corrupt records so
/// one bad entry cannot block recovery.
fn scan<T: DeserializeOwned>(tree: &Tree) -> Result<Vec<T>, StorageError> {
    let mut out = Vec::new();
    for item in tree.iter() {
        let (key, value) = item?;
        match serde_json::from_slice(&value) {
            Ok(record) => out.push(record),
            Err(e) => warn!(key = %String::from_utf8_lossy(&key), error = %e, "skipping unreadable record"),
        }
    }
    Ok(out)
}

impl MessageStore for SledStore {
    fn next_sequence(&self) -> Result<u64, StorageError> {
        Ok(self.db.generate_id()?)
    }

    fn append(&self, delivery: &Delivery) -> Result<(), StorageError> {
        put(&self.deliveries, &delivery.key(), delivery)
    }

    fn update_state(&self, key: &str, state: DeliveryState) -> Result<(), StorageError> {
        if state.is_terminal() {
            self.deliveries.remove(key)?;
            return Ok(());
        }
        let Some(mut delivery) = self.load_delivery(key)? else {
            return Ok(());
        };
        delivery.state = state;
        put(&self.deliveries, key, &delivery)
    }

    fn record_attempt(&self, key: &str, attempt: &DeliveryAttempt) -> Result<(), StorageError> {
        let mut delivery = self
            .load_delivery(key)?
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        delivery.attempts.push(attempt.clone());
        put(&self.deliveries, key, &delivery)
    }

    fn list_by_state(&self, state: DeliveryState) -> Result<Vec<Delivery>, StorageError> {
        let mut deliveries: Vec<Delivery> = scan(&self.deliveries)?
            .into_iter()
            .filter(|d: &Delivery| d.state == state)
            .collect();
        deliveries.sort_by_key(|d| d.seq);
        Ok(deliveries)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.deliveries.remove(key)?;
        Ok(())
    }

    fn record_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), StorageError> {
        let key = entry.key();
        put(&self.dead_letters, &key, entry)?;
        self.deliveries.remove(key.as_str())?;
        Ok(())
    }

    fn dead_letters(&self) -> Result<Vec<DeadLetterEntry>, StorageError> {
        let mut entries: Vec<DeadLetterEntry> = scan(&self.dead_letters)?;
        entries.sort_by_key(|e| e.dead_lettered_at);
        Ok(entries)
    }

    fn purge_dead_letter(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.dead_letters.remove(key)?.is_some())
    }

    fn save_pending_request(&self, request: &PendingRequest) -> Result<(), StorageError> {
        put(&self.pending, &request.correlation_id, request)
    }

    fn remove_pending_request(&self, correlation_id: &str) -> Result<(), StorageError> {
        self.pending.remove(correlation_id)?;
        Ok(())
    }

    fn pending_requests(&self) -> Result<Vec<PendingRequest>, StorageError> {
        scan(&self.pending)
    }
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore")
            .field("db", &"sled::Db")
            .field("deliveries", &self.deliveries.len())
            .finish()
    }
}

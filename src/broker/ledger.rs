//! Idempotency ledger
//!
//! Remembers `(sender, idempotency key)` pairs for a retention window so a
//! resubmission of the same logical message collapses onto the original.
//! The check and the record happen under one shard lock (`DashMap::entry`),
//! so among concurrent admissions of the same pair exactly one observes
//! `New`.
//!
//! Retention bounds memory; it is not a correctness guarantee. Once an entry
//! ages out the same key is admitted again.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use crate::broker::message::{AgentId, MessageId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    New,
    /// Carries the id the first submission was admitted under.
    Duplicate(MessageId),
}

#[derive(Debug, Clone)]
struct LedgerEntry {
    message_id: MessageId,
    recorded_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct IdempotencyLedger {
    entries: DashMap<(AgentId, String), LedgerEntry>,
    retention: chrono::Duration,
}

impl IdempotencyLedger {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            retention: chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX),
        }
    }

    /// Record the pair unless a live entry already exists. Messages without
    /// a key are always new.
    pub fn check_and_record(
        &self,
        sender: &str,
        key: Option<&str>,
        message_id: &str,
        now: DateTime<Utc>,
    ) -> Admission {
        let Some(key) = key else {
            return Admission::New;
        };

        let fresh = LedgerEntry {
            message_id: message_id.to_string(),
            recorded_at: now,
        };
        match self.entries.entry((sender.to_string(), key.to_string())) {
            Entry::Occupied(mut occupied) => {
                if self.is_live(occupied.get(), now) {
                    Admission::Duplicate(occupied.get().message_id.clone())
                } else {
                    debug!(sender, key, "idempotency entry expired, admitting again");
                    occupied.insert(fresh);
                    Admission::New
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                Admission::New
            }
        }
    }

    /// Release a pair recorded for `message_id`, used when admission failed
    /// after the check so the caller's retry is not reported as a duplicate.
    pub fn forget(&self, sender: &str, key: &str, message_id: &str) {
        self.entries
            .remove_if(&(sender.to_string(), key.to_string()), |_, entry| {
                entry.message_id == message_id
            });
    }

    /// Evict entries older than the retention window. Returns how many were
    /// removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| self.is_live(entry, now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_live(&self, entry: &LedgerEntry, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(entry.recorded_at) < self.retention
    }
}

use chrono::Utc;
use tempfile::tempdir;

use crate::broker::correlator::PendingRequest;
use crate::broker::message::{
    AttemptOutcome, DeadLetterEntry, DeadLetterReason, Delivery, DeliveryAttempt, DeliveryState,
    Destination, Message, Pattern, Priority,
};
use crate::persistence::{MessageStore, SledStore};

fn message(id: &str) -> Message {
    Message {
        id: id.to_string(),
        sender: "producer".into(),
        destination: Destination::Agent("consumer".into()),
        pattern: Pattern::FireAndForget,
        priority: Priority::default(),
        idempotency_key: None,
        correlation_id: None,
        payload: b"payload".to_vec(),
        created_at: Utc::now(),
        ttl_ms: 60_000,
        protocol_version: "2.0".into(),
        confirm_delivery: false,
    }
}

fn delivery(store: &SledStore, id: &str) -> Delivery {
    Delivery::new(message(id), "consumer".into()).with_seq(store.next_sequence().unwrap())
}

fn attempt(n: u32, outcome: AttemptOutcome) -> DeliveryAttempt {
    DeliveryAttempt {
        message_id: "m1".into(),
        recipient: "consumer".into(),
        session_id: None,
        at: Utc::now(),
        outcome,
        attempt: n,
    }
}

#[test]
fn test_append_and_list_in_admission_order() {
    let store = SledStore::temporary().unwrap();
    for id in ["m3", "m1", "m2"] {
        store.append(&delivery(&store, id)).unwrap();
    }

    let ids: Vec<String> = store
        .list_by_state(DeliveryState::Queued)
        .unwrap()
        .into_iter()
        .map(|d| d.message.id)
        .collect();
    assert_eq!(ids, vec!["m3", "m1", "m2"]);
}

#[test]
fn test_state_changes_and_terminal_states_leave_live_set() {
    let store = SledStore::temporary().unwrap();
    let d = delivery(&store, "m1");
    store.append(&d).unwrap();

    store.update_state(&d.key(), DeliveryState::Attempting).unwrap();
    assert!(store.list_by_state(DeliveryState::Queued).unwrap().is_empty());
    assert_eq!(store.list_by_state(DeliveryState::Attempting).unwrap().len(), 1);

    store.update_state(&d.key(), DeliveryState::Delivered).unwrap();
    assert!(store.list_by_state(DeliveryState::Attempting).unwrap().is_empty());

    // unknown keys are ignored
    store.update_state("missing/key", DeliveryState::Retrying).unwrap();
}

#[test]
fn test_attempt_history_is_appended() {
    let store = SledStore::temporary().unwrap();
    let d = delivery(&store, "m1");
    store.append(&d).unwrap();
    store
        .record_attempt(&d.key(), &attempt(1, AttemptOutcome::Failure("offline".into())))
        .unwrap();
    store.record_attempt(&d.key(), &attempt(2, AttemptOutcome::Timeout)).unwrap();

    let stored = store.list_by_state(DeliveryState::Queued).unwrap();
    assert_eq!(stored[0].attempt_count(), 2);
    assert_eq!(stored[0].attempts[1].outcome, AttemptOutcome::Timeout);

    assert!(store.record_attempt("missing/key", &attempt(1, AttemptOutcome::Success)).is_err());
}

#[test]
fn test_dead_letters_replace_live_records_until_purged() {
    let store = SledStore::temporary().unwrap();
    let d = delivery(&store, "m1");
    store.append(&d).unwrap();

    let entry = DeadLetterEntry {
        message: d.message.clone(),
        recipient: d.recipient.clone(),
        attempts: vec![attempt(1, AttemptOutcome::Timeout)],
        reason: DeadLetterReason::MaxAttemptsExceeded,
        dead_lettered_at: Utc::now(),
    };
    store.record_dead_letter(&entry).unwrap();

    assert!(store.list_by_state(DeliveryState::Queued).unwrap().is_empty());
    let letters = store.dead_letters().unwrap();
    assert_eq!(letters, vec![entry.clone()]);

    assert!(store.purge_dead_letter(&entry.key()).unwrap());
    assert!(!store.purge_dead_letter(&entry.key()).unwrap());
    assert!(store.dead_letters().unwrap().is_empty());
}

#[test]
fn test_pending_requests_round_trip() {
    let store = SledStore::temporary().unwrap();
    let request = PendingRequest {
        correlation_id: "c1".into(),
        request_id: "m1".into(),
        requester: "alice".into(),
        recipient: "bob".into(),
        deadline: Utc::now(),
    };
    store.save_pending_request(&request).unwrap();
    assert_eq!(store.pending_requests().unwrap(), vec![request]);

    store.remove_pending_request("c1").unwrap();
    assert!(store.pending_requests().unwrap().is_empty());
}

#[test]
fn test_records_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("agentbus_db");

    let key = {
        let store = SledStore::open(&path).unwrap();
        let d = delivery(&store, "m1");
        store.append(&d).unwrap();
        store.update_state(&d.key(), DeliveryState::Attempting).unwrap();
        store.flush().unwrap();
        d.key()
    };

    let store = SledStore::open(&path).unwrap();
    let recovered = store.list_by_state(DeliveryState::Attempting).unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].key(), key);
    assert!(store.next_sequence().unwrap() > recovered[0].seq);
}

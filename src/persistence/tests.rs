use serde_json::json;
use tempfile::tempdir;

use crate::bus::message::{Message, Priority, Protocol};
use crate::persistence::{PersistenceStore, StoredMessage};

fn ack_message(channel: &str, priority: Priority) -> Message {
    Message::new(channel, json!({"channel": channel}), Protocol::Tcp, priority)
        .requiring_ack(true)
}

#[test]
fn test_store_and_load_message() {
    let dir = tempdir().unwrap();
    let store = PersistenceStore::open(dir.path()).unwrap();
    let msg = ack_message("alerts", Priority::High);

    store.store(&msg).unwrap();
    let loaded = store.load_pending().unwrap();

    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].id(), msg.id());
    assert_eq!(loaded[0].channel, "alerts");
    assert_eq!(loaded[0].payload, json!({"channel": "alerts"}));
    assert_eq!(loaded[0].protocol(), Protocol::Tcp);
    assert_eq!(loaded[0].priority(), Priority::High);
    assert!(loaded[0].requires_ack);
}

#[test]
fn test_remove_is_idempotent() {
    let dir = tempdir().unwrap();
    let store = PersistenceStore::open(dir.path()).unwrap();
    let msg = ack_message("alerts", Priority::Normal);
    store.store(&msg).unwrap();

    assert!(store.remove(msg.id()).unwrap());
    assert!(!store.remove(msg.id()).unwrap());
    assert!(!store.remove("never-stored").unwrap());
    assert!(store.is_empty());
}

#[test]
fn test_load_orders_by_priority_then_publish_order() {
    let dir = tempdir().unwrap();
    let store = PersistenceStore::open(dir.path()).unwrap();
    let low = ack_message("a", Priority::Low);
    let normal_1 = ack_message("b", Priority::Normal);
    let critical = ack_message("c", Priority::Critical);
    let normal_2 = ack_message("d", Priority::Normal);
    for m in [&low, &normal_1, &critical, &normal_2] {
        store.store(m).unwrap();
    }

    let ids: Vec<_> = store
        .load_pending()
        .unwrap()
        .into_iter()
        .map(|m| m.id().to_string())
        .collect();
    assert_eq!(
        ids,
        vec![
            critical.id().to_string(),
            normal_1.id().to_string(),
            normal_2.id().to_string(),
            low.id().to_string(),
        ]
    );
}

#[test]
fn test_records_survive_reopen() {
    let dir = tempdir().unwrap();
    let msg = ack_message("mount", Priority::Normal);
    {
        let store = PersistenceStore::open(dir.path()).unwrap();
        store.store(&msg).unwrap();
    }

    let store = PersistenceStore::open(dir.path()).unwrap();
    assert!(store.contains(msg.id()).unwrap());
    assert_eq!(store.load_pending().unwrap().len(), 1);
}

#[test]
fn test_non_ack_records_are_not_replayed() {
    let dir = tempdir().unwrap();
    let store = PersistenceStore::open(dir.path()).unwrap();
    let fire_and_forget = Message::new("status", json!(1), Protocol::Http, Priority::Low);
    store.store(&fire_and_forget).unwrap();

    assert_eq!(store.len(), 1);
    assert!(store.load_pending().unwrap().is_empty());
}

#[test]
fn test_serialization_roundtrip() {
    let record = StoredMessage {
        id: "id-1".into(),
        channel: "roundtrip".into(),
        data: json!({"key": 42}),
        protocol: 3,
        priority: 2,
        requires_ack: true,
        max_retries: 5,
        timeout_ms: 250,
        timestamp: 1725000000,
        sequence: 7,
    };

    let data = serde_json::to_vec(&record).unwrap();
    let parsed: StoredMessage = serde_json::from_slice(&data).unwrap();
    assert_eq!(record, parsed);
}

//! End-to-end delivery scenarios against the in-memory backend.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use missive_client::{
    EngineConfig, EngineEvent, InMemoryBackend, Persistence, RetryPolicy, SyncCoordinator,
};
use missive_shared::constants::{REASON_QUEUE_EVICTED, REASON_RETRIES_EXHAUSTED};
use missive_shared::{
    ConnectionState, Message, MessageSnapshot, MessageStatus, ReadReceiptState, SendError, UserId,
};
use tokio::sync::broadcast;

fn config() -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy::new(Duration::from_millis(5), Duration::from_millis(20)),
        attempt_timeout: Duration::from_millis(500),
        ..EngineConfig::default()
    }
}

fn engine(backend: &InMemoryBackend) -> SyncCoordinator {
    SyncCoordinator::new(
        config(),
        Arc::new(backend.clone()),
        Persistence::in_memory().unwrap(),
    )
    .unwrap()
}

async fn wait_for(mut done: impl FnMut() -> bool) {
    for _ in 0..400 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 2s");
}

fn drain_events(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn fourth_offline_message_evicts_the_first() {
    let backend = InMemoryBackend::new();
    let engine = engine(&backend);

    let ids: Vec<_> = ["m1", "m2", "m3", "m4"]
        .into_iter()
        .map(|text| engine.send_message("c1".into(), "alice".into(), text).unwrap())
        .collect();

    let queued: Vec<String> = engine
        .queued()
        .into_iter()
        .map(|e| e.message.text)
        .collect();
    assert_eq!(queued, ["m2", "m3", "m4"]);

    let m1 = engine.message(&ids[0]).unwrap();
    assert_eq!(m1.status, MessageStatus::Failed);
    assert_eq!(m1.failure_reason.as_deref(), Some(REASON_QUEUE_EVICTED));

    // Still visible to the user, not silently dropped.
    assert_eq!(engine.conversation(&"c1".into()).len(), 4);
}

#[tokio::test]
async fn online_send_is_sending_then_sent_and_never_duplicated() {
    let backend = InMemoryBackend::new();
    backend.set_latency(Duration::from_millis(50)).await;
    let engine = engine(&backend);
    engine.set_connection_state(ConnectionState::Online).unwrap();
    engine.watch_conversation("c1".into()).await.unwrap();
    let mut events = engine.subscribe_events();

    let id = engine.send_message("c1".into(), "alice".into(), "hi").unwrap();
    assert_eq!(engine.message(&id).unwrap().status, MessageStatus::Sending);

    wait_for(|| engine.message(&id).is_some_and(|m| m.status == MessageStatus::Sent)).await;
    // Let the subscription snapshot and the acknowledgement both land.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let visible = engine.conversation(&"c1".into());
    assert_eq!(visible.len(), 1);
    assert!(!visible[0].is_optimistic);
    assert!(visible[0].server_timestamp.is_some());

    let first = drain_events(&mut events)
        .into_iter()
        .find_map(|e| match e {
            EngineEvent::MessageUpserted(m) => Some(m.status),
            _ => None,
        });
    assert_eq!(first, Some(MessageStatus::Sending));
}

#[tokio::test]
async fn reconnect_syncs_three_messages_in_order() {
    let backend = InMemoryBackend::new();
    let engine = engine(&backend);
    let mut events = engine.subscribe_events();

    engine.set_connection_state(ConnectionState::Offline).unwrap();
    for text in ["A", "B", "C"] {
        engine.send_message("c1".into(), "alice".into(), text).unwrap();
    }

    engine.set_connection_state(ConnectionState::Online).unwrap();
    assert_eq!(engine.connection_state(), ConnectionState::Syncing(3));
    wait_for(|| engine.connection_state() == ConnectionState::Online).await;

    let states: Vec<ConnectionState> = drain_events(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            EngineEvent::ConnectionChanged(s) => Some(s),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        [
            ConnectionState::Syncing(3),
            ConnectionState::Syncing(2),
            ConnectionState::Syncing(1),
            ConnectionState::Online,
        ]
    );

    assert_eq!(backend.sent_texts().await, ["A", "B", "C"]);
    assert!(engine.queued().is_empty());

    let stats = engine.statistics();
    assert_eq!(stats.queued, 0);
    assert!(!stats.is_syncing);
    assert_eq!(stats.progress, 1.0);

    let statuses: Vec<MessageStatus> = engine
        .conversation(&"c1".into())
        .into_iter()
        .map(|m| m.status)
        .collect();
    assert_eq!(statuses, [MessageStatus::Sent; 3]);
}

#[tokio::test]
async fn fourth_failure_marks_failed_without_a_fifth_attempt() {
    let backend = InMemoryBackend::new();
    for _ in 0..4 {
        backend
            .fail_next(SendError::TransientServer("503".into()))
            .await;
    }
    let engine = engine(&backend);

    let id = engine.send_message("c1".into(), "alice".into(), "doomed").unwrap();
    engine.set_connection_state(ConnectionState::Online).unwrap();

    wait_for(|| engine.message(&id).unwrap().status == MessageStatus::Failed).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(backend.attempts().await, 4);
    assert!(engine.queued().is_empty());
    assert_eq!(engine.connection_state(), ConnectionState::Online);

    let failed = engine.message(&id).unwrap();
    assert_eq!(failed.failure_reason.as_deref(), Some(REASON_RETRIES_EXHAUSTED));
}

#[tokio::test]
async fn permanent_rejection_fails_immediately() {
    let backend = InMemoryBackend::new();
    backend.reject_conversation("ghost".into()).await;
    let engine = engine(&backend);

    let id = engine
        .send_message("ghost".into(), "alice".into(), "anyone?")
        .unwrap();
    engine.set_connection_state(ConnectionState::Online).unwrap();

    wait_for(|| engine.message(&id).unwrap().status == MessageStatus::Failed).await;
    assert_eq!(backend.attempts().await, 1);

    let failed = engine.message(&id).unwrap();
    assert_eq!(failed.retry_count, 0);
    assert!(failed
        .failure_reason
        .unwrap_or_default()
        .contains("unknown conversation"));
}

#[tokio::test]
async fn queued_messages_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        database_path: Some(dir.path().join("missive.db")),
        ..config()
    };
    let backend = InMemoryBackend::new();

    {
        let engine = SyncCoordinator::open(config.clone(), Arc::new(backend.clone())).unwrap();
        for text in ["A", "B", "C"] {
            engine.send_message("c1".into(), "alice".into(), text).unwrap();
        }
        engine.shutdown();
    }

    let engine = SyncCoordinator::open(config, Arc::new(backend.clone())).unwrap();
    let queued: Vec<String> = engine
        .queued()
        .into_iter()
        .map(|e| e.message.text)
        .collect();
    assert_eq!(queued, ["A", "B", "C"]);
    assert!(engine
        .conversation(&"c1".into())
        .iter()
        .all(|m| m.status == MessageStatus::Queued));

    engine.set_connection_state(ConnectionState::Online).unwrap();
    wait_for(|| engine.connection_state() == ConnectionState::Online).await;
    assert_eq!(backend.sent_texts().await, ["A", "B", "C"]);
}

#[tokio::test]
async fn read_receipts_aggregate_over_other_members() {
    let backend = InMemoryBackend::new();
    let engine = engine(&backend);
    engine.set_connection_state(ConnectionState::Online).unwrap();

    let id = engine.send_message("c1".into(), "alice".into(), "lunch?").unwrap();
    wait_for(|| engine.message(&id).is_some_and(|m| m.status == MessageStatus::Sent)).await;

    let members: BTreeSet<UserId> = ["alice", "bob", "carol"]
        .into_iter()
        .map(UserId::from)
        .collect();
    assert_eq!(
        engine.read_receipt(&id, &members),
        Some(ReadReceiptState::SentOnly { total: 2 })
    );

    engine.mark_read(&id, &"bob".into()).await.unwrap();
    assert_eq!(
        engine.read_receipt(&id, &members),
        Some(ReadReceiptState::PartiallyRead { read: 1, total: 2 })
    );

    engine.mark_read(&id, &"carol".into()).await.unwrap();
    assert_eq!(
        engine.read_receipt(&id, &members),
        Some(ReadReceiptState::AllRead { total: 2 })
    );
}

#[tokio::test]
async fn message_from_another_device_is_inserted() {
    let backend = InMemoryBackend::new();
    let engine = engine(&backend);
    engine.set_connection_state(ConnectionState::Online).unwrap();
    engine.watch_conversation("c1".into()).await.unwrap();

    let composed = Message::optimistic("c1".into(), "bob".into(), "from my phone", Utc::now());
    let remote = backend.deliver_remote(composed).await;

    wait_for(|| engine.message(&remote.id).is_some()).await;
    let shown = engine.message(&remote.id).unwrap();
    assert_eq!(shown.status, MessageStatus::Sent);
    assert_eq!(shown.sender_id, UserId::from("bob"));
    assert!(!shown.is_optimistic);
    assert_eq!(engine.conversation(&"c1".into()).len(), 1);
    assert_eq!(backend.attempts().await, 0);
}

#[tokio::test]
async fn late_snapshot_never_downgrades_status() {
    let backend = InMemoryBackend::new();
    let engine = engine(&backend);
    engine.set_connection_state(ConnectionState::Online).unwrap();
    engine.watch_conversation("c1".into()).await.unwrap();

    let id = engine.send_message("c1".into(), "alice".into(), "lunch?").unwrap();
    wait_for(|| engine.message(&id).is_some_and(|m| m.status == MessageStatus::Sent)).await;

    let server_id = engine.message(&id).unwrap().id;
    let read = backend
        .update_status(&server_id, MessageStatus::Read)
        .await
        .unwrap();
    wait_for(|| engine.message(&id).is_some_and(|m| m.status == MessageStatus::Read)).await;

    // A Delivered snapshot overtaken by the Read one, carrying bob's receipt.
    let mut late = read;
    late.status = MessageStatus::Delivered;
    late.read_by.insert("bob".into());
    backend.replay(MessageSnapshot::modified(late)).await;

    let bob = UserId::from("bob");
    wait_for(|| engine.message(&id).is_some_and(|m| m.read_by.contains(&bob))).await;
    let shown = engine.message(&id).unwrap();
    assert_eq!(shown.status, MessageStatus::Read);
    assert_eq!(engine.conversation(&"c1".into()).len(), 1);
}

#[tokio::test]
async fn read_receipt_ahead_of_acknowledgement_confirms_queued_message() {
    let backend = InMemoryBackend::new();
    let engine = engine(&backend);
    engine.watch_conversation("c1".into()).await.unwrap();

    let id = engine.send_message("c1".into(), "alice".into(), "hi").unwrap();
    assert_eq!(engine.message(&id).unwrap().status, MessageStatus::Queued);

    // The server stored it from an earlier attempt and bob already read it.
    let mut seen = engine.message(&id).unwrap();
    seen.id = "srv-early".into();
    seen.server_timestamp = Some(Utc::now());
    seen.status = MessageStatus::Read;
    seen.is_optimistic = false;
    seen.read_by.insert("bob".into());
    backend.replay(MessageSnapshot::modified(seen)).await;

    wait_for(|| engine.message(&id).is_some_and(|m| m.status == MessageStatus::Read)).await;
    assert!(engine.queued().is_empty());

    engine.set_connection_state(ConnectionState::Online).unwrap();
    wait_for(|| engine.connection_state() == ConnectionState::Online).await;
    assert_eq!(backend.attempts().await, 0);

    let members: BTreeSet<UserId> = ["alice", "bob"].into_iter().map(UserId::from).collect();
    assert_eq!(
        engine.read_receipt(&id, &members),
        Some(ReadReceiptState::AllRead { total: 1 })
    );
    assert_eq!(engine.conversation(&"c1".into()).len(), 1);
}

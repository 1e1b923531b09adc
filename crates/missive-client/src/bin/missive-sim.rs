//! # missive-sim
//!
//! Drives the delivery engine against the in-memory backend through an
//! offline compose / reconnect cycle and prints what the UI would show.
//!
//! Set `MISSIVE_DB_PATH` to keep state between runs; otherwise everything
//! lives in memory.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use missive_client::{
    init_tracing, EngineConfig, EngineEvent, InMemoryBackend, Persistence, SyncCoordinator,
};
use missive_shared::constants::APP_NAME;
use missive_shared::{ConnectionState, ConversationId, UserId};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Tracing and configuration
    // -----------------------------------------------------------------------
    init_tracing();
    info!("Starting {} simulator v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    let config = EngineConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 2. Engine
    // -----------------------------------------------------------------------
    let backend = InMemoryBackend::new();
    backend.set_latency(Duration::from_millis(50)).await;

    let engine = if config.database_path.is_some() {
        SyncCoordinator::open(config, Arc::new(backend.clone()))?
    } else {
        SyncCoordinator::new(config, Arc::new(backend.clone()), Persistence::in_memory()?)?
    };

    let mut events = engine.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(event = event.name(), "UI event");
            if let EngineEvent::SyncProgress(stats) = event {
                info!(queued = stats.queued, progress = stats.progress, "Sync progress");
            }
        }
    });

    let room = ConversationId::from("general");
    let me = UserId::from("alice");
    engine.watch_conversation(room.clone()).await?;

    // -----------------------------------------------------------------------
    // 3. Offline compose: the fourth message evicts the first
    // -----------------------------------------------------------------------
    engine.set_connection_state(ConnectionState::Offline)?;
    for text in ["m1", "m2", "m3", "m4"] {
        engine.send_message(room.clone(), me.clone(), text)?;
    }
    info!(queued = engine.statistics().queued, "Composed while offline");

    // -----------------------------------------------------------------------
    // 4. Reconnect and drain
    // -----------------------------------------------------------------------
    engine.set_connection_state(ConnectionState::Connecting)?;
    engine.set_connection_state(ConnectionState::Online)?;
    while engine.connection_state() != ConnectionState::Online {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let live = engine.send_message(room.clone(), me.clone(), "back online")?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // -----------------------------------------------------------------------
    // 5. Read receipts
    // -----------------------------------------------------------------------
    let members: BTreeSet<UserId> = ["alice", "bob", "carol"]
        .into_iter()
        .map(UserId::from)
        .collect();
    engine.mark_read(&live, &UserId::from("bob")).await?;
    tokio::time::sleep(Duration::from_millis(20)).await;

    for msg in engine.conversation(&room) {
        let receipt = engine.read_receipt(&msg.id, &members);
        println!(
            "{:<12} {:<10} {:<40} {:?}",
            msg.text,
            msg.status,
            msg.failure_reason.as_deref().unwrap_or(""),
            receipt
        );
    }

    println!("backend order: {:?}", backend.sent_texts().await);

    engine.shutdown();
    Ok(())
}

//! # missive-client
//!
//! Offline-first delivery engine: optimistic ledger, bounded offline queue,
//! retry policy and the sync coordinator tying them to a backend.

pub mod backend;
pub mod backoff;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod ledger;
pub mod memory;
pub mod persist;
pub mod queue;

pub use backend::Backend;
pub use backoff::RetryPolicy;
pub use config::EngineConfig;
pub use coordinator::SyncCoordinator;
pub use error::{EngineError, Result};
pub use events::{EngineEvent, EventBus, SyncStatistics};
pub use ledger::{OptimisticLedger, ReconcileKey, ReconcileOutcome};
pub use memory::InMemoryBackend;
pub use persist::Persistence;
pub use queue::{DrainReport, EntryOutcome, OfflineQueue, QueueResult};

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the
/// default filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("missive_client=debug,missive_store=info,warn"));

    let installed = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();

    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

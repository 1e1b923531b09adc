//! Sync coordinator.
//!
//! Owns the ledger and the offline queue, routes every send according to
//! the current [`ConnectionState`], and drains the queue in a background
//! task whenever connectivity comes back.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use futures::stream::{Stream, StreamExt};
use missive_shared::constants::REASON_INTERRUPTED;
use missive_shared::{
    ConnectionState, ConversationId, Message, MessageId, MessageSnapshot, MessageStatus,
    QueueEntry, ReadReceiptState, SendError, SnapshotKind, UserId,
};
use missive_store::Database;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus, SyncStatistics};
use crate::ledger::{OptimisticLedger, ReconcileKey, ReconcileOutcome};
use crate::persist::Persistence;
use crate::queue::{EntryOutcome, OfflineQueue};

#[derive(Default)]
struct SyncState {
    connection: ConnectionState,
    /// Bumped whenever a drain starts or is abandoned; stale drain tasks
    /// compare against it before touching the connection state.
    generation: u64,
    /// Entries finished (sent or failed) during the current drain.
    completed: usize,
    drain: Option<JoinHandle<()>>,
    /// Direct sends still waiting for the backend, in the order issued.
    direct: Vec<(MessageId, JoinHandle<()>)>,
    /// Completion signal of the latest direct send per conversation.
    lanes: HashMap<ConversationId, oneshot::Receiver<()>>,
}

enum Route {
    Direct,
    Queue,
}

struct Inner {
    config: EngineConfig,
    backend: Arc<dyn Backend>,
    ledger: OptimisticLedger,
    queue: OfflineQueue,
    events: EventBus,
    sync: Mutex<SyncState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Resets the ledger entry to `Queued` if an attempt is dropped before the
/// backend answered.
struct RequeueOnDrop<'a> {
    ledger: &'a OptimisticLedger,
    id: &'a MessageId,
    armed: bool,
}

impl Drop for RequeueOnDrop<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let in_flight = self
            .ledger
            .get(self.id)
            .is_some_and(|m| m.status == MessageStatus::Sending);
        if in_flight {
            match self.ledger.set_status(self.id, MessageStatus::Queued) {
                Ok(_) => debug!(msg_id = %self.id, "Cancelled attempt returned to queue"),
                Err(e) => warn!(msg_id = %self.id, error = %e, "Could not requeue cancelled attempt"),
            }
        }
    }
}

/// Entry point of the delivery engine.
///
/// Cheap to clone. Operations that spawn background work must be called
/// from within a Tokio runtime.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl SyncCoordinator {
    /// Open the database named by `config` (or the platform default) and
    /// restore the engine from it.
    pub fn open(config: EngineConfig, backend: Arc<dyn Backend>) -> Result<Self> {
        let db = match &config.database_path {
            Some(path) => Database::open_at(path)?,
            None => Database::new()?,
        };
        Self::new(config, backend, Persistence::new(db))
    }

    /// Restore ledger and queue from `store` and reconcile the two.
    ///
    /// Fails if persisted rows are unreadable.
    pub fn new(config: EngineConfig, backend: Arc<dyn Backend>, store: Persistence) -> Result<Self> {
        let events = EventBus::new(config.event_buffer);
        let ledger = OptimisticLedger::restore(store.clone(), events.clone())?;
        let (queue, overflow) =
            OfflineQueue::restore(config.queue_capacity, config.max_retries, store)?;

        let coordinator = Self {
            inner: Arc::new(Inner {
                config,
                backend,
                ledger,
                queue,
                events,
                sync: Mutex::new(SyncState::default()),
                tasks: Mutex::new(Vec::new()),
            }),
        };
        coordinator.settle_restored(overflow)?;

        info!(
            messages = coordinator.inner.ledger.len(),
            queued = coordinator.inner.queue.len(),
            "Sync coordinator ready"
        );
        Ok(coordinator)
    }

    /// Make ledger and queue agree after a restart.
    fn settle_restored(&self, overflow: Vec<Message>) -> Result<()> {
        let ledger = &self.inner.ledger;
        let queue = &self.inner.queue;

        for message in overflow {
            if ledger.get(&message.id).is_some() {
                self.surface_failure(message)?;
            } else {
                ledger.track(message)?;
            }
        }

        // The queue is authoritative for anything it still holds.
        for entry in queue.entries() {
            match ledger.get(entry.id()) {
                Some(m) if m.is_confirmed() => {
                    queue.remove(entry.id())?;
                }
                Some(m) if m.status == MessageStatus::Queued => {}
                _ => ledger.track(entry.message)?,
            }
        }

        for message in ledger.unconfirmed() {
            if message.status == MessageStatus::Queued && !queue.contains(&message.id) {
                ledger.mark_failed(&message.id, REASON_INTERRUPTED)?;
            }
        }
        Ok(())
    }

    fn lock_sync(&self) -> Result<MutexGuard<'_, SyncState>> {
        self.inner
            .sync
            .lock()
            .map_err(|_| EngineError::LockPoisoned("sync state"))
    }

    fn track_task(&self, handle: JoinHandle<()>) -> Result<()> {
        let mut tasks = self
            .inner
            .tasks
            .lock()
            .map_err(|_| EngineError::LockPoisoned("tasks"))?;
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Compose a message. It is visible as `Sending` (or `Queued`) when this
    /// returns; delivery happens in the background.
    pub fn send_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        text: impl Into<String>,
    ) -> Result<MessageId> {
        let mut sync = self.lock_sync()?;
        let id = self
            .inner
            .ledger
            .submit(conversation_id.clone(), sender_id, text, Utc::now())?;

        match self.route(&sync, &conversation_id) {
            Route::Direct => self.spawn_direct(&mut sync, id.clone(), conversation_id),
            Route::Queue => self.enqueue(&mut sync, &id)?,
        }
        Ok(id)
    }

    /// Resend a `Failed` message through the normal send path.
    pub fn retry(&self, id: &MessageId) -> Result<()> {
        let mut sync = self.lock_sync()?;
        let message = self.inner.ledger.retry(id)?;
        info!(msg_id = %message.id, "Retrying message");

        match self.route(&sync, &message.conversation_id) {
            Route::Direct => self.spawn_direct(&mut sync, message.id, message.conversation_id),
            Route::Queue => self.enqueue(&mut sync, &message.id)?,
        }
        Ok(())
    }

    /// Drop an unconfirmed message from the ledger and the queue.
    pub fn discard(&self, id: &MessageId) -> Result<Message> {
        let removed = self.inner.ledger.discard(id)?;
        if self.inner.queue.remove(&removed.id)?.is_some() {
            self.refresh_progress()?;
        }
        Ok(removed)
    }

    fn route(&self, sync: &SyncState, conversation_id: &ConversationId) -> Route {
        match sync.connection {
            ConnectionState::Offline | ConnectionState::Connecting => Route::Queue,
            // Never overtake entries still waiting in this conversation.
            ConnectionState::Online | ConnectionState::Syncing(_)
                if self.inner.queue.has_conversation(conversation_id) =>
            {
                Route::Queue
            }
            ConnectionState::Online | ConnectionState::Syncing(_) => Route::Direct,
        }
    }

    fn enqueue(&self, sync: &mut SyncState, id: &MessageId) -> Result<()> {
        self.queue_message(id)?;
        self.resume(sync);
        Ok(())
    }

    /// Move a `Sending` message into the offline queue, failing whatever the
    /// queue evicts to make room.
    fn queue_message(&self, id: &MessageId) -> Result<()> {
        let message = self.inner.ledger.set_status(id, MessageStatus::Queued)?;
        let result = self.inner.queue.enqueue(message)?;

        if let Some(evicted) = result.evicted {
            let evicted_id = evicted.id.clone();
            self.surface_failure(evicted)?;
            self.inner
                .events
                .emit(EngineEvent::QueueEviction { evicted: evicted_id });
        }
        Ok(())
    }

    /// Get the queue moving again if the connection allows it.
    fn resume(&self, sync: &mut SyncState) {
        match sync.connection {
            ConnectionState::Online => self.start_drain(sync),
            ConnectionState::Syncing(_) => {
                self.transition(sync, ConnectionState::Syncing(self.inner.queue.len()));
                self.publish_progress(sync);
            }
            _ => self.publish_progress(sync),
        }
    }

    /// Send `id` right away, after any earlier direct send of the same
    /// conversation has finished.
    fn spawn_direct(&self, sync: &mut SyncState, id: MessageId, conversation_id: ConversationId) {
        let (done, finished) = oneshot::channel::<()>();
        let previous = sync.lanes.insert(conversation_id, finished);

        let this = self.clone();
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            let _done = done;
            if let Some(previous) = previous {
                // Resolves once the earlier task ends, however it ends.
                let _ = previous.await;
            }
            if let Err(e) = this.deliver_direct(&task_id).await {
                warn!(msg_id = %task_id, error = %e, "Direct send bookkeeping failed");
            }
        });

        sync.direct.retain(|(_, h)| !h.is_finished());
        sync.direct.push((id, handle));
    }

    async fn deliver_direct(&self, id: &MessageId) -> Result<()> {
        let message = {
            let mut sync = self.lock_sync()?;
            if !sync.direct.iter().any(|(d, _)| d == id) {
                return Ok(());
            }
            let Some(message) = self.inner.ledger.get(id) else {
                sync.direct.retain(|(d, _)| d != id);
                return Ok(());
            };
            if self.inner.queue.has_conversation(&message.conversation_id) {
                // An earlier send of this conversation fell back to the queue.
                sync.direct.retain(|(d, _)| d != id);
                self.enqueue(&mut sync, id)?;
                return Ok(());
            }
            message
        };

        let result = self.send_bounded(message).await;

        let mut sync = self.lock_sync()?;
        let before = sync.direct.len();
        sync.direct.retain(|(d, _)| d != id);
        let requeued = sync.direct.len() == before;

        match result {
            Ok(confirmed) => {
                self.inner
                    .ledger
                    .reconcile(ReconcileKey::Provisional(id.clone()), confirmed)?;
                if requeued && self.inner.queue.remove(id)?.is_some() {
                    debug!(msg_id = %id, "Requeued direct send was acknowledged after all");
                    self.refresh_locked(&mut sync);
                }
            }
            Err(error) if requeued => {
                debug!(msg_id = %id, error = %error, "Direct send already back in the queue");
            }
            Err(error) if error.is_retryable() => {
                warn!(msg_id = %id, error = %error, "Direct send failed, queueing for retry");
                self.queue_message(id)?;
                if let Some(outcome) = self.inner.queue.record_failure(id, error)? {
                    self.apply_outcome(&outcome);
                }
                self.resume(&mut sync);
            }
            Err(error) => {
                warn!(msg_id = %id, error = %error, "Direct send rejected");
                self.inner.ledger.mark_failed(id, &error.to_string())?;
            }
        }
        Ok(())
    }

    /// Abort unanswered direct sends and put their messages in the queue.
    fn requeue_direct(&self, sync: &mut SyncState) -> Result<()> {
        let in_flight = std::mem::take(&mut sync.direct);
        sync.lanes.clear();
        if in_flight.is_empty() {
            return Ok(());
        }

        for (id, handle) in in_flight {
            handle.abort();
            let sending = self
                .inner
                .ledger
                .get(&id)
                .is_some_and(|m| m.status == MessageStatus::Sending);
            if sending {
                self.queue_message(&id)?;
                debug!(msg_id = %id, "Unanswered direct send returned to queue");
            }
        }
        self.publish_progress(sync);
        Ok(())
    }

    async fn send_bounded(&self, message: Message) -> std::result::Result<Message, SendError> {
        let limit = self.inner.config.attempt_timeout;
        match tokio::time::timeout(limit, self.inner.backend.send(message)).await {
            Ok(result) => result,
            Err(_) => Err(SendError::Timeout(limit)),
        }
    }

    /// Mark a message `Failed` in the ledger using its own failure reason.
    fn surface_failure(&self, message: Message) -> Result<()> {
        let reason = message
            .failure_reason
            .clone()
            .unwrap_or_else(|| MessageStatus::Failed.to_string());
        match self.inner.ledger.mark_failed(&message.id, &reason) {
            Ok(_) => Ok(()),
            Err(EngineError::UnknownMessage(id)) => {
                debug!(msg_id = %id, "Failed message no longer in ledger");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // Connectivity
    // ------------------------------------------------------------------

    /// Apply a connectivity change reported by the network observer.
    ///
    /// Going `Online` from `Offline` or `Connecting` starts a drain. Going
    /// `Offline` or `Connecting` aborts it and returns unanswered direct
    /// sends to the queue. `Syncing` is only ever entered by the coordinator
    /// itself.
    pub fn set_connection_state(&self, next: ConnectionState) -> Result<()> {
        let mut sync = self.lock_sync()?;
        match next {
            ConnectionState::Online => match sync.connection {
                ConnectionState::Offline | ConnectionState::Connecting => {
                    self.start_drain(&mut sync)
                }
                ConnectionState::Online | ConnectionState::Syncing(_) => {}
            },
            ConnectionState::Offline | ConnectionState::Connecting => {
                self.stop_drain(&mut sync);
                self.transition(&mut sync, next);
                self.requeue_direct(&mut sync)?;
            }
            ConnectionState::Syncing(_) => {
                warn!(state = %next, "Ignoring externally reported syncing state");
            }
        }
        Ok(())
    }

    /// Forward every state from `states` to
    /// [`set_connection_state`](Self::set_connection_state).
    pub fn observe_network<S>(&self, states: S) -> Result<()>
    where
        S: Stream<Item = ConnectionState> + Send + 'static,
    {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut states = Box::pin(states);
            while let Some(state) = states.next().await {
                if let Err(e) = this.set_connection_state(state) {
                    error!(error = %e, "Failed to apply connection state");
                }
            }
            debug!("Network observer finished");
        });
        self.track_task(handle)
    }

    fn transition(&self, sync: &mut SyncState, next: ConnectionState) {
        if sync.connection == next {
            return;
        }
        info!(from = %sync.connection, to = %next, "Connection state changed");
        sync.connection = next;
        self.inner.events.emit(EngineEvent::ConnectionChanged(next));
    }

    fn start_drain(&self, sync: &mut SyncState) {
        self.stop_drain(sync);
        sync.completed = 0;

        let depth = self.inner.queue.len();
        if depth == 0 {
            self.transition(sync, ConnectionState::Online);
            self.publish_progress(sync);
            return;
        }

        self.transition(sync, ConnectionState::Syncing(depth));
        self.publish_progress(sync);
        info!(depth, "Draining offline queue");

        let this = self.clone();
        let generation = sync.generation;
        sync.drain = Some(tokio::spawn(async move {
            this.run_drain(generation).await;
        }));
    }

    fn stop_drain(&self, sync: &mut SyncState) {
        sync.generation += 1;
        if let Some(handle) = sync.drain.take() {
            handle.abort();
            info!("Drain aborted");
        }
    }

    async fn run_drain(self, generation: u64) {
        let this = &self;
        let mut pass = 0u32;
        loop {
            let delay = this
                .inner
                .config
                .retry
                .delay_for(this.inner.queue.max_retry_count());
            if !delay.is_zero() {
                debug!(pass, delay_ms = delay.as_millis() as u64, "Backing off before next drain pass");
                tokio::time::sleep(delay).await;
            }
            pass += 1;

            let result = this
                .inner
                .queue
                .drain(
                    move |entry| this.attempt(entry),
                    move |outcome| this.on_outcome(generation, outcome),
                )
                .await;

            let force = match result {
                Ok(report) => {
                    debug!(
                        pass,
                        attempted = report.attempted(),
                        sent = report.sent.len(),
                        retrying = report.retrying.len(),
                        failed = report.failed.len(),
                        deferred = report.deferred,
                        "Drain pass finished"
                    );
                    false
                }
                Err(e) => {
                    error!(error = %e, "Drain pass failed, giving up until next reconnect");
                    true
                }
            };

            match this.finish_drain(generation, force) {
                Ok(true) => break,
                Ok(false) => continue,
                Err(e) => {
                    error!(error = %e, "Could not finish drain");
                    break;
                }
            }
        }
    }

    async fn attempt(&self, entry: QueueEntry) -> std::result::Result<Message, SendError> {
        let id = entry.id().clone();
        if let Err(e) = self.inner.ledger.set_status(&id, MessageStatus::Sending) {
            debug!(msg_id = %id, error = %e, "Ledger not updated before attempt");
        }

        let mut guard = RequeueOnDrop {
            ledger: &self.inner.ledger,
            id: &id,
            armed: true,
        };
        let result = self.send_bounded(entry.message).await;
        guard.armed = false;
        result
    }

    fn on_outcome(&self, generation: u64, outcome: &EntryOutcome) {
        self.apply_outcome(outcome);

        if !outcome.is_final() {
            return;
        }
        let Ok(mut sync) = self.lock_sync() else {
            return;
        };
        if sync.generation != generation {
            return;
        }
        sync.completed += 1;
        let remaining = self.inner.queue.len();
        if remaining > 0 {
            self.transition(&mut sync, ConnectionState::Syncing(remaining));
        }
        self.publish_progress(&sync);
    }

    /// Mirror a queue outcome into the ledger.
    fn apply_outcome(&self, outcome: &EntryOutcome) {
        let ledger = &self.inner.ledger;
        let applied = match outcome {
            EntryOutcome::Sent { entry, confirmed } => ledger
                .reconcile(ReconcileKey::Provisional(entry.id().clone()), confirmed.clone())
                .map(|_| ()),
            EntryOutcome::Retrying { entry, error } => {
                debug!(msg_id = %entry.id(), retry_count = entry.retry_count(), error = %error, "Queued send will be retried");
                ledger.note_retry(entry.id(), entry.retry_count()).map(|_| ())
            }
            EntryOutcome::Failed { message, .. } => self.surface_failure(message.clone()),
        };
        if let Err(e) = applied {
            warn!(msg_id = %outcome.id(), error = %e, "Could not apply queue outcome");
        }
    }

    /// `Ok(true)` once the drain task should stop.
    fn finish_drain(&self, generation: u64, force: bool) -> Result<bool> {
        let mut sync = self.lock_sync()?;
        if sync.generation != generation {
            return Ok(true);
        }
        if !force && !self.inner.queue.is_empty() {
            return Ok(false);
        }
        sync.drain = None;
        self.transition(&mut sync, ConnectionState::Online);
        self.publish_progress(&sync);
        info!(completed = sync.completed, "Offline queue drained");
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Subscriptions and receipts
    // ------------------------------------------------------------------

    /// Follow a conversation's backend snapshots and fold them into the
    /// ledger until shutdown.
    pub async fn watch_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        let mut stream = self.inner.backend.subscribe(&conversation_id).await?;
        info!(conversation = %conversation_id, "Watching conversation");

        let this = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(snapshot) = stream.next().await {
                if let Err(e) = this.apply_snapshot(snapshot) {
                    warn!(conversation = %conversation_id, error = %e, "Failed to apply snapshot");
                }
            }
            debug!(conversation = %conversation_id, "Subscription closed");
        });
        self.track_task(handle)
    }

    fn apply_snapshot(&self, snapshot: MessageSnapshot) -> Result<()> {
        let MessageSnapshot { kind, message } = snapshot;
        match kind {
            SnapshotKind::Added | SnapshotKind::Modified => {
                let outcome = self.inner.ledger.reconcile_confirmed(message)?;
                if let ReconcileOutcome::Replaced { provisional } = outcome {
                    if self.inner.queue.remove(&provisional)?.is_some() {
                        debug!(msg_id = %provisional, "Queued entry confirmed by subscription");
                        self.refresh_progress()?;
                    }
                }
            }
            SnapshotKind::Removed => {
                self.inner.ledger.remove_confirmed(&message.id)?;
            }
        }
        Ok(())
    }

    /// Report `user_id` as a reader of `message_id` and merge it locally.
    pub async fn mark_read(&self, message_id: &MessageId, user_id: &UserId) -> Result<Message> {
        let canonical = self
            .inner
            .ledger
            .get(message_id)
            .map(|m| m.id)
            .ok_or_else(|| EngineError::UnknownMessage(message_id.clone()))?;
        self.inner.backend.mark_read(&canonical, user_id).await?;
        self.inner.ledger.apply_read_receipt(&canonical, user_id)
    }

    /// Read-receipt aggregate for a message, computed from current state.
    pub fn read_receipt(
        &self,
        message_id: &MessageId,
        members: &BTreeSet<UserId>,
    ) -> Option<ReadReceiptState> {
        self.inner
            .ledger
            .get(message_id)
            .map(|m| m.receipt_state(members))
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    pub fn statistics(&self) -> SyncStatistics {
        match self.inner.sync.lock() {
            Ok(sync) => self.stats(&sync),
            Err(_) => SyncStatistics {
                queued: self.inner.queue.len(),
                is_syncing: false,
                progress: 0.0,
            },
        }
    }

    fn stats(&self, sync: &SyncState) -> SyncStatistics {
        let queued = self.inner.queue.len();
        let is_syncing = sync.connection.is_syncing();
        let progress = if is_syncing {
            let total = sync.completed + queued;
            if total == 0 {
                1.0
            } else {
                sync.completed as f64 / total as f64
            }
        } else if queued == 0 {
            1.0
        } else {
            0.0
        };
        SyncStatistics {
            queued,
            is_syncing,
            progress,
        }
    }

    fn publish_progress(&self, sync: &SyncState) {
        self.inner
            .events
            .emit(EngineEvent::SyncProgress(self.stats(sync)));
    }

    fn refresh_progress(&self) -> Result<()> {
        let mut sync = self.lock_sync()?;
        self.refresh_locked(&mut sync);
        Ok(())
    }

    fn refresh_locked(&self, sync: &mut SyncState) {
        if sync.connection.is_syncing() {
            let remaining = self.inner.queue.len();
            if remaining > 0 {
                self.transition(sync, ConnectionState::Syncing(remaining));
            }
        }
        self.publish_progress(sync);
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner
            .sync
            .lock()
            .map(|s| s.connection)
            .unwrap_or_default()
    }

    /// Messages of one conversation in display order.
    pub fn conversation(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.inner.ledger.conversation(conversation_id)
    }

    pub fn message(&self, id: &MessageId) -> Option<Message> {
        self.inner.ledger.get(id)
    }

    /// Offline queue contents in FIFO order.
    pub fn queued(&self) -> Vec<QueueEntry> {
        self.inner.queue.entries()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Abort the drain and every background task. Unanswered direct sends
    /// are left in the queue for the next start.
    pub fn shutdown(&self) {
        if let Ok(mut sync) = self.inner.sync.lock() {
            self.stop_drain(&mut sync);
            if let Err(e) = self.requeue_direct(&mut sync) {
                warn!(error = %e, "Could not requeue direct sends on shutdown");
            }
        }
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        info!("Sync coordinator shut down");
    }
}

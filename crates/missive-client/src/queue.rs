//! Bounded offline queue.
//!
//! Holds messages composed while disconnected, in FIFO order, up to a fixed
//! capacity. When full, the oldest entry is evicted unconditionally and
//! handed back as `Failed`. Retry bookkeeping lives on the entries; the
//! delay between attempts is the caller's business.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use futures::future::join_all;
use missive_shared::constants::{REASON_QUEUE_EVICTED, REASON_RETRIES_EXHAUSTED};
use missive_shared::{ConversationId, Message, MessageId, MessageStatus, QueueEntry, SendError};
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::persist::Persistence;

/// Result of [`OfflineQueue::enqueue`].
#[derive(Debug, Clone)]
pub struct QueueResult {
    pub entry: QueueEntry,
    /// The entry pushed out to make room, already marked `Failed`.
    pub evicted: Option<Message>,
}

impl QueueResult {
    pub fn eviction_occurred(&self) -> bool {
        self.evicted.is_some()
    }
}

/// What happened to one entry during a drain.
#[derive(Debug, Clone)]
pub enum EntryOutcome {
    /// Acknowledged and removed from the queue.
    Sent { entry: QueueEntry, confirmed: Message },
    /// Failed but still has retry budget; stays queued.
    Retrying { entry: QueueEntry, error: SendError },
    /// Removed from the queue as `Failed`: rejected or out of retries.
    Failed { message: Message, error: SendError },
}

impl EntryOutcome {
    pub fn id(&self) -> &MessageId {
        match self {
            Self::Sent { entry, .. } | Self::Retrying { entry, .. } => entry.id(),
            Self::Failed { message, .. } => &message.id,
        }
    }

    /// The entry left the queue.
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Retrying { .. })
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub sent: Vec<MessageId>,
    pub retrying: Vec<MessageId>,
    pub failed: Vec<MessageId>,
    /// Entries not attempted because an earlier one in the same
    /// conversation is waiting for a retry.
    pub deferred: usize,
}

impl DrainReport {
    fn record(&mut self, outcome: &EntryOutcome) {
        let id = outcome.id().clone();
        match outcome {
            EntryOutcome::Sent { .. } => self.sent.push(id),
            EntryOutcome::Retrying { .. } => self.retrying.push(id),
            EntryOutcome::Failed { .. } => self.failed.push(id),
        }
    }

    fn absorb(&mut self, other: DrainReport) {
        self.sent.extend(other.sent);
        self.retrying.extend(other.retrying);
        self.failed.extend(other.failed);
        self.deferred += other.deferred;
    }

    pub fn attempted(&self) -> usize {
        self.sent.len() + self.retrying.len() + self.failed.len()
    }
}

#[derive(Default)]
struct QueueState {
    /// Kept sorted by [`QueueEntry::order_key`].
    entries: Vec<QueueEntry>,
    next_sequence: u64,
}

impl QueueState {
    fn position(&self, id: &MessageId) -> Option<usize> {
        self.entries.iter().position(|e| e.id() == id)
    }
}

pub struct OfflineQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    max_retries: u32,
    store: Persistence,
}

impl OfflineQueue {
    pub fn new(capacity: usize, max_retries: u32, store: Persistence) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            capacity: capacity.max(1),
            max_retries,
            store,
        }
    }

    /// Reload the queue from storage.
    ///
    /// Entries beyond `capacity` (oldest first) are evicted and returned as
    /// `Failed`, exactly as if they had been pushed out by `enqueue`.
    pub fn restore(
        capacity: usize,
        max_retries: u32,
        store: Persistence,
    ) -> Result<(Self, Vec<Message>)> {
        let mut entries = store.with(|db| db.load_queue_entries())?;
        entries.sort_by_key(QueueEntry::order_key);
        let queue = Self::new(capacity, max_retries, store);

        let mut evicted = Vec::new();
        {
            let mut state = queue.lock()?;
            state.next_sequence = entries.iter().map(|e| e.sequence + 1).max().unwrap_or(0);
            while entries.len() > queue.capacity {
                let entry = entries.remove(0);
                queue.store.with(|db| db.delete_queue_entry(entry.id()))?;
                evicted.push(evict(entry.message));
            }
            state.entries = entries;
            info!(
                restored = state.entries.len(),
                evicted = evicted.len(),
                "Offline queue restored"
            );
        }
        Ok((queue, evicted))
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|_| EngineError::LockPoisoned("offline queue"))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append `message` as `Queued`, evicting the oldest entry when full.
    ///
    /// Re-enqueueing a message that is already queued updates it in place.
    pub fn enqueue(&self, mut message: Message) -> Result<QueueResult> {
        message.status = MessageStatus::Queued;
        message.is_offline_origin = true;
        message.failure_reason = None;

        let mut state = self.lock()?;

        if let Some(pos) = state.position(&message.id) {
            state.entries[pos].message = message;
            let entry = state.entries[pos].clone();
            self.store.with(|db| db.upsert_queue_entry(&entry))?;
            return Ok(QueueResult {
                entry,
                evicted: None,
            });
        }

        let mut evicted = None;
        if state.entries.len() >= self.capacity {
            // Sorted, so the oldest is at the front.
            let oldest = state.entries.remove(0);
            self.store.with(|db| db.delete_queue_entry(oldest.id()))?;
            warn!(
                evicted = %oldest.id(),
                capacity = self.capacity,
                "Offline queue full, evicting oldest entry"
            );
            evicted = Some(evict(oldest.message));
        }

        let entry = QueueEntry {
            message,
            queued_at: Utc::now(),
            last_attempt_at: None,
            sequence: state.next_sequence,
        };
        state.next_sequence += 1;
        self.store.with(|db| db.upsert_queue_entry(&entry))?;

        let at = state
            .entries
            .partition_point(|e| e.order_key() <= entry.order_key());
        state.entries.insert(at, entry.clone());

        debug!(msg_id = %entry.id(), depth = state.entries.len(), "Message queued");
        Ok(QueueResult { entry, evicted })
    }

    /// Whether automatic retries have budget left for `entry`.
    pub fn can_retry(&self, entry: &QueueEntry) -> bool {
        entry.retry_count() < self.max_retries
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// Snapshot in FIFO order.
    pub fn entries(&self) -> Vec<QueueEntry> {
        self.state
            .lock()
            .map(|s| s.entries.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.state
            .lock()
            .map(|s| s.position(id).is_some())
            .unwrap_or(false)
    }

    pub fn has_conversation(&self, conversation_id: &ConversationId) -> bool {
        self.state
            .lock()
            .map(|s| {
                s.entries
                    .iter()
                    .any(|e| &e.message.conversation_id == conversation_id)
            })
            .unwrap_or(false)
    }

    /// Highest retry count among queued entries, the backoff input.
    pub fn max_retry_count(&self) -> u32 {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.entries.iter().map(QueueEntry::retry_count).max())
            .unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Remove an entry without sending it.
    pub fn remove(&self, id: &MessageId) -> Result<Option<QueueEntry>> {
        let mut state = self.lock()?;
        let Some(pos) = state.position(id) else {
            return Ok(None);
        };
        let entry = state.entries.remove(pos);
        self.store.with(|db| db.delete_queue_entry(id))?;
        Ok(Some(entry))
    }

    /// Count a failed attempt against `id`.
    ///
    /// Non-retryable errors and exhausted budgets remove the entry and return
    /// [`EntryOutcome::Failed`]. `None` if the entry is gone already.
    pub fn record_failure(&self, id: &MessageId, error: SendError) -> Result<Option<EntryOutcome>> {
        let mut state = self.lock()?;
        let Some(pos) = state.position(id) else {
            return Ok(None);
        };

        if !error.is_retryable() {
            let entry = state.entries.remove(pos);
            self.store.with(|db| db.delete_queue_entry(id))?;
            let message = fail(entry.message, error.to_string());
            return Ok(Some(EntryOutcome::Failed { message, error }));
        }

        let entry = &mut state.entries[pos];
        entry.message.retry_count += 1;
        entry.last_attempt_at = Some(Utc::now());

        if entry.message.retry_count > self.max_retries {
            let entry = state.entries.remove(pos);
            self.store.with(|db| db.delete_queue_entry(id))?;
            warn!(
                msg_id = %id,
                attempts = entry.message.retry_count,
                "Retry budget exhausted"
            );
            let message = fail(entry.message, REASON_RETRIES_EXHAUSTED.to_string());
            return Ok(Some(EntryOutcome::Failed { message, error }));
        }

        let entry = entry.clone();
        self.store.with(|db| db.upsert_queue_entry(&entry))?;
        debug!(msg_id = %id, retry_count = entry.retry_count(), error = %error, "Send failed, will retry");
        Ok(Some(EntryOutcome::Retrying { entry, error }))
    }

    // ------------------------------------------------------------------
    // Drain
    // ------------------------------------------------------------------

    /// Attempt every queued entry once, oldest first.
    ///
    /// Entries of one conversation go strictly one after another; different
    /// conversations run concurrently. A retryable failure ends its
    /// conversation's pass so nothing overtakes it. `observer` sees every
    /// outcome as soon as the queue has recorded it.
    ///
    /// No queue state changes while `sender` is pending, so dropping this
    /// future leaves the in-flight entry queued.
    pub async fn drain<S, Fut, O>(&self, sender: S, observer: O) -> Result<DrainReport>
    where
        S: Fn(QueueEntry) -> Fut,
        Fut: Future<Output = std::result::Result<Message, SendError>>,
        O: Fn(&EntryOutcome),
    {
        let chains = self.chains()?;
        let results = join_all(
            chains
                .into_iter()
                .map(|chain| self.drain_chain(chain, &sender, &observer)),
        )
        .await;

        let mut report = DrainReport::default();
        for result in results {
            report.absorb(result?);
        }
        Ok(report)
    }

    /// Entries grouped per conversation, each group in FIFO order.
    fn chains(&self) -> Result<Vec<Vec<QueueEntry>>> {
        let state = self.lock()?;
        let mut chains: Vec<Vec<QueueEntry>> = Vec::new();
        for entry in &state.entries {
            match chains
                .iter_mut()
                .find(|c| c[0].message.conversation_id == entry.message.conversation_id)
            {
                Some(chain) => chain.push(entry.clone()),
                None => chains.push(vec![entry.clone()]),
            }
        }
        Ok(chains)
    }

    async fn drain_chain<S, Fut, O>(
        &self,
        chain: Vec<QueueEntry>,
        sender: &S,
        observer: &O,
    ) -> Result<DrainReport>
    where
        S: Fn(QueueEntry) -> Fut,
        Fut: Future<Output = std::result::Result<Message, SendError>>,
        O: Fn(&EntryOutcome),
    {
        let mut report = DrainReport::default();
        let mut pending = chain.into_iter();

        while let Some(entry) = pending.next() {
            let id = entry.id().clone();
            if !self.contains(&id) {
                continue;
            }

            let outcome = match sender(entry.clone()).await {
                Ok(confirmed) => {
                    let entry = self.remove(&id)?.unwrap_or(entry);
                    EntryOutcome::Sent { entry, confirmed }
                }
                Err(error) => match self.record_failure(&id, error)? {
                    Some(outcome) => outcome,
                    None => continue,
                },
            };

            observer(&outcome);
            report.record(&outcome);

            if !outcome.is_final() {
                report.deferred += pending.len();
                break;
            }
        }

        Ok(report)
    }
}

fn fail(mut message: Message, reason: String) -> Message {
    message.status = MessageStatus::Failed;
    message.failure_reason = Some(reason);
    message
}

fn evict(message: Message) -> Message {
    fail(message, REASON_QUEUE_EVICTED.to_string())
}

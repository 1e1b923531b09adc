//! Optimistic ledger: every message the UI can see, keyed by ID.
//!
//! Locally composed messages enter with a provisional ID and are replaced,
//! never duplicated, once the backend confirms them. An alias table keeps
//! provisional IDs resolvable after reconciliation so that late
//! acknowledgements and subscription snapshots land on the same record.
//!
//! Unconfirmed entries are written through to the `ledger_messages` table.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use missive_shared::constants::REASON_INTERRUPTED;
use missive_shared::{ConversationId, MatchKey, Message, MessageId, MessageStatus, UserId};
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::persist::Persistence;

/// How a confirmed record finds its optimistic counterpart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileKey {
    Provisional(MessageId),
    Match(MatchKey),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The optimistic entry was replaced by the confirmed record.
    Replaced { provisional: MessageId },
    /// The confirmed record was already present and has been updated.
    Merged,
    /// Nothing matched; the record was inserted as new.
    Inserted,
}

#[derive(Default)]
struct LedgerState {
    messages: HashMap<MessageId, Message>,
    /// provisional ID -> canonical ID, kept after reconciliation.
    aliases: HashMap<MessageId, MessageId>,
}

impl LedgerState {
    fn resolve(&self, id: &MessageId) -> Option<MessageId> {
        if self.messages.contains_key(id) {
            return Some(id.clone());
        }
        self.aliases
            .get(id)
            .filter(|canonical| self.messages.contains_key(*canonical))
            .cloned()
    }

    fn find_by_match(&self, key: &MatchKey) -> Option<MessageId> {
        self.messages
            .values()
            .filter(|m| m.is_optimistic)
            .find(|m| &m.match_key() == key)
            .map(|m| m.id.clone())
    }

    fn get_mut(&mut self, id: &MessageId) -> Result<&mut Message> {
        let canonical = self
            .resolve(id)
            .ok_or_else(|| EngineError::UnknownMessage(id.clone()))?;
        self.messages
            .get_mut(&canonical)
            .ok_or(EngineError::UnknownMessage(canonical))
    }
}

/// Fold a confirmed record into what the ledger already knows.
fn absorb(local: &Message, mut confirmed: Message) -> Message {
    confirmed.status = local
        .status
        .merge(confirmed.status)
        .merge(MessageStatus::Sent);
    confirmed.server_timestamp = confirmed.server_timestamp.or(local.server_timestamp);
    confirmed.read_by.extend(local.read_by.iter().cloned());
    confirmed.provisional_id = confirmed
        .provisional_id
        .or_else(|| local.provisional_id.clone());
    confirmed.retry_count = confirmed.retry_count.max(local.retry_count);
    confirmed.is_offline_origin |= local.is_offline_origin;
    confirmed.is_optimistic = false;
    confirmed.failure_reason = None;
    confirmed
}

pub struct OptimisticLedger {
    state: Mutex<LedgerState>,
    store: Persistence,
    events: EventBus,
}

impl OptimisticLedger {
    pub fn new(store: Persistence, events: EventBus) -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            store,
            events,
        }
    }

    /// Rebuild the ledger from storage.
    ///
    /// Entries that were `Sending` when the process stopped come back as
    /// `Failed` so the user decides whether to resend them.
    pub fn restore(store: Persistence, events: EventBus) -> Result<Self> {
        let persisted = store.with(|db| db.load_ledger_messages())?;
        let ledger = Self::new(store, events);
        {
            let mut state = ledger.lock()?;
            for mut msg in persisted {
                if msg.status == MessageStatus::Sending {
                    msg.status = MessageStatus::Failed;
                    msg.failure_reason = Some(REASON_INTERRUPTED.to_string());
                    ledger.store.with(|db| db.upsert_ledger_message(&msg))?;
                }
                if let Some(provisional) = &msg.provisional_id {
                    state.aliases.insert(provisional.clone(), msg.id.clone());
                }
                state.messages.insert(msg.id.clone(), msg);
            }
            info!(restored = state.messages.len(), "Ledger restored");
        }
        Ok(ledger)
    }

    fn lock(&self) -> Result<MutexGuard<'_, LedgerState>> {
        self.state
            .lock()
            .map_err(|_| EngineError::LockPoisoned("ledger"))
    }

    fn persist(&self, message: &Message) -> Result<()> {
        if message.is_optimistic {
            self.store.with(|db| db.upsert_ledger_message(message))
        } else {
            self.store.with(|db| db.delete_ledger_message(&message.id).map(|_| ()))
        }
    }

    // ------------------------------------------------------------------
    // Local sends
    // ------------------------------------------------------------------

    /// Record a freshly composed message and return its provisional ID.
    ///
    /// The message is visible to the UI as `Sending` before this returns.
    pub fn submit(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        text: impl Into<String>,
        client_timestamp: DateTime<Utc>,
    ) -> Result<MessageId> {
        let msg = Message::optimistic(conversation_id, sender_id, text, client_timestamp);
        let id = msg.id.clone();
        self.track(msg)?;
        debug!(msg_id = %id, "Optimistic message submitted");
        Ok(id)
    }

    /// Insert or overwrite a message as-is.
    pub fn track(&self, message: Message) -> Result<()> {
        let mut state = self.lock()?;
        self.persist(&message)?;
        if let Some(provisional) = &message.provisional_id {
            if provisional != &message.id {
                state.aliases.insert(provisional.clone(), message.id.clone());
            }
        }
        state.messages.insert(message.id.clone(), message.clone());
        self.events.emit(EngineEvent::MessageUpserted(message));
        Ok(())
    }

    /// Validated local status move (e.g. `Sending -> Queued`).
    pub fn set_status(&self, id: &MessageId, status: MessageStatus) -> Result<Message> {
        let mut state = self.lock()?;
        let msg = state.get_mut(id)?;
        let next = msg.status.transition(status)?;
        if next == msg.status {
            return Ok(msg.clone());
        }
        msg.status = next;
        match next {
            MessageStatus::Sending => msg.failure_reason = None,
            MessageStatus::Queued => msg.is_offline_origin = true,
            _ => {}
        }
        let updated = msg.clone();
        self.persist(&updated)?;
        self.events.emit(EngineEvent::MessageUpserted(updated.clone()));
        Ok(updated)
    }

    /// Move an unconfirmed message to `Failed` and surface `reason`.
    ///
    /// A message the backend already confirmed is left untouched and `None`
    /// is returned.
    pub fn mark_failed(&self, id: &MessageId, reason: &str) -> Result<Option<Message>> {
        let mut state = self.lock()?;
        let msg = state.get_mut(id)?;
        if msg.status.is_confirmed() {
            debug!(msg_id = %id, status = %msg.status, "Ignoring failure for confirmed message");
            return Ok(None);
        }
        msg.status = msg.status.transition(MessageStatus::Failed)?;
        msg.failure_reason = Some(reason.to_string());
        let updated = msg.clone();
        self.persist(&updated)?;
        warn!(msg_id = %updated.id, reason, "Message failed");
        self.events.emit(EngineEvent::MessageFailed {
            id: updated.id.clone(),
            reason: reason.to_string(),
        });
        self.events.emit(EngineEvent::MessageUpserted(updated.clone()));
        Ok(Some(updated))
    }

    /// Back to `Queued` after a failed attempt that still has retry budget.
    pub fn note_retry(&self, id: &MessageId, retry_count: u32) -> Result<Message> {
        let mut state = self.lock()?;
        let msg = state.get_mut(id)?;
        msg.status = msg.status.transition(MessageStatus::Queued)?;
        msg.retry_count = retry_count;
        msg.is_offline_origin = true;
        let updated = msg.clone();
        self.persist(&updated)?;
        self.events.emit(EngineEvent::MessageUpserted(updated.clone()));
        Ok(updated)
    }

    /// Put a `Failed` message back into `Sending` and return it for resend.
    ///
    /// A user-initiated retry starts with a fresh automatic retry budget.
    pub fn retry(&self, id: &MessageId) -> Result<Message> {
        let mut state = self.lock()?;
        let msg = state.get_mut(id)?;
        if msg.status != MessageStatus::Failed {
            return Err(EngineError::NotRetryable {
                id: msg.id.clone(),
                status: msg.status,
            });
        }
        msg.status = MessageStatus::Sending;
        msg.failure_reason = None;
        msg.retry_count = 0;
        let updated = msg.clone();
        self.persist(&updated)?;
        self.events.emit(EngineEvent::MessageUpserted(updated.clone()));
        Ok(updated)
    }

    /// Drop an unconfirmed message from the view.
    pub fn discard(&self, id: &MessageId) -> Result<Message> {
        let mut state = self.lock()?;
        let canonical = state
            .resolve(id)
            .ok_or_else(|| EngineError::UnknownMessage(id.clone()))?;
        if state.messages.get(&canonical).is_some_and(|m| m.is_confirmed()) {
            return Err(EngineError::AlreadyConfirmed(canonical));
        }
        let removed = state
            .messages
            .remove(&canonical)
            .ok_or_else(|| EngineError::UnknownMessage(canonical.clone()))?;
        self.store.with(|db| db.delete_ledger_message(&canonical))?;
        info!(msg_id = %canonical, "Message discarded");
        self.events
            .emit(EngineEvent::MessageRemoved { id: canonical });
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Backend updates
    // ------------------------------------------------------------------

    /// Fold a backend-confirmed record into the ledger.
    ///
    /// Lookup order: `key`, the echoed provisional ID, the confirmed ID, the
    /// content match key. Whatever is found is replaced, so one logical send
    /// is never live twice.
    pub fn reconcile(&self, key: ReconcileKey, confirmed: Message) -> Result<ReconcileOutcome> {
        let mut state = self.lock()?;

        let by_key = match &key {
            ReconcileKey::Provisional(id) => state.resolve(id),
            ReconcileKey::Match(k) => state.find_by_match(k),
        };
        let optimistic = by_key
            .or_else(|| {
                confirmed
                    .provisional_id
                    .as_ref()
                    .and_then(|p| state.resolve(p))
            })
            .filter(|id| id != &confirmed.id)
            .or_else(|| {
                if state.messages.contains_key(&confirmed.id) {
                    None
                } else {
                    state.find_by_match(&confirmed.match_key())
                }
            });

        let outcome = match optimistic {
            Some(provisional) => {
                let local = state
                    .messages
                    .remove(&provisional)
                    .ok_or_else(|| EngineError::UnknownMessage(provisional.clone()))?;
                let mut merged = absorb(&local, confirmed);
                if let Some(existing) = state.messages.get(&merged.id) {
                    merged = absorb(existing, merged);
                }
                self.store.with(|db| db.delete_ledger_message(&provisional))?;
                self.persist(&merged)?;

                state.aliases.insert(provisional.clone(), merged.id.clone());
                if let Some(p) = &merged.provisional_id {
                    state.aliases.insert(p.clone(), merged.id.clone());
                }
                state.messages.insert(merged.id.clone(), merged.clone());

                debug!(provisional = %provisional, msg_id = %merged.id, "Optimistic message reconciled");
                self.events.emit(EngineEvent::MessageReconciled {
                    provisional: provisional.clone(),
                    message: merged,
                });
                ReconcileOutcome::Replaced { provisional }
            }
            None => match state.messages.get(&confirmed.id) {
                Some(existing) => {
                    let merged = absorb(existing, confirmed);
                    self.persist(&merged)?;
                    state.messages.insert(merged.id.clone(), merged.clone());
                    self.events.emit(EngineEvent::MessageUpserted(merged));
                    ReconcileOutcome::Merged
                }
                None => {
                    let mut fresh = confirmed;
                    fresh.is_optimistic = false;
                    fresh.status = fresh.status.merge(MessageStatus::Sent);
                    warn!(
                        msg_id = %fresh.id,
                        conversation = %fresh.conversation_id,
                        "Reconciliation mismatch: no optimistic entry, inserting confirmed record"
                    );
                    if let Some(p) = &fresh.provisional_id {
                        state.aliases.insert(p.clone(), fresh.id.clone());
                    }
                    state.messages.insert(fresh.id.clone(), fresh.clone());
                    self.events.emit(EngineEvent::MessageUpserted(fresh));
                    ReconcileOutcome::Inserted
                }
            },
        };

        Ok(outcome)
    }

    /// [`reconcile`](Self::reconcile) keyed by the echoed provisional ID when
    /// present, else by content.
    pub fn reconcile_confirmed(&self, confirmed: Message) -> Result<ReconcileOutcome> {
        let key = match &confirmed.provisional_id {
            Some(p) => ReconcileKey::Provisional(p.clone()),
            None => ReconcileKey::Match(confirmed.match_key()),
        };
        self.reconcile(key, confirmed)
    }

    /// Max-rank merge of a status reported by the backend.
    pub fn apply_remote_status(&self, id: &MessageId, status: MessageStatus) -> Result<Message> {
        let mut state = self.lock()?;
        let msg = state.get_mut(id)?;
        let merged = msg.status.merge(status);
        if merged == msg.status {
            return Ok(msg.clone());
        }
        msg.status = merged;
        let updated = msg.clone();
        self.persist(&updated)?;
        self.events.emit(EngineEvent::MessageUpserted(updated.clone()));
        Ok(updated)
    }

    /// Add `reader` to `read_by`. Leaves the status alone.
    pub fn apply_read_receipt(&self, id: &MessageId, reader: &UserId) -> Result<Message> {
        let mut state = self.lock()?;
        let msg = state.get_mut(id)?;
        if !msg.read_by.insert(reader.clone()) {
            return Ok(msg.clone());
        }
        let updated = msg.clone();
        self.persist(&updated)?;
        self.events.emit(EngineEvent::MessageUpserted(updated.clone()));
        Ok(updated)
    }

    /// Remove a record the backend deleted.
    pub fn remove_confirmed(&self, id: &MessageId) -> Result<Option<Message>> {
        let mut state = self.lock()?;
        let Some(canonical) = state.resolve(id) else {
            return Ok(None);
        };
        let removed = state.messages.remove(&canonical);
        state.aliases.retain(|_, target| target != &canonical);
        self.store.with(|db| db.delete_ledger_message(&canonical))?;
        self.events
            .emit(EngineEvent::MessageRemoved { id: canonical });
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    pub fn get(&self, id: &MessageId) -> Option<Message> {
        let state = self.state.lock().ok()?;
        let canonical = state.resolve(id)?;
        state.messages.get(&canonical).cloned()
    }

    /// Messages of one conversation in display order.
    pub fn conversation(&self, conversation_id: &ConversationId) -> Vec<Message> {
        let Ok(state) = self.state.lock() else {
            return Vec::new();
        };
        let mut messages: Vec<Message> = state
            .messages
            .values()
            .filter(|m| &m.conversation_id == conversation_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| {
            a.display_timestamp()
                .cmp(&b.display_timestamp())
                .then(a.client_timestamp.cmp(&b.client_timestamp))
                .then(a.id.cmp(&b.id))
        });
        messages
    }

    /// Every entry not yet confirmed by the backend.
    pub fn unconfirmed(&self) -> Vec<Message> {
        self.state
            .lock()
            .map(|s| {
                s.messages
                    .values()
                    .filter(|m| m.is_optimistic)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.messages.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn ledger() -> OptimisticLedger {
        OptimisticLedger::new(Persistence::in_memory().unwrap(), EventBus::new(64))
    }

    fn confirm(local: &Message, server_id: &str) -> Message {
        let mut confirmed = local.clone();
        confirmed.id = server_id.into();
        confirmed.status = MessageStatus::Sent;
        confirmed.is_optimistic = false;
        confirmed.server_timestamp = Some(local.client_timestamp + Duration::milliseconds(50));
        confirmed
    }

    #[test]
    fn submit_is_visible_as_sending() {
        let ledger = ledger();
        let id = ledger
            .submit("c1".into(), "alice".into(), "hi", Utc::now())
            .unwrap();

        let msg = ledger.get(&id).unwrap();
        assert_eq!(msg.status, MessageStatus::Sending);
        assert!(msg.is_optimistic);
        assert_eq!(ledger.conversation(&"c1".into()).len(), 1);
    }

    #[test]
    fn reconcile_replaces_instead_of_inserting() {
        let ledger = ledger();
        let id = ledger
            .submit("c1".into(), "alice".into(), "hi", Utc::now())
            .unwrap();
        let confirmed = confirm(&ledger.get(&id).unwrap(), "srv-1");

        let outcome = ledger
            .reconcile(ReconcileKey::Provisional(id.clone()), confirmed)
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Replaced { provisional: id.clone() });

        let view = ledger.conversation(&"c1".into());
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].id, MessageId::from("srv-1"));
        assert!(!view[0].is_optimistic);
        assert!(view[0].server_timestamp.is_some());
        // The provisional ID still resolves.
        assert_eq!(ledger.get(&id).unwrap().id, MessageId::from("srv-1"));
    }

    #[test]
    fn ack_and_subscription_collapse_in_either_order() {
        let ledger = ledger();
        let id = ledger
            .submit("c1".into(), "alice".into(), "hi", Utc::now())
            .unwrap();
        let confirmed = confirm(&ledger.get(&id).unwrap(), "srv-1");

        // Subscription first, without the provisional echo.
        let mut from_subscription = confirmed.clone();
        from_subscription.provisional_id = None;
        assert_eq!(
            ledger.reconcile_confirmed(from_subscription).unwrap(),
            ReconcileOutcome::Replaced { provisional: id.clone() }
        );
        // Then the acknowledgement.
        assert_eq!(
            ledger
                .reconcile(ReconcileKey::Provisional(id), confirmed)
                .unwrap(),
            ReconcileOutcome::Merged
        );
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn reconcile_never_regresses_status() {
        let ledger = ledger();
        let id = ledger
            .submit("c1".into(), "alice".into(), "hi", Utc::now())
            .unwrap();
        let mut read = confirm(&ledger.get(&id).unwrap(), "srv-1");
        read.status = MessageStatus::Read;
        ledger.reconcile_confirmed(read.clone()).unwrap();

        let mut stale = read;
        stale.status = MessageStatus::Delivered;
        ledger.reconcile_confirmed(stale).unwrap();
        assert_eq!(
            ledger.get(&"srv-1".into()).unwrap().status,
            MessageStatus::Read
        );
    }

    #[test]
    fn unmatched_confirmed_record_is_inserted() {
        let ledger = ledger();
        let mut remote = Message::optimistic("c1".into(), "bob".into(), "yo", Utc::now());
        remote.provisional_id = None;
        remote.id = "srv-9".into();
        remote.status = MessageStatus::Sent;

        assert_eq!(
            ledger.reconcile_confirmed(remote).unwrap(),
            ReconcileOutcome::Inserted
        );
        assert!(!ledger.get(&"srv-9".into()).unwrap().is_optimistic);
    }

    #[test]
    fn failure_and_retry_cycle() {
        let ledger = ledger();
        let id = ledger
            .submit("c1".into(), "alice".into(), "hi", Utc::now())
            .unwrap();

        let failed = ledger.mark_failed(&id, "server said no").unwrap().unwrap();
        assert_eq!(failed.status, MessageStatus::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("server said no"));
        assert_eq!(failed.retry_count, 0);

        let retried = ledger.retry(&id).unwrap();
        assert_eq!(retried.status, MessageStatus::Sending);
        assert!(retried.failure_reason.is_none());

        assert!(matches!(
            ledger.retry(&id),
            Err(EngineError::NotRetryable { .. })
        ));
    }

    #[test]
    fn late_failure_does_not_touch_confirmed_message() {
        let ledger = ledger();
        let id = ledger
            .submit("c1".into(), "alice".into(), "hi", Utc::now())
            .unwrap();
        let confirmed = confirm(&ledger.get(&id).unwrap(), "srv-1");
        ledger.reconcile_confirmed(confirmed).unwrap();

        assert!(ledger.mark_failed(&id, "timeout").unwrap().is_none());
        assert_eq!(ledger.get(&id).unwrap().status, MessageStatus::Sent);
    }

    #[test]
    fn read_receipt_before_sent_keeps_status_monotonic() {
        let ledger = ledger();
        let id = ledger
            .submit("c1".into(), "alice".into(), "hi", Utc::now())
            .unwrap();
        ledger.apply_read_receipt(&id, &"bob".into()).unwrap();
        ledger
            .apply_remote_status(&id, MessageStatus::Delivered)
            .unwrap();
        ledger.apply_remote_status(&id, MessageStatus::Sent).unwrap();

        let msg = ledger.get(&id).unwrap();
        assert_eq!(msg.status, MessageStatus::Delivered);
        assert!(msg.read_by.contains(&UserId::from("bob")));
    }

    #[test]
    fn discard_refuses_confirmed_messages() {
        let ledger = ledger();
        let id = ledger
            .submit("c1".into(), "alice".into(), "hi", Utc::now())
            .unwrap();
        let confirmed = confirm(&ledger.get(&id).unwrap(), "srv-1");
        ledger.reconcile_confirmed(confirmed).unwrap();

        assert!(matches!(
            ledger.discard(&id),
            Err(EngineError::AlreadyConfirmed(_))
        ));

        let other = ledger
            .submit("c1".into(), "alice".into(), "again", Utc::now())
            .unwrap();
        ledger.discard(&other).unwrap();
        assert!(ledger.get(&other).is_none());
    }

    #[test]
    fn view_orders_by_server_then_client_time() {
        let ledger = ledger();
        let t0 = Utc::now();
        let late_local = ledger
            .submit("c1".into(), "alice".into(), "pending", t0 + Duration::seconds(5))
            .unwrap();
        let early = ledger
            .submit("c1".into(), "alice".into(), "first", t0)
            .unwrap();
        let confirmed = confirm(&ledger.get(&early).unwrap(), "srv-1");
        ledger.reconcile_confirmed(confirmed).unwrap();

        let texts: Vec<_> = ledger
            .conversation(&"c1".into())
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, ["first", "pending"]);
        assert!(ledger.get(&late_local).is_some());
    }

    #[test]
    fn restore_turns_in_flight_sends_into_failures() {
        let store = Persistence::in_memory().unwrap();
        let id = {
            let ledger = OptimisticLedger::new(store.clone(), EventBus::new(8));
            ledger
                .submit("c1".into(), "alice".into(), "hi", Utc::now())
                .unwrap()
        };

        let restored = OptimisticLedger::restore(store, EventBus::new(8)).unwrap();
        let msg = restored.get(&id).unwrap();
        assert_eq!(msg.status, MessageStatus::Failed);
        assert_eq!(msg.failure_reason.as_deref(), Some(REASON_INTERRUPTED));
    }

    #[test]
    fn confirmed_messages_are_not_persisted() {
        let store = Persistence::in_memory().unwrap();
        let ledger = OptimisticLedger::new(store.clone(), EventBus::new(8));
        let id = ledger
            .submit("c1".into(), "alice".into(), "hi", Utc::now())
            .unwrap();
        let confirmed = confirm(&ledger.get(&id).unwrap(), "srv-1");
        ledger.reconcile_confirmed(confirmed).unwrap();

        let rows = store.with(|db| db.load_ledger_messages()).unwrap();
        assert!(rows.is_empty());
    }
}

//! In-process [`Backend`] used by the simulator and the test-suite.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::channel::mpsc;
use futures::stream::{BoxStream, StreamExt};
use missive_shared::constants::SERVER_ID_PREFIX;
use missive_shared::{
    ConversationId, Message, MessageId, MessageSnapshot, MessageStatus, SendError, UserId,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::backend::Backend;

#[derive(Default)]
struct State {
    latency: Duration,
    failures: VecDeque<SendError>,
    rejected: HashSet<ConversationId>,
    attempts: usize,
    log: Vec<Message>,
    conversations: HashMap<ConversationId, Vec<Message>>,
    subscribers: HashMap<ConversationId, Vec<mpsc::UnboundedSender<MessageSnapshot>>>,
}

impl State {
    fn publish(&mut self, snapshot: MessageSnapshot) {
        if let Some(subs) = self.subscribers.get_mut(&snapshot.message.conversation_id) {
            subs.retain(|tx| tx.unbounded_send(snapshot.clone()).is_ok());
        }
    }

    fn find_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        self.conversations
            .values_mut()
            .flat_map(|msgs| msgs.iter_mut())
            .find(|m| &m.id == id)
    }
}

/// A document store living in process memory.
///
/// Assigns `srv-` IDs and server timestamps, echoes provisional IDs, treats a
/// resend of an already stored provisional ID as idempotent, and fans
/// snapshots out to subscribers.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    inner: Arc<Mutex<State>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay applied to every `send`.
    pub async fn set_latency(&self, latency: Duration) {
        self.inner.lock().await.latency = latency;
    }

    /// Make the next `send` fail with `error`. Failures queue up.
    pub async fn fail_next(&self, error: SendError) {
        self.inner.lock().await.failures.push_back(error);
    }

    /// Reject every send into `conversation_id` permanently.
    pub async fn reject_conversation(&self, conversation_id: ConversationId) {
        self.inner.lock().await.rejected.insert(conversation_id);
    }

    /// Number of `send` calls, successful or not.
    pub async fn attempts(&self) -> usize {
        self.inner.lock().await.attempts
    }

    /// Texts of acknowledged sends, in acknowledgement order.
    pub async fn sent_texts(&self) -> Vec<String> {
        let guard = self.inner.lock().await;
        guard.log.iter().map(|m| m.text.clone()).collect()
    }

    /// Messages stored for a conversation.
    pub async fn stored(&self, conversation_id: &ConversationId) -> Vec<Message> {
        let guard = self.inner.lock().await;
        guard
            .conversations
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Store a message as if it came from another device.
    pub async fn deliver_remote(&self, mut message: Message) -> Message {
        let mut guard = self.inner.lock().await;
        confirm(&mut message);
        guard
            .conversations
            .entry(message.conversation_id.clone())
            .or_default()
            .push(message.clone());
        guard.publish(MessageSnapshot::added(message.clone()));
        message
    }

    /// Server-side status change (e.g. delivery to a recipient's device).
    pub async fn update_status(&self, id: &MessageId, status: MessageStatus) -> Option<Message> {
        let mut guard = self.inner.lock().await;
        let updated = {
            let msg = guard.find_mut(id)?;
            msg.status = msg.status.merge(status);
            msg.clone()
        };
        guard.publish(MessageSnapshot::modified(updated.clone()));
        Some(updated)
    }

    /// Hand `snapshot` to subscribers as-is, without touching stored state.
    /// Stands in for a snapshot that was delayed in transit.
    pub async fn replay(&self, snapshot: MessageSnapshot) {
        self.inner.lock().await.publish(snapshot);
    }
}

fn confirm(message: &mut Message) {
    message.id = MessageId::new(format!("{SERVER_ID_PREFIX}{}", Uuid::new_v4()));
    message.server_timestamp = Some(Utc::now());
    message.status = message.status.merge(MessageStatus::Sent);
    message.is_optimistic = false;
    message.failure_reason = None;
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn send(&self, message: Message) -> Result<Message, SendError> {
        let latency = {
            let mut guard = self.inner.lock().await;
            guard.attempts += 1;
            if let Some(err) = guard.failures.pop_front() {
                return Err(err);
            }
            if guard.rejected.contains(&message.conversation_id) {
                return Err(SendError::PermanentRejected(format!(
                    "unknown conversation {}",
                    message.conversation_id
                )));
            }
            guard.latency
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut guard = self.inner.lock().await;

        if let Some(provisional) = &message.provisional_id {
            let existing = guard
                .conversations
                .get(&message.conversation_id)
                .and_then(|msgs| {
                    msgs.iter()
                        .find(|m| m.provisional_id.as_ref() == Some(provisional))
                })
                .cloned();
            if let Some(existing) = existing {
                return Ok(existing);
            }
        }

        let mut confirmed = message;
        confirm(&mut confirmed);
        guard
            .conversations
            .entry(confirmed.conversation_id.clone())
            .or_default()
            .push(confirmed.clone());
        guard.log.push(confirmed.clone());
        guard.publish(MessageSnapshot::added(confirmed.clone()));
        Ok(confirmed)
    }

    async fn subscribe(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<BoxStream<'static, MessageSnapshot>, SendError> {
        let (tx, rx) = mpsc::unbounded();
        let mut guard = self.inner.lock().await;
        for msg in guard.conversations.get(conversation_id).into_iter().flatten() {
            let _ = tx.unbounded_send(MessageSnapshot::added(msg.clone()));
        }
        guard
            .subscribers
            .entry(conversation_id.clone())
            .or_default()
            .push(tx);
        Ok(rx.boxed())
    }

    async fn mark_read(&self, message_id: &MessageId, user_id: &UserId) -> Result<(), SendError> {
        let mut guard = self.inner.lock().await;
        let updated = {
            let msg = guard
                .find_mut(message_id)
                .ok_or_else(|| SendError::PermanentRejected(format!("unknown message {message_id}")))?;
            if !msg.read_by.insert(user_id.clone()) {
                return Ok(());
            }
            msg.clone()
        };
        guard.publish(MessageSnapshot::modified(updated));
        Ok(())
    }
}

//! The remote message store the engine delivers to.

use async_trait::async_trait;
use futures::stream::BoxStream;
use missive_shared::{ConversationId, Message, MessageId, MessageSnapshot, SendError, UserId};

/// Backend collaborator.
///
/// Once a write is acknowledged the backend is authoritative for that
/// message. Sequential `send` calls from one client are assumed to be
/// applied in call order.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Store a message and return the confirmed record. The confirmed record
    /// echoes the message's `provisional_id`.
    async fn send(&self, message: Message) -> Result<Message, SendError>;

    /// Ordered, deduplicated-by-id snapshots for one conversation.
    async fn subscribe(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<BoxStream<'static, MessageSnapshot>, SendError>;

    /// Record that `user_id` has read `message_id`.
    async fn mark_read(&self, message_id: &MessageId, user_id: &UserId) -> Result<(), SendError>;
}

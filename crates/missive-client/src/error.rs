use missive_shared::{MessageId, MessageStatus, SendError, TransitionError};
use missive_store::StoreError;
use thiserror::Error;

/// Errors returned by the delivery engine's public operations.
///
/// Per-message delivery failures are not errors here: they surface as a
/// `Failed` status on the message itself.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Backend error: {0}")]
    Backend(#[from] SendError),

    #[error("Unknown message: {0}")]
    UnknownMessage(MessageId),

    #[error("Message {id} cannot be retried while {status}")]
    NotRetryable { id: MessageId, status: MessageStatus },

    #[error("Message {0} is already confirmed by the backend")]
    AlreadyConfirmed(MessageId),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

pub type Result<T> = std::result::Result<T, EngineError>;

//! # missive-shared
//!
//! Types shared by every Missive crate: the message record, the delivery
//! status state machine, connection state, read-receipt aggregation and the
//! error values exchanged with the backend collaborator.
//!
//! Nothing in this crate performs I/O.

pub mod constants;
pub mod error;
pub mod message;
pub mod protocol;
pub mod receipts;
pub mod status;
pub mod types;

pub use error::{SendError, TransitionError};
pub use message::{MatchKey, Message, QueueEntry};
pub use protocol::{MessageSnapshot, SnapshotKind};
pub use receipts::ReadReceiptState;
pub use status::MessageStatus;
pub use types::{ConnectionState, ConversationId, MessageId, UserId};

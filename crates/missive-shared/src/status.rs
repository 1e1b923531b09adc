//! Delivery status state machine for a single message.
//!
//! Local lifecycle moves go through [`MessageStatus::transition`], which
//! rejects illegal jumps. Updates coming from the backend go through
//! [`MessageStatus::merge`], a max-rank merge that never lets a confirmed
//! status regress when updates arrive out of order.

use serde::{Deserialize, Serialize};

use crate::error::TransitionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    Queued,
    Failed,
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    /// Merge rank. `Failed` shares the rank of `Sending`.
    pub fn rank(self) -> u8 {
        match self {
            Self::Sending | Self::Failed => 0,
            Self::Queued => 1,
            Self::Sent => 2,
            Self::Delivered => 3,
            Self::Read => 4,
        }
    }

    /// `Sent` or anything after it: the backend has the message.
    pub fn is_confirmed(self) -> bool {
        matches!(self, Self::Sent | Self::Delivered | Self::Read)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sending => "sending",
            Self::Queued => "queued",
            Self::Failed => "failed",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sending" => Some(Self::Sending),
            "queued" => Some(Self::Queued),
            "failed" => Some(Self::Failed),
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            _ => None,
        }
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use MessageStatus::*;

        if self == next {
            return true;
        }
        match (self, next) {
            (Sending, Failed | Queued) => true,
            (Failed, Sending) => true,
            (Queued, Sending | Failed) => true,
            (Sending | Queued, Sent | Delivered | Read) => true,
            (Sent, Delivered | Read) => true,
            (Delivered, Read) => true,
            _ => false,
        }
    }

    /// Validated local lifecycle move.
    pub fn transition(self, next: Self) -> Result<Self, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError {
                from: self,
                to: next,
            })
        }
    }

    /// Max-rank merge of an incoming status into the current one.
    ///
    /// While neither side is confirmed the incoming status wins, so local
    /// moves between `Sending`, `Queued` and `Failed` apply as-is. Once
    /// either side is confirmed the higher rank wins.
    pub fn merge(self, incoming: Self) -> Self {
        if !self.is_confirmed() && !incoming.is_confirmed() {
            return incoming;
        }
        if incoming.rank() > self.rank() {
            incoming
        } else {
            self
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

use std::time::Duration;

use thiserror::Error;

use crate::status::MessageStatus;

/// Failure reported by the backend collaborator for a single send.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("Network unavailable: {0}")]
    TransientNetwork(String),

    #[error("Server error: {0}")]
    TransientServer(String),

    #[error("Rejected by server: {0}")]
    PermanentRejected(String),

    #[error("No acknowledgement after {0:?}")]
    Timeout(Duration),
}

impl SendError {
    /// Whether the send may be attempted again under the retry policy.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::PermanentRejected(_))
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Illegal status transition {from} -> {to}")]
pub struct TransitionError {
    pub from: MessageStatus,
    pub to: MessageStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rejections_are_permanent() {
        assert!(SendError::TransientNetwork("down".into()).is_retryable());
        assert!(SendError::TransientServer("503".into()).is_retryable());
        assert!(SendError::Timeout(Duration::from_secs(10)).is_retryable());
        assert!(!SendError::PermanentRejected("bad conversation".into()).is_retryable());
    }
}

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Message identity: a server-confirmed ID or a client-generated
    /// provisional UUID.
    MessageId
);

string_id!(
    /// Conversation (DM or group) a message belongs to.
    ConversationId
);

string_id!(
    /// Participant identity.
    UserId
);

impl MessageId {
    /// Fresh client-side provisional ID.
    pub fn provisional() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Process-wide connectivity as seen by the delivery engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "state", content = "in_flight", rename_all = "lowercase")]
pub enum ConnectionState {
    Online,
    #[default]
    Offline,
    Connecting,
    /// Draining the offline queue; carries the number of queued sends left.
    Syncing(usize),
}

impl ConnectionState {
    /// Whether sends may go straight to the backend.
    pub fn is_reachable(&self) -> bool {
        matches!(self, Self::Online | Self::Syncing(_))
    }

    pub fn is_syncing(&self) -> bool {
        matches!(self, Self::Syncing(_))
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => f.write_str("online"),
            Self::Offline => f.write_str("offline"),
            Self::Connecting => f.write_str("connecting"),
            Self::Syncing(n) => write!(f, "syncing({n})"),
        }
    }
}

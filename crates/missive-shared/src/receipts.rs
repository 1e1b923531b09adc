//! Read-receipt aggregation for messages sent by the current user.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::types::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReadReceiptState {
    /// Every recipient has read the message.
    AllRead { total: usize },
    /// Some recipients have read it.
    PartiallyRead { read: usize, total: usize },
    /// No recipient has read it yet.
    SentOnly { total: usize },
}

/// Aggregate `read_by` against `members \ {sender}`.
///
/// The sender never counts toward the denominator, and readers that are no
/// longer members are ignored. A conversation with no other member reports
/// `SentOnly`.
pub fn aggregate(
    read_by: &BTreeSet<UserId>,
    members: &BTreeSet<UserId>,
    sender: &UserId,
) -> ReadReceiptState {
    let recipients: BTreeSet<&UserId> = members.iter().filter(|m| *m != sender).collect();
    let total = recipients.len();
    let read = recipients.iter().filter(|r| read_by.contains(**r)).count();

    if total == 0 || read == 0 {
        ReadReceiptState::SentOnly { total }
    } else if read == total {
        ReadReceiptState::AllRead { total }
    } else {
        ReadReceiptState::PartiallyRead { read, total }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[&str]) -> BTreeSet<UserId> {
        ids.iter().map(|s| UserId::from(*s)).collect()
    }

    #[test]
    fn sender_is_excluded_from_denominator() {
        let members = set(&["alice", "bob", "carol"]);
        let state = aggregate(&set(&["bob", "carol"]), &members, &"alice".into());
        assert_eq!(state, ReadReceiptState::AllRead { total: 2 });
    }

    #[test]
    fn partial_and_unread() {
        let members = set(&["alice", "bob", "carol"]);
        let sender = UserId::from("alice");
        assert_eq!(
            aggregate(&set(&["bob"]), &members, &sender),
            ReadReceiptState::PartiallyRead { read: 1, total: 2 }
        );
        assert_eq!(
            aggregate(&set(&[]), &members, &sender),
            ReadReceiptState::SentOnly { total: 2 }
        );
    }

    #[test]
    fn sender_and_former_members_do_not_count_as_readers() {
        let members = set(&["alice", "bob"]);
        let state = aggregate(&set(&["alice", "mallory"]), &members, &"alice".into());
        assert_eq!(state, ReadReceiptState::SentOnly { total: 1 });
    }

    #[test]
    fn solo_conversation_is_sent_only() {
        let state = aggregate(&set(&[]), &set(&["alice"]), &"alice".into());
        assert_eq!(state, ReadReceiptState::SentOnly { total: 0 });
    }
}

//! The canonical message model the timeline is built from.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delivery status of a message.
///
/// `Sending → {Sent, Failed}` is the only transition the client guarantees;
/// `Sent → Delivered → Read` are monotonic upgrades driven by peer events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    #[default]
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    /// Monotonic ordering used by the merge policy. `Failed` is terminal and
    /// ranks alongside `Sent` so a late peer event can still upgrade a
    /// message the server turned out to have accepted.
    pub fn rank(self) -> u8 {
        match self {
            MessageStatus::Sending => 0,
            MessageStatus::Sent | MessageStatus::Failed => 1,
            MessageStatus::Delivered => 2,
            MessageStatus::Read => 3,
        }
    }

    /// Whether an incoming status may replace `self`. Never regresses.
    pub fn can_upgrade_to(self, next: MessageStatus) -> bool {
        next.rank() > self.rank()
    }
}

/// An attached media item, referenced by server-side storage key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaItem {
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub storage_ref: String,
}

/// One entry in a conversation timeline.
///
/// Identified by `server_id` once the server has confirmed it, and by
/// `client_temp_id` from creation. Both indexes stay valid after
/// reconciliation so duplicate acks resolve to the same entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Server-assigned id; `None` while the message is optimistic.
    pub server_id: Option<String>,
    /// Locally unique id assigned at creation, carried through the REST
    /// fallback for idempotent server-side reconciliation.
    pub client_temp_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub participants: Vec<String>,
    /// Wire-format body (see `payload`); `None` for deleted messages.
    pub encrypted_body: Option<String>,
    /// Populated only for: locally authored messages before transmission,
    /// own messages resolved via the vault, and successfully decrypted
    /// received messages.
    pub plain_text: Option<String>,
    pub status: MessageStatus,
    /// user_id → when that user first read the message. Grows only.
    pub read_by: BTreeMap<String, DateTime<Utc>>,
    /// user_id → emoji. One reaction per user; removal deletes the entry.
    pub reactions: BTreeMap<String, String>,
    pub media: Vec<MediaItem>,
    pub reply_to: Option<String>,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// The id peers and the server know this message by, preferring the
    /// canonical server id.
    pub fn canonical_id(&self) -> &str {
        self.server_id.as_deref().unwrap_or(&self.client_temp_id)
    }

    /// Record a read receipt. The first receipt per user wins; later
    /// receipts for the same user (e.g. from a second session) are ignored.
    pub fn record_read(&mut self, user_id: &str, read_at: DateTime<Utc>) -> bool {
        if self.read_by.contains_key(user_id) {
            return false;
        }
        self.read_by.insert(user_id.to_string(), read_at);
        if self.status.can_upgrade_to(MessageStatus::Read) {
            self.status = MessageStatus::Read;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank(status: MessageStatus) -> Message {
        Message {
            server_id: None,
            client_temp_id: "tmp-1".into(),
            conversation_id: "c1".into(),
            sender_id: "alice".into(),
            participants: vec!["alice".into(), "bob".into()],
            encrypted_body: None,
            plain_text: None,
            status,
            read_by: BTreeMap::new(),
            reactions: BTreeMap::new(),
            media: Vec::new(),
            reply_to: None,
            deleted: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn status_never_regresses() {
        assert!(MessageStatus::Sent.can_upgrade_to(MessageStatus::Delivered));
        assert!(MessageStatus::Delivered.can_upgrade_to(MessageStatus::Read));
        assert!(!MessageStatus::Read.can_upgrade_to(MessageStatus::Sent));
        assert!(!MessageStatus::Delivered.can_upgrade_to(MessageStatus::Delivered));
    }

    #[test]
    fn duplicate_read_receipt_keeps_one_entry() {
        let mut msg = blank(MessageStatus::Sent);
        let first = Utc::now();
        let second = first + chrono::Duration::milliseconds(800);
        assert!(msg.record_read("bob", first));
        assert!(!msg.record_read("bob", second));
        assert_eq!(msg.read_by.len(), 1);
        assert_eq!(msg.read_by["bob"], first);
        assert_eq!(msg.status, MessageStatus::Read);
    }
}

//! Conversation timelines behind a single-writer reducer.
//!
//! Every mutation is a [`TimelineEvent`] applied by one writer per store;
//! readers get cloned snapshots. No call site edits a `Message` in place,
//! so the merge policy (status monotonicity, first-receipt-wins, duplicate
//! suppression) lives in exactly one match.
//!
//! Entries are indexed by server id AND client temp id. The temp-id index
//! survives confirmation so a duplicate ack, or a socket echo racing the
//! REST fallback, resolves to the same entry instead of a second bubble.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use cove_proto::message::{Message, MessageStatus};

/// Everything that can change a timeline.
#[derive(Debug, Clone)]
pub enum TimelineEvent {
    /// A locally authored message enters the timeline in `Sending` state.
    OptimisticInsert(Message),
    /// The server confirmed one of our sends (socket ack or REST response).
    AckConfirmed {
        conversation_id: String,
        client_temp_id: String,
        server_id: String,
        created_at: DateTime<Utc>,
    },
    /// Both transports failed; the entry stays visible with retry controls.
    SendFailed {
        conversation_id: String,
        client_temp_id: String,
        reason: String,
    },
    /// A failed entry is being resent under its original temp id.
    RetryStarted {
        conversation_id: String,
        client_temp_id: String,
    },
    /// The user discarded a failed entry.
    RemoveFailed {
        conversation_id: String,
        client_temp_id: String,
    },
    /// A local edit shown before the server confirms it. The same event
    /// carries the old bodies back if both transports fail.
    EditApplied {
        conversation_id: String,
        message_id: String,
        plain_text: Option<String>,
        encrypted_body: Option<String>,
    },
    /// A server-confirmed message (peer send, history, or echo of our own).
    ServerMessage(Message),
    StatusChanged {
        conversation_id: String,
        message_id: String,
        status: MessageStatus,
    },
    Read {
        conversation_id: String,
        user_id: String,
        message_ids: Vec<String>,
        read_at: DateTime<Utc>,
    },
    Deleted {
        conversation_id: String,
        message_id: String,
    },
    /// `emoji = None` clears the user's reaction.
    ReactionSet {
        conversation_id: String,
        message_id: String,
        user_id: String,
        emoji: Option<String>,
    },
}

impl TimelineEvent {
    fn conversation_id(&self) -> &str {
        match self {
            TimelineEvent::OptimisticInsert(msg) | TimelineEvent::ServerMessage(msg) => {
                &msg.conversation_id
            }
            TimelineEvent::AckConfirmed {
                conversation_id, ..
            }
            | TimelineEvent::SendFailed {
                conversation_id, ..
            }
            | TimelineEvent::RetryStarted {
                conversation_id, ..
            }
            | TimelineEvent::RemoveFailed {
                conversation_id, ..
            }
            | TimelineEvent::EditApplied {
                conversation_id, ..
            }
            | TimelineEvent::StatusChanged {
                conversation_id, ..
            }
            | TimelineEvent::Read {
                conversation_id, ..
            }
            | TimelineEvent::Deleted {
                conversation_id, ..
            }
            | TimelineEvent::ReactionSet {
                conversation_id, ..
            } => conversation_id,
        }
    }
}

/// One conversation's ordered entries plus both id indexes.
#[derive(Default)]
struct Timeline {
    entries: Vec<Message>,
    by_server: HashMap<String, usize>,
    by_temp: HashMap<String, usize>,
}

impl Timeline {
    fn find(&self, message_id: &str) -> Option<usize> {
        self.by_server
            .get(message_id)
            .or_else(|| self.by_temp.get(message_id))
            .copied()
    }

    fn reindex(&mut self) {
        self.by_server.clear();
        self.by_temp.clear();
        for (idx, msg) in self.entries.iter().enumerate() {
            if let Some(ref id) = msg.server_id {
                self.by_server.insert(id.clone(), idx);
            }
            self.by_temp.insert(msg.client_temp_id.clone(), idx);
        }
    }

    fn apply(&mut self, event: TimelineEvent) {
        match event {
            TimelineEvent::OptimisticInsert(msg) => {
                if self.by_temp.contains_key(&msg.client_temp_id) {
                    return;
                }
                self.by_temp
                    .insert(msg.client_temp_id.clone(), self.entries.len());
                self.entries.push(msg);
            }

            TimelineEvent::AckConfirmed {
                client_temp_id,
                server_id,
                created_at,
                ..
            } => {
                let Some(&idx) = self.by_temp.get(&client_temp_id) else {
                    debug!(
                        target: "cove_core::timeline",
                        client_temp_id,
                        "ack for unknown temp id, dropping"
                    );
                    return;
                };
                let msg = &mut self.entries[idx];
                if let Some(ref existing) = msg.server_id {
                    // Duplicate ack (socket echo after REST fallback already
                    // confirmed, or vice versa).
                    debug_assert_eq!(existing, &server_id);
                    return;
                }
                msg.server_id = Some(server_id.clone());
                msg.created_at = created_at;
                msg.updated_at = Utc::now();
                if msg.status.can_upgrade_to(MessageStatus::Sent)
                    || msg.status == MessageStatus::Failed
                {
                    msg.status = MessageStatus::Sent;
                }
                self.by_server.insert(server_id, idx);
            }

            TimelineEvent::SendFailed {
                client_temp_id, ..
            } => {
                if let Some(&idx) = self.by_temp.get(&client_temp_id) {
                    let msg = &mut self.entries[idx];
                    // A late failure never demotes a confirmed send.
                    if msg.status == MessageStatus::Sending {
                        msg.status = MessageStatus::Failed;
                        msg.updated_at = Utc::now();
                    }
                }
            }

            TimelineEvent::RetryStarted {
                client_temp_id, ..
            } => {
                if let Some(&idx) = self.by_temp.get(&client_temp_id) {
                    let msg = &mut self.entries[idx];
                    if msg.status == MessageStatus::Failed {
                        msg.status = MessageStatus::Sending;
                        msg.updated_at = Utc::now();
                    }
                }
            }

            TimelineEvent::RemoveFailed {
                client_temp_id, ..
            } => {
                if let Some(&idx) = self.by_temp.get(&client_temp_id) {
                    if self.entries[idx].status == MessageStatus::Failed {
                        self.entries.remove(idx);
                        self.reindex();
                    }
                }
            }

            TimelineEvent::EditApplied {
                message_id,
                plain_text,
                encrypted_body,
                ..
            } => {
                if let Some(idx) = self.find(&message_id) {
                    let msg = &mut self.entries[idx];
                    msg.plain_text = plain_text;
                    msg.encrypted_body = encrypted_body;
                    msg.updated_at = Utc::now();
                }
            }

            TimelineEvent::ServerMessage(incoming) => {
                // Already known under its server id: merge, never duplicate.
                if let Some(id) = incoming.server_id.as_deref() {
                    if let Some(&idx) = self.by_server.get(id) {
                        let msg = &mut self.entries[idx];
                        if msg.status.can_upgrade_to(incoming.status) {
                            msg.status = incoming.status;
                        }
                        // The server echo is authoritative for content, so
                        // an edit's new body replaces the old one.
                        if incoming.plain_text.is_some() {
                            msg.plain_text = incoming.plain_text;
                            msg.encrypted_body = incoming.encrypted_body;
                        }
                        if !incoming.media.is_empty() {
                            msg.media = incoming.media;
                        }
                        msg.updated_at = Utc::now();
                        return;
                    }
                }
                // Echo of one of our optimistic sends: confirm in place, at
                // its original position.
                if let Some(&idx) = self.by_temp.get(&incoming.client_temp_id) {
                    let server_id = incoming.server_id.clone();
                    let msg = &mut self.entries[idx];
                    msg.server_id = incoming.server_id;
                    msg.encrypted_body = incoming.encrypted_body;
                    msg.media = incoming.media;
                    msg.created_at = incoming.created_at;
                    msg.updated_at = Utc::now();
                    if msg.status.can_upgrade_to(MessageStatus::Sent)
                        || msg.status == MessageStatus::Failed
                    {
                        msg.status = MessageStatus::Sent;
                    }
                    if let Some(id) = server_id {
                        self.by_server.insert(id, idx);
                    }
                    return;
                }
                let idx = self.entries.len();
                if let Some(ref id) = incoming.server_id {
                    self.by_server.insert(id.clone(), idx);
                }
                self.by_temp.insert(incoming.client_temp_id.clone(), idx);
                self.entries.push(incoming);
            }

            TimelineEvent::StatusChanged {
                message_id, status, ..
            } => {
                if let Some(idx) = self.find(&message_id) {
                    let msg = &mut self.entries[idx];
                    if msg.status.can_upgrade_to(status) {
                        msg.status = status;
                        msg.updated_at = Utc::now();
                    }
                }
            }

            TimelineEvent::Read {
                user_id,
                message_ids,
                read_at,
                ..
            } => {
                for id in &message_ids {
                    if let Some(idx) = self.find(id) {
                        self.entries[idx].record_read(&user_id, read_at);
                    }
                }
            }

            TimelineEvent::Deleted { message_id, .. } => {
                if let Some(idx) = self.find(&message_id) {
                    let msg = &mut self.entries[idx];
                    msg.deleted = true;
                    msg.encrypted_body = None;
                    msg.plain_text = None;
                    msg.updated_at = Utc::now();
                }
            }

            TimelineEvent::ReactionSet {
                message_id,
                user_id,
                emoji,
                ..
            } => {
                if let Some(idx) = self.find(&message_id) {
                    let msg = &mut self.entries[idx];
                    match emoji {
                        Some(emoji) => {
                            msg.reactions.insert(user_id, emoji);
                        }
                        None => {
                            msg.reactions.remove(&user_id);
                        }
                    }
                    msg.updated_at = Utc::now();
                }
            }
        }
    }
}

/// Shared handle over all conversation timelines. Clone freely; all clones
/// route through the same reducer state.
#[derive(Clone, Default)]
pub struct TimelineStore {
    timelines: Arc<RwLock<HashMap<String, Timeline>>>,
}

impl TimelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn apply(&self, event: TimelineEvent) {
        let conversation_id = event.conversation_id().to_string();
        let mut timelines = self.timelines.write().await;
        timelines
            .entry(conversation_id)
            .or_default()
            .apply(event);
    }

    /// Cloned view of a conversation, in insertion order.
    pub async fn snapshot(&self, conversation_id: &str) -> Vec<Message> {
        let timelines = self.timelines.read().await;
        timelines
            .get(conversation_id)
            .map(|t| t.entries.clone())
            .unwrap_or_default()
    }

    /// Look up one message by server id or client temp id.
    pub async fn message(&self, conversation_id: &str, message_id: &str) -> Option<Message> {
        let timelines = self.timelines.read().await;
        let timeline = timelines.get(conversation_id)?;
        timeline.find(message_id).map(|idx| timeline.entries[idx].clone())
    }

    /// Which conversation a client temp id belongs to. Socket acks do not
    /// carry a conversation id, so this is the reverse lookup for them.
    pub async fn conversation_of(&self, client_temp_id: &str) -> Option<String> {
        let timelines = self.timelines.read().await;
        timelines
            .iter()
            .find(|(_, t)| t.by_temp.contains_key(client_temp_id))
            .map(|(conv, _)| conv.clone())
    }
}

// ── Inbound dedup window ─────────────────────────────────────────────────────

const SEEN_CAPACITY: usize = 1000;

/// Bounded set of recently processed message ids. When full, the oldest
/// half is evicted in one sweep rather than tracking per-entry recency.
#[derive(Default)]
pub struct SeenIds {
    set: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the id was not seen before.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.set.contains(id) {
            return false;
        }
        if self.order.len() >= SEEN_CAPACITY {
            for _ in 0..SEEN_CAPACITY / 2 {
                if let Some(old) = self.order.pop_front() {
                    self.set.remove(&old);
                }
            }
        }
        self.set.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn optimistic(temp_id: &str) -> Message {
        Message {
            server_id: None,
            client_temp_id: temp_id.into(),
            conversation_id: "c1".into(),
            sender_id: "alice".into(),
            participants: vec!["alice".into(), "bob".into()],
            encrypted_body: Some("body".into()),
            plain_text: Some("hi".into()),
            status: MessageStatus::Sending,
            read_by: BTreeMap::new(),
            reactions: BTreeMap::new(),
            media: Vec::new(),
            reply_to: None,
            deleted: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn from_server(server_id: &str, temp_id: &str, sender: &str) -> Message {
        Message {
            server_id: Some(server_id.into()),
            sender_id: sender.into(),
            status: MessageStatus::Sent,
            ..optimistic(temp_id)
        }
    }

    #[tokio::test]
    async fn ack_confirms_in_place_and_keeps_both_indexes() {
        let store = TimelineStore::new();
        store.apply(TimelineEvent::OptimisticInsert(optimistic("tmp-1"))).await;
        store.apply(TimelineEvent::OptimisticInsert(optimistic("tmp-2"))).await;
        store
            .apply(TimelineEvent::AckConfirmed {
                conversation_id: "c1".into(),
                client_temp_id: "tmp-1".into(),
                server_id: "srv-1".into(),
                created_at: Utc::now(),
            })
            .await;

        let snap = store.snapshot("c1").await;
        assert_eq!(snap.len(), 2);
        // Position unchanged after confirmation.
        assert_eq!(snap[0].client_temp_id, "tmp-1");
        assert_eq!(snap[0].server_id.as_deref(), Some("srv-1"));
        assert_eq!(snap[0].status, MessageStatus::Sent);
        // Resolvable by either id.
        assert!(store.message("c1", "srv-1").await.is_some());
        assert!(store.message("c1", "tmp-1").await.is_some());
    }

    #[tokio::test]
    async fn server_echo_after_ack_does_not_duplicate() {
        let store = TimelineStore::new();
        store.apply(TimelineEvent::OptimisticInsert(optimistic("tmp-1"))).await;
        store
            .apply(TimelineEvent::AckConfirmed {
                conversation_id: "c1".into(),
                client_temp_id: "tmp-1".into(),
                server_id: "srv-1".into(),
                created_at: Utc::now(),
            })
            .await;
        store
            .apply(TimelineEvent::ServerMessage(from_server("srv-1", "tmp-1", "alice")))
            .await;

        assert_eq!(store.snapshot("c1").await.len(), 1);
    }

    #[tokio::test]
    async fn late_failure_never_demotes_a_confirmed_send() {
        let store = TimelineStore::new();
        store.apply(TimelineEvent::OptimisticInsert(optimistic("tmp-1"))).await;
        store
            .apply(TimelineEvent::AckConfirmed {
                conversation_id: "c1".into(),
                client_temp_id: "tmp-1".into(),
                server_id: "srv-1".into(),
                created_at: Utc::now(),
            })
            .await;
        store
            .apply(TimelineEvent::SendFailed {
                conversation_id: "c1".into(),
                client_temp_id: "tmp-1".into(),
                reason: "late timeout".into(),
            })
            .await;

        assert_eq!(
            store.message("c1", "tmp-1").await.unwrap().status,
            MessageStatus::Sent
        );
    }

    #[tokio::test]
    async fn failed_retry_remove_lifecycle() {
        let store = TimelineStore::new();
        store.apply(TimelineEvent::OptimisticInsert(optimistic("tmp-1"))).await;
        store
            .apply(TimelineEvent::SendFailed {
                conversation_id: "c1".into(),
                client_temp_id: "tmp-1".into(),
                reason: "offline".into(),
            })
            .await;
        assert_eq!(
            store.message("c1", "tmp-1").await.unwrap().status,
            MessageStatus::Failed
        );

        store
            .apply(TimelineEvent::RetryStarted {
                conversation_id: "c1".into(),
                client_temp_id: "tmp-1".into(),
            })
            .await;
        assert_eq!(
            store.message("c1", "tmp-1").await.unwrap().status,
            MessageStatus::Sending
        );

        store
            .apply(TimelineEvent::SendFailed {
                conversation_id: "c1".into(),
                client_temp_id: "tmp-1".into(),
                reason: "offline".into(),
            })
            .await;
        store
            .apply(TimelineEvent::RemoveFailed {
                conversation_id: "c1".into(),
                client_temp_id: "tmp-1".into(),
            })
            .await;
        assert!(store.snapshot("c1").await.is_empty());
    }

    #[tokio::test]
    async fn edit_applied_overwrites_and_can_restore() {
        let store = TimelineStore::new();
        store
            .apply(TimelineEvent::ServerMessage(from_server("srv-1", "tmp-1", "alice")))
            .await;

        store
            .apply(TimelineEvent::EditApplied {
                conversation_id: "c1".into(),
                message_id: "srv-1".into(),
                plain_text: Some("edited".into()),
                encrypted_body: Some("edited-body".into()),
            })
            .await;
        let msg = store.message("c1", "srv-1").await.unwrap();
        assert_eq!(msg.plain_text.as_deref(), Some("edited"));
        assert_eq!(msg.status, MessageStatus::Sent);

        // Restoring the previous bodies uses the same event.
        store
            .apply(TimelineEvent::EditApplied {
                conversation_id: "c1".into(),
                message_id: "srv-1".into(),
                plain_text: Some("hi".into()),
                encrypted_body: Some("body".into()),
            })
            .await;
        let msg = store.message("c1", "srv-1").await.unwrap();
        assert_eq!(msg.plain_text.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn read_receipts_are_first_wins_and_monotonic() {
        let store = TimelineStore::new();
        store
            .apply(TimelineEvent::ServerMessage(from_server("srv-1", "tmp-1", "alice")))
            .await;

        let first = Utc::now();
        let second = first + chrono::Duration::seconds(1);
        // Two sessions of the same reader, a second apart.
        for read_at in [first, second] {
            store
                .apply(TimelineEvent::Read {
                    conversation_id: "c1".into(),
                    user_id: "bob".into(),
                    message_ids: vec!["srv-1".into()],
                    read_at,
                })
                .await;
        }

        let msg = store.message("c1", "srv-1").await.unwrap();
        assert_eq!(msg.read_by.len(), 1);
        assert_eq!(msg.read_by["bob"], first);
        assert_eq!(msg.status, MessageStatus::Read);

        // A later plain status event cannot regress it.
        store
            .apply(TimelineEvent::StatusChanged {
                conversation_id: "c1".into(),
                message_id: "srv-1".into(),
                status: MessageStatus::Delivered,
            })
            .await;
        assert_eq!(
            store.message("c1", "srv-1").await.unwrap().status,
            MessageStatus::Read
        );
    }

    #[tokio::test]
    async fn delete_clears_bodies() {
        let store = TimelineStore::new();
        store
            .apply(TimelineEvent::ServerMessage(from_server("srv-1", "tmp-1", "bob")))
            .await;
        store
            .apply(TimelineEvent::Deleted {
                conversation_id: "c1".into(),
                message_id: "srv-1".into(),
            })
            .await;

        let msg = store.message("c1", "srv-1").await.unwrap();
        assert!(msg.deleted);
        assert!(msg.encrypted_body.is_none());
        assert!(msg.plain_text.is_none());
    }

    #[tokio::test]
    async fn reactions_are_one_per_user() {
        let store = TimelineStore::new();
        store
            .apply(TimelineEvent::ServerMessage(from_server("srv-1", "tmp-1", "bob")))
            .await;
        for emoji in [Some("👍"), Some("❤️")] {
            store
                .apply(TimelineEvent::ReactionSet {
                    conversation_id: "c1".into(),
                    message_id: "srv-1".into(),
                    user_id: "bob".into(),
                    emoji: emoji.map(String::from),
                })
                .await;
        }
        let msg = store.message("c1", "srv-1").await.unwrap();
        assert_eq!(msg.reactions["bob"], "❤️");

        store
            .apply(TimelineEvent::ReactionSet {
                conversation_id: "c1".into(),
                message_id: "srv-1".into(),
                user_id: "bob".into(),
                emoji: None,
            })
            .await;
        let msg = store.message("c1", "srv-1").await.unwrap();
        assert!(msg.reactions.is_empty());
    }

    #[test]
    fn seen_ids_dedup_and_eviction() {
        let mut seen = SeenIds::new();
        assert!(seen.insert("m1"));
        assert!(!seen.insert("m1"));

        for i in 0..SEEN_CAPACITY {
            seen.insert(&format!("bulk-{i}"));
        }
        // Capacity pressure evicted the oldest half, so m1 is forgotten.
        assert!(seen.insert("m1"));
        assert!(seen.order.len() <= SEEN_CAPACITY);
    }
}

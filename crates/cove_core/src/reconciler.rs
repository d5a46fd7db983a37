//! Inbound event reconciliation.
//!
//! One consumer drains the socket subscription and folds every server
//! event into the timeline. Duplicates are dropped against a bounded
//! seen-id window before any decryption work happens.
//!
//! Plaintext resolution policy: our own echoes come from the vault (a V2
//! ciphertext is keyed for the recipient), everything else goes through
//! the engine, and any failure renders the placeholder instead of
//! surfacing an error to the timeline.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use cove_proto::events::{InboundEvent, MessageEnvelope, SendAck, Topic};
use cove_proto::message::{Message, MessageStatus};
use cove_store::OwnMessageVault;

use crate::engine::{EncryptionEngine, UNDECRYPTABLE_PLACEHOLDER};
use crate::error::ChatError;
use crate::timeline::{SeenIds, TimelineEvent, TimelineStore};
use crate::transport::{RestTransport, SocketTransport};

const ALL_TOPICS: [Topic; 6] = [
    Topic::Messages,
    Topic::Receipts,
    Topic::Reactions,
    Topic::Typing,
    Topic::Conversation,
    Topic::Acks,
];

#[derive(Clone)]
pub struct MessageReconciler {
    engine: EncryptionEngine,
    vault: OwnMessageVault,
    timeline: TimelineStore,
    rest: Arc<dyn RestTransport>,
    socket: Arc<dyn SocketTransport>,
    seen: Arc<Mutex<SeenIds>>,
    typing: Arc<RwLock<HashMap<String, HashMap<String, bool>>>>,
}

impl MessageReconciler {
    pub fn new(
        engine: EncryptionEngine,
        vault: OwnMessageVault,
        timeline: TimelineStore,
        rest: Arc<dyn RestTransport>,
        socket: Arc<dyn SocketTransport>,
    ) -> Self {
        Self {
            engine,
            vault,
            timeline,
            rest,
            socket,
            seen: Arc::new(Mutex::new(SeenIds::new())),
            typing: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Subscribe to every topic and drain events until the socket closes.
    pub fn spawn(&self) -> tokio::task::JoinHandle<()> {
        let mut subscription = self.socket.subscribe(&ALL_TOPICS);
        let reconciler = self.clone();
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                reconciler.handle(event).await;
            }
            debug!(target: "cove_core::reconciler", "event stream closed");
        })
    }

    /// Fold one server event into local state. Infallible by policy:
    /// anything unreadable is logged and rendered degraded, never dropped
    /// as an error.
    pub async fn handle(&self, event: InboundEvent) {
        match event {
            InboundEvent::ReceiveMessage(envelope) => {
                if !self.seen.lock().expect("seen lock").insert(&envelope.id) {
                    debug!(
                        target: "cove_core::reconciler",
                        message_id = %envelope.id,
                        "duplicate message event dropped"
                    );
                    return;
                }
                let message = self.resolve_envelope(envelope).await;
                self.timeline.apply(TimelineEvent::ServerMessage(message)).await;
            }

            InboundEvent::MessageStatus {
                conversation_id,
                message_id,
                status,
            } => {
                self.timeline
                    .apply(TimelineEvent::StatusChanged {
                        conversation_id,
                        message_id,
                        status,
                    })
                    .await;
            }

            InboundEvent::MessagesRead {
                conversation_id,
                user_id,
                message_ids,
                read_at,
            } => {
                self.timeline
                    .apply(TimelineEvent::Read {
                        conversation_id,
                        user_id,
                        message_ids,
                        read_at,
                    })
                    .await;
            }

            InboundEvent::MessageDeleted {
                conversation_id,
                message_id,
            } => {
                self.timeline
                    .apply(TimelineEvent::Deleted {
                        conversation_id,
                        message_id,
                    })
                    .await;
            }

            InboundEvent::ReactionUpdate {
                conversation_id,
                message_id,
                user_id,
                emoji,
            } => {
                self.timeline
                    .apply(TimelineEvent::ReactionSet {
                        conversation_id,
                        message_id,
                        user_id,
                        emoji,
                    })
                    .await;
            }

            InboundEvent::ReactionSuccess { message_id, .. } => {
                debug!(target: "cove_core::reconciler", message_id = %message_id, "reaction confirmed");
            }
            InboundEvent::ReactionError {
                message_id, reason, ..
            } => {
                warn!(
                    target: "cove_core::reconciler",
                    message_id = %message_id,
                    reason,
                    "reaction rejected"
                );
            }

            InboundEvent::Typing {
                conversation_id,
                user_id,
                typing,
            } => {
                let mut table = self.typing.write().await;
                let entry = table.entry(conversation_id).or_default();
                if typing {
                    entry.insert(user_id, true);
                } else {
                    entry.remove(&user_id);
                }
            }

            InboundEvent::ConversationUpdated { conversation_id } => {
                debug!(
                    target: "cove_core::reconciler",
                    conversation_id,
                    "conversation metadata changed"
                );
            }

            // A socket ack can arrive here as a broadcast after the REST
            // fallback already confirmed the send; the reducer makes the
            // second confirmation a no-op.
            InboundEvent::SendMessageSuccess(ack)
            | InboundEvent::EditMessageSuccess(ack)
            | InboundEvent::ReplyMessageSuccess(ack) => {
                self.confirm_from_ack(ack).await;
            }

            InboundEvent::SendMessageError(nack)
            | InboundEvent::EditMessageError(nack)
            | InboundEvent::ReplyMessageError(nack) => {
                warn!(
                    target: "cove_core::reconciler",
                    client_temp_id = %nack.client_temp_id,
                    reason = %nack.reason,
                    "server rejected submission"
                );
                // Conversation id is not on the nack; scan is acceptable at
                // the rate nacks occur.
                // TODO: ask the server team to add conversation_id to the
                // error ack payload so this lookup goes away.
                self.fail_by_temp_id(&nack.client_temp_id, &nack.reason).await;
            }
        }
    }

    /// Users currently typing in a conversation.
    pub async fn typing_users(&self, conversation_id: &str) -> Vec<String> {
        let table = self.typing.read().await;
        table
            .get(conversation_id)
            .map(|users| users.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Pull one page of history and fold it into the timeline, oldest
    /// first. Returns the cursor for the next (older) page.
    pub async fn ingest_history(
        &self,
        conversation_id: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<Option<String>, ChatError> {
        let page = self
            .rest
            .fetch_history(conversation_id, cursor, limit)
            .await?;
        // Pages arrive newest-first; apply in timeline order.
        for envelope in page.messages.into_iter().rev() {
            if !self.seen.lock().expect("seen lock").insert(&envelope.id) {
                continue;
            }
            let message = self.resolve_envelope(envelope).await;
            self.timeline.apply(TimelineEvent::ServerMessage(message)).await;
        }
        Ok(page.next_cursor)
    }

    // ── Plaintext resolution ─────────────────────────────────────────────────

    async fn resolve_envelope(&self, envelope: MessageEnvelope) -> Message {
        let own = envelope.sender_id == self.engine.local_user_id();
        let plain_text = self.resolve_plaintext(&envelope, own).await;
        Message {
            server_id: Some(envelope.id.clone()),
            client_temp_id: envelope
                .client_temp_id
                .unwrap_or_else(|| envelope.id.clone()),
            conversation_id: envelope.conversation_id,
            sender_id: envelope.sender_id,
            participants: envelope.participants,
            encrypted_body: Some(envelope.body),
            plain_text: Some(plain_text),
            status: if own {
                MessageStatus::Sent
            } else {
                MessageStatus::Delivered
            },
            read_by: Default::default(),
            reactions: Default::default(),
            media: envelope.media,
            reply_to: envelope.reply_to,
            deleted: false,
            created_at: envelope.created_at,
            updated_at: Utc::now(),
        }
    }

    async fn resolve_plaintext(&self, envelope: &MessageEnvelope, own: bool) -> String {
        if own {
            match self
                .vault
                .own_plaintext(
                    &envelope.conversation_id,
                    &envelope.id,
                    self.engine.local_user_id(),
                )
                .await
            {
                Ok(Some(text)) => return text,
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        target: "cove_core::reconciler",
                        message_id = %envelope.id,
                        error = %e,
                        "vault lookup failed"
                    );
                }
            }
            // No vault entry (other device, or pre-vault history). The
            // engine still reads V1 and backend-delegated bodies; V2 is
            // refused and falls through to the placeholder.
        }
        match self
            .engine
            .decrypt(&envelope.conversation_id, &envelope.sender_id, &envelope.body)
            .await
        {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    target: "cove_core::reconciler",
                    conversation_id = %envelope.conversation_id,
                    message_id = %envelope.id,
                    error = %e,
                    "body undecryptable, rendering placeholder"
                );
                UNDECRYPTABLE_PLACEHOLDER.to_string()
            }
        }
    }

    async fn confirm_from_ack(&self, ack: SendAck) {
        let Some(conversation_id) = self.conversation_of_temp_id(&ack.client_temp_id).await
        else {
            debug!(
                target: "cove_core::reconciler",
                client_temp_id = %ack.client_temp_id,
                "ack for unknown submission"
            );
            return;
        };
        self.timeline
            .apply(TimelineEvent::AckConfirmed {
                conversation_id: conversation_id.clone(),
                client_temp_id: ack.client_temp_id.clone(),
                server_id: ack.message_id.clone(),
                created_at: ack.created_at,
            })
            .await;
        // Backfill the vault in case this ack beat the dispatcher's own
        // confirmation path.
        if let Some(msg) = self
            .timeline
            .message(&conversation_id, &ack.client_temp_id)
            .await
        {
            if let Some(ref text) = msg.plain_text {
                if let Err(e) = self
                    .vault
                    .store_own_plaintext(
                        &conversation_id,
                        &ack.message_id,
                        text,
                        self.engine.local_user_id(),
                    )
                    .await
                {
                    warn!(
                        target: "cove_core::reconciler",
                        message_id = %ack.message_id,
                        error = %e,
                        "vault backfill failed"
                    );
                }
            }
        }
    }

    async fn fail_by_temp_id(&self, client_temp_id: &str, reason: &str) {
        if let Some(conversation_id) = self.conversation_of_temp_id(client_temp_id).await {
            self.timeline
                .apply(TimelineEvent::SendFailed {
                    conversation_id,
                    client_temp_id: client_temp_id.to_string(),
                    reason: reason.to_string(),
                })
                .await;
        }
    }

    async fn conversation_of_temp_id(&self, client_temp_id: &str) -> Option<String> {
        self.timeline
            .conversation_of(client_temp_id)
            .await
    }
}

//! Optimistic send pipeline.
//!
//! Every send follows the same shape: encrypt, insert an optimistic
//! `Sending` entry, try the socket with a bounded ack wait, fall back to
//! REST with the SAME client temp id (the server's idempotency key), and
//! settle the entry to `Sent` or `Failed`. Media submissions skip the
//! socket entirely; acks cannot carry multipart bodies.
//!
//! The vault write happens only after a server id exists. An optimistic
//! entry already holds its plaintext in memory, and a failed send has no
//! server identity to key a vault entry by.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use cove_proto::api::{MediaUpload, SubmitKind, SubmitMessageRequest};
use cove_proto::events::{OutboundEvent, SendAck};
use cove_proto::message::{Message, MessageStatus};
use cove_proto::payload::EncryptedPayload;
use cove_store::OwnMessageVault;

use crate::engine::EncryptionEngine;
use crate::error::ChatError;
use crate::key_exchange::KeyExchangeClient;
use crate::timeline::{TimelineEvent, TimelineStore};
use crate::transport::{RestTransport, RoomGuard, SocketTransport, TransportError};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How long to wait for a socket ack before falling back to REST.
    pub ack_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(5000),
        }
    }
}

/// Which transport ultimately confirmed a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPath {
    Socket,
    Rest,
}

/// A confirmed send.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub client_temp_id: String,
    pub server_id: String,
    pub created_at: DateTime<Utc>,
    pub via: SendPath,
}

#[derive(Clone)]
pub struct MessageDispatcher {
    config: DispatcherConfig,
    socket: Arc<dyn SocketTransport>,
    rest: Arc<dyn RestTransport>,
    engine: EncryptionEngine,
    keys: KeyExchangeClient,
    vault: OwnMessageVault,
    timeline: TimelineStore,
}

impl MessageDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DispatcherConfig,
        socket: Arc<dyn SocketTransport>,
        rest: Arc<dyn RestTransport>,
        engine: EncryptionEngine,
        keys: KeyExchangeClient,
        vault: OwnMessageVault,
        timeline: TimelineStore,
    ) -> Self {
        Self {
            config,
            socket,
            rest,
            engine,
            keys,
            vault,
            timeline,
        }
    }

    pub fn timeline(&self) -> &TimelineStore {
        &self.timeline
    }

    /// Prepare a conversation for use: ensure key material on both sides,
    /// confirm the server agrees with our published key, and join the
    /// socket room. The returned guard leaves the room on drop.
    pub async fn open_conversation(
        &self,
        conversation_id: &str,
        participants: &[String],
    ) -> Result<RoomGuard, ChatError> {
        self.keys
            .ensure_all_conversation_keys(conversation_id, participants)
            .await?;
        self.keys.verify_key_on_server(conversation_id).await?;
        self.socket
            .emit(OutboundEvent::JoinRoom {
                conversation_id: conversation_id.to_string(),
            })
            .await?;
        Ok(RoomGuard::new(
            Arc::clone(&self.socket),
            conversation_id.to_string(),
        ))
    }

    pub async fn send_text(
        &self,
        conversation_id: &str,
        participants: &[String],
        text: &str,
    ) -> Result<SendOutcome, ChatError> {
        self.send_body(conversation_id, participants, text, None, SubmitKind::Send)
            .await
    }

    /// Emoji-only messages travel on their own socket event but are
    /// otherwise ordinary sends.
    pub async fn send_emoji(
        &self,
        conversation_id: &str,
        participants: &[String],
        emoji: &str,
    ) -> Result<SendOutcome, ChatError> {
        if emoji.trim().is_empty() {
            return Err(ChatError::Validation("emoji body is empty".into()));
        }
        let temp_id = Uuid::new_v4().to_string();
        let body = self
            .encrypt_for(conversation_id, participants, emoji)
            .await?;
        let event = OutboundEvent::SendEmoji {
            client_temp_id: temp_id.clone(),
            conversation_id: conversation_id.to_string(),
            body: body.clone(),
            participants: participants.to_vec(),
        };
        let request = SubmitMessageRequest {
            kind: SubmitKind::Send,
            client_temp_id: temp_id.clone(),
            conversation_id: conversation_id.to_string(),
            body,
            participants: participants.to_vec(),
            reply_to: None,
            target_message_id: None,
        };
        self.dispatch(conversation_id, participants, emoji, &temp_id, None, event, request)
            .await
    }

    pub async fn reply(
        &self,
        conversation_id: &str,
        participants: &[String],
        text: &str,
        reply_to: &str,
    ) -> Result<SendOutcome, ChatError> {
        self.send_body(
            conversation_id,
            participants,
            text,
            Some(reply_to.to_string()),
            SubmitKind::Reply,
        )
        .await
    }

    /// Edit an already-confirmed message. The new text appears in the
    /// timeline immediately, keyed by the target's server id; if both
    /// transports fail the previous bodies are restored and the error is
    /// returned, leaving the original message intact for another attempt.
    pub async fn edit_message(
        &self,
        conversation_id: &str,
        participants: &[String],
        target_server_id: &str,
        new_text: &str,
    ) -> Result<SendOutcome, ChatError> {
        if new_text.trim().is_empty() {
            return Err(ChatError::Validation("edited body is empty".into()));
        }
        let target = self
            .timeline
            .message(conversation_id, target_server_id)
            .await
            .ok_or_else(|| {
                ChatError::Validation(format!("no message {target_server_id} to edit"))
            })?;
        if target.server_id.is_none() {
            return Err(ChatError::Validation(
                "cannot edit a message the server has not confirmed".into(),
            ));
        }

        let temp_id = Uuid::new_v4().to_string();
        let body = self
            .encrypt_for(conversation_id, participants, new_text)
            .await?;

        self.timeline
            .apply(TimelineEvent::EditApplied {
                conversation_id: conversation_id.to_string(),
                message_id: target_server_id.to_string(),
                plain_text: Some(new_text.to_string()),
                encrypted_body: Some(body.clone()),
            })
            .await;
        info!(
            target: "cove_core::dispatcher",
            conversation_id,
            message_id = %target_server_id,
            "optimistic edit started"
        );

        let event = OutboundEvent::EditMessage {
            client_temp_id: temp_id.clone(),
            conversation_id: conversation_id.to_string(),
            message_id: target_server_id.to_string(),
            body: body.clone(),
        };
        let request = SubmitMessageRequest {
            kind: SubmitKind::Edit,
            client_temp_id: temp_id.clone(),
            conversation_id: conversation_id.to_string(),
            body,
            participants: participants.to_vec(),
            reply_to: None,
            target_message_id: Some(target_server_id.to_string()),
        };

        match self.submit_with_fallback(event, request, &[]).await {
            Ok((server_id, created_at, via)) => {
                self.vault
                    .store_own_plaintext(
                        conversation_id,
                        target_server_id,
                        new_text,
                        self.engine.local_user_id(),
                    )
                    .await?;
                Ok(SendOutcome {
                    client_temp_id: temp_id,
                    server_id,
                    created_at,
                    via,
                })
            }
            Err(e) => {
                self.timeline
                    .apply(TimelineEvent::EditApplied {
                        conversation_id: conversation_id.to_string(),
                        message_id: target_server_id.to_string(),
                        plain_text: target.plain_text,
                        encrypted_body: target.encrypted_body,
                    })
                    .await;
                warn!(
                    target: "cove_core::dispatcher",
                    conversation_id,
                    message_id = %target_server_id,
                    error = %e,
                    "edit failed, previous text restored"
                );
                Err(ChatError::Transport(e))
            }
        }
    }

    /// Media always goes over REST: socket acks cannot carry multipart
    /// uploads. The optimistic entry still appears immediately.
    pub async fn send_media(
        &self,
        conversation_id: &str,
        participants: &[String],
        caption: &str,
        media: Vec<MediaUpload>,
    ) -> Result<SendOutcome, ChatError> {
        if media.is_empty() {
            return Err(ChatError::Validation("media send without attachments".into()));
        }
        // Caption-less media skips encryption, so the verification gate
        // has to run here too.
        self.keys.require_verified(conversation_id)?;
        let temp_id = Uuid::new_v4().to_string();
        let body = if caption.trim().is_empty() {
            String::new()
        } else {
            self.encrypt_for(conversation_id, participants, caption)
                .await?
        };

        self.insert_optimistic(conversation_id, participants, &temp_id, caption, &body, None)
            .await;
        info!(
            target: "cove_core::dispatcher",
            conversation_id,
            client_temp_id = %temp_id,
            attachments = media.len(),
            "optimistic media send started"
        );

        let request = SubmitMessageRequest {
            kind: SubmitKind::Send,
            client_temp_id: temp_id.clone(),
            conversation_id: conversation_id.to_string(),
            body,
            participants: participants.to_vec(),
            reply_to: None,
            target_message_id: None,
        };
        match self.rest.submit(&request, &media).await {
            Ok(response) => {
                self.settle_confirmed(
                    conversation_id,
                    &temp_id,
                    &response.message_id,
                    response.created_at,
                    caption,
                )
                .await?;
                // The response carries the server-assigned storage refs.
                if let Some(entry) = self.timeline.message(conversation_id, &temp_id).await {
                    self.timeline
                        .apply(TimelineEvent::ServerMessage(Message {
                            media: response.media.clone(),
                            ..entry
                        }))
                        .await;
                }
                Ok(SendOutcome {
                    client_temp_id: temp_id,
                    server_id: response.message_id,
                    created_at: response.created_at,
                    via: SendPath::Rest,
                })
            }
            Err(e) => {
                self.settle_failed(conversation_id, &temp_id, &e.to_string())
                    .await;
                Err(ChatError::Transport(e))
            }
        }
    }

    /// Resend a failed entry under its original temp id. The server
    /// deduplicates on that id, so a retry can never double-post.
    pub async fn retry(
        &self,
        conversation_id: &str,
        client_temp_id: &str,
    ) -> Result<SendOutcome, ChatError> {
        let msg = self
            .timeline
            .message(conversation_id, client_temp_id)
            .await
            .ok_or_else(|| {
                ChatError::Validation(format!("no message {client_temp_id} to retry"))
            })?;
        if msg.status != MessageStatus::Failed {
            return Err(ChatError::Validation(format!(
                "message {client_temp_id} is not in a failed state"
            )));
        }
        let text = msg.plain_text.clone().ok_or_else(|| {
            ChatError::Validation("failed entry lost its plaintext".into())
        })?;

        self.timeline
            .apply(TimelineEvent::RetryStarted {
                conversation_id: conversation_id.to_string(),
                client_temp_id: client_temp_id.to_string(),
            })
            .await;

        // Fresh encryption, same identity.
        let body = self
            .encrypt_for(conversation_id, &msg.participants, &text)
            .await?;
        let event = OutboundEvent::SendMessage {
            client_temp_id: client_temp_id.to_string(),
            conversation_id: conversation_id.to_string(),
            body: body.clone(),
            participants: msg.participants.clone(),
            reply_to: msg.reply_to.clone(),
        };
        let request = SubmitMessageRequest {
            kind: SubmitKind::Send,
            client_temp_id: client_temp_id.to_string(),
            conversation_id: conversation_id.to_string(),
            body,
            participants: msg.participants.clone(),
            reply_to: msg.reply_to.clone(),
            target_message_id: None,
        };
        self.dispatch_prepared(conversation_id, client_temp_id, &text, event, request)
            .await
    }

    /// Discard a failed entry. Confirmed or in-flight entries are kept.
    pub async fn remove_failed(&self, conversation_id: &str, client_temp_id: &str) {
        self.timeline
            .apply(TimelineEvent::RemoveFailed {
                conversation_id: conversation_id.to_string(),
                client_temp_id: client_temp_id.to_string(),
            })
            .await;
    }

    /// Fire-and-forget read receipts.
    pub async fn mark_read(
        &self,
        conversation_id: &str,
        message_ids: Vec<String>,
    ) -> Result<(), ChatError> {
        self.socket
            .emit(OutboundEvent::MessageRead {
                conversation_id: conversation_id.to_string(),
                message_ids,
            })
            .await?;
        Ok(())
    }

    /// Fire-and-forget typing indicator.
    pub async fn set_typing(&self, conversation_id: &str, typing: bool) -> Result<(), ChatError> {
        self.socket
            .emit(OutboundEvent::Typing {
                conversation_id: conversation_id.to_string(),
                typing,
            })
            .await?;
        Ok(())
    }

    pub async fn add_reaction(
        &self,
        conversation_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<(), ChatError> {
        self.socket
            .emit(OutboundEvent::AddReaction {
                conversation_id: conversation_id.to_string(),
                message_id: message_id.to_string(),
                emoji: emoji.to_string(),
            })
            .await?;
        Ok(())
    }

    pub async fn remove_reaction(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<(), ChatError> {
        self.socket
            .emit(OutboundEvent::RemoveReaction {
                conversation_id: conversation_id.to_string(),
                message_id: message_id.to_string(),
            })
            .await?;
        Ok(())
    }

    // ── Pipeline internals ───────────────────────────────────────────────────

    async fn send_body(
        &self,
        conversation_id: &str,
        participants: &[String],
        text: &str,
        reply_to: Option<String>,
        kind: SubmitKind,
    ) -> Result<SendOutcome, ChatError> {
        if text.trim().is_empty() {
            return Err(ChatError::Validation("message body is empty".into()));
        }
        let temp_id = Uuid::new_v4().to_string();
        let body = self
            .encrypt_for(conversation_id, participants, text)
            .await?;

        let event = match reply_to {
            Some(ref reply_to) if kind == SubmitKind::Reply => OutboundEvent::ReplyMessage {
                client_temp_id: temp_id.clone(),
                conversation_id: conversation_id.to_string(),
                body: body.clone(),
                participants: participants.to_vec(),
                reply_to: reply_to.clone(),
            },
            _ => OutboundEvent::SendMessage {
                client_temp_id: temp_id.clone(),
                conversation_id: conversation_id.to_string(),
                body: body.clone(),
                participants: participants.to_vec(),
                reply_to: reply_to.clone(),
            },
        };
        let request = SubmitMessageRequest {
            kind,
            client_temp_id: temp_id.clone(),
            conversation_id: conversation_id.to_string(),
            body,
            participants: participants.to_vec(),
            reply_to: reply_to.clone(),
            target_message_id: None,
        };
        self.dispatch(conversation_id, participants, text, &temp_id, reply_to, event, request)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        conversation_id: &str,
        participants: &[String],
        text: &str,
        temp_id: &str,
        reply_to: Option<String>,
        event: OutboundEvent,
        request: SubmitMessageRequest,
    ) -> Result<SendOutcome, ChatError> {
        self.insert_optimistic(
            conversation_id,
            participants,
            temp_id,
            text,
            &request.body,
            reply_to,
        )
        .await;
        info!(
            target: "cove_core::dispatcher",
            conversation_id,
            client_temp_id = %temp_id,
            event = event.name(),
            "optimistic send started"
        );
        self.dispatch_prepared(conversation_id, temp_id, text, event, request)
            .await
    }

    /// Socket-first submission for an entry already present in the timeline.
    async fn dispatch_prepared(
        &self,
        conversation_id: &str,
        temp_id: &str,
        text: &str,
        event: OutboundEvent,
        request: SubmitMessageRequest,
    ) -> Result<SendOutcome, ChatError> {
        match self.submit_with_fallback(event, request, &[]).await {
            Ok((server_id, created_at, via)) => {
                self.settle_confirmed(conversation_id, temp_id, &server_id, created_at, text)
                    .await?;
                Ok(SendOutcome {
                    client_temp_id: temp_id.to_string(),
                    server_id,
                    created_at,
                    via,
                })
            }
            Err(e) => {
                self.settle_failed(conversation_id, temp_id, &e.to_string())
                    .await;
                Err(ChatError::Transport(e))
            }
        }
    }

    /// Socket with a bounded ack wait, then REST with the same temp id.
    async fn submit_with_fallback(
        &self,
        event: OutboundEvent,
        request: SubmitMessageRequest,
        media: &[MediaUpload],
    ) -> Result<(String, DateTime<Utc>, SendPath), TransportError> {
        if self.socket.is_connected() {
            match tokio::time::timeout(self.config.ack_timeout, self.socket.emit_with_ack(event))
                .await
            {
                Ok(Ok(value)) => {
                    let ack: SendAck = serde_json::from_value(value)
                        .map_err(|e| TransportError::Malformed(e.to_string()))?;
                    return Ok((ack.message_id, ack.created_at, SendPath::Socket));
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "cove_core::dispatcher",
                        client_temp_id = %request.client_temp_id,
                        error = %e,
                        "socket submission failed, falling back to rest"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "cove_core::dispatcher",
                        client_temp_id = %request.client_temp_id,
                        timeout_ms = self.config.ack_timeout.as_millis() as u64,
                        "socket ack timed out, falling back to rest"
                    );
                }
            }
        }
        let response = self.rest.submit(&request, media).await?;
        Ok((response.message_id, response.created_at, SendPath::Rest))
    }

    async fn encrypt_for(
        &self,
        conversation_id: &str,
        participants: &[String],
        text: &str,
    ) -> Result<String, ChatError> {
        // A conversation whose key the server disputes stays blocked until
        // a later verification passes.
        self.keys.require_verified(conversation_id)?;
        let recipient = participants
            .iter()
            .find(|p| p.as_str() != self.engine.local_user_id())
            .ok_or_else(|| ChatError::Validation("no recipient in participant list".into()))?;

        self.keys.ensure_local_keys(conversation_id).await?;
        match self.engine.encrypt(conversation_id, recipient, text).await {
            // Peer key not cached yet: fetch once and retry. If the server
            // has no key for the peer either, degrade to the
            // backend-delegated scheme rather than blocking the send.
            Err(ChatError::PeerKeyUnavailable { .. }) => {
                match self.keys.fetch_peer_key(conversation_id, recipient).await {
                    Ok(_) => self.engine.encrypt(conversation_id, recipient, text).await,
                    Err(ChatError::PeerKeyUnavailable { .. }) => {
                        warn!(
                            target: "cove_core::dispatcher",
                            conversation_id,
                            recipient = %recipient,
                            "peer key unavailable, degrading to backend-delegated encryption"
                        );
                        Ok(EncryptedPayload::BackendDelegated {
                            plaintext: text.to_string(),
                        }
                        .to_wire())
                    }
                    Err(e) => Err(e),
                }
            }
            other => other,
        }
    }

    async fn insert_optimistic(
        &self,
        conversation_id: &str,
        participants: &[String],
        temp_id: &str,
        text: &str,
        body: &str,
        reply_to: Option<String>,
    ) {
        let now = Utc::now();
        self.timeline
            .apply(TimelineEvent::OptimisticInsert(Message {
                server_id: None,
                client_temp_id: temp_id.to_string(),
                conversation_id: conversation_id.to_string(),
                sender_id: self.engine.local_user_id().to_string(),
                participants: participants.to_vec(),
                encrypted_body: Some(body.to_string()),
                plain_text: Some(text.to_string()),
                status: MessageStatus::Sending,
                read_by: BTreeMap::new(),
                reactions: BTreeMap::new(),
                media: Vec::new(),
                reply_to,
                deleted: false,
                created_at: now,
                updated_at: now,
            }))
            .await;
    }

    async fn settle_confirmed(
        &self,
        conversation_id: &str,
        temp_id: &str,
        server_id: &str,
        created_at: DateTime<Utc>,
        text: &str,
    ) -> Result<(), ChatError> {
        self.timeline
            .apply(TimelineEvent::AckConfirmed {
                conversation_id: conversation_id.to_string(),
                client_temp_id: temp_id.to_string(),
                server_id: server_id.to_string(),
                created_at,
            })
            .await;
        if !text.is_empty() {
            self.vault
                .store_own_plaintext(conversation_id, server_id, text, self.engine.local_user_id())
                .await?;
        }
        info!(
            target: "cove_core::dispatcher",
            conversation_id,
            client_temp_id = %temp_id,
            server_id = %server_id,
            "send confirmed"
        );
        Ok(())
    }

    async fn settle_failed(&self, conversation_id: &str, temp_id: &str, reason: &str) {
        self.timeline
            .apply(TimelineEvent::SendFailed {
                conversation_id: conversation_id.to_string(),
                client_temp_id: temp_id.to_string(),
                reason: reason.to_string(),
            })
            .await;
        warn!(
            target: "cove_core::dispatcher",
            conversation_id,
            client_temp_id = %temp_id,
            reason,
            "send failed after socket and rest attempts"
        );
    }
}

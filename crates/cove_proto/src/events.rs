//! Socket event vocabulary.
//!
//! The wire names are fixed by the server; serde renames map them onto the
//! closed enums here so no call site ever matches on a raw string.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::MediaItem;

/// A server-confirmed message as it arrives over the socket or in a
/// history page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub id: String,
    /// Present when this envelope confirms one of our own optimistic sends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_temp_id: Option<String>,
    pub conversation_id: String,
    pub sender_id: String,
    pub participants: Vec<String>,
    /// Wire-format encrypted body.
    pub body: String,
    #[serde(default)]
    pub media: Vec<MediaItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Positive acknowledgment for a socket-submitted send/edit/reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendAck {
    pub client_temp_id: String,
    pub message_id: String,
    pub created_at: DateTime<Utc>,
}

/// Negative acknowledgment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendNack {
    pub client_temp_id: String,
    pub reason: String,
}

/// Events the client consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum InboundEvent {
    ReceiveMessage(MessageEnvelope),
    MessageStatus {
        conversation_id: String,
        message_id: String,
        status: crate::message::MessageStatus,
    },
    MessagesRead {
        conversation_id: String,
        user_id: String,
        message_ids: Vec<String>,
        read_at: DateTime<Utc>,
    },
    MessageDeleted {
        conversation_id: String,
        message_id: String,
    },
    ReactionUpdate {
        conversation_id: String,
        message_id: String,
        user_id: String,
        /// `None` clears the user's reaction.
        emoji: Option<String>,
    },
    ReactionSuccess {
        conversation_id: String,
        message_id: String,
    },
    ReactionError {
        conversation_id: String,
        message_id: String,
        reason: String,
    },
    Typing {
        conversation_id: String,
        user_id: String,
        typing: bool,
    },
    #[serde(rename = "conversation_updated")]
    ConversationUpdated { conversation_id: String },
    SendMessageSuccess(SendAck),
    SendMessageError(SendNack),
    EditMessageSuccess(SendAck),
    EditMessageError(SendNack),
    ReplyMessageSuccess(SendAck),
    ReplyMessageError(SendNack),
}

/// Coarse topic for subscription routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Messages,
    Receipts,
    Reactions,
    Typing,
    Conversation,
    Acks,
}

impl InboundEvent {
    pub fn topic(&self) -> Topic {
        match self {
            InboundEvent::ReceiveMessage(_) | InboundEvent::MessageDeleted { .. } => {
                Topic::Messages
            }
            InboundEvent::MessageStatus { .. } | InboundEvent::MessagesRead { .. } => {
                Topic::Receipts
            }
            InboundEvent::ReactionUpdate { .. }
            | InboundEvent::ReactionSuccess { .. }
            | InboundEvent::ReactionError { .. } => Topic::Reactions,
            InboundEvent::Typing { .. } => Topic::Typing,
            InboundEvent::ConversationUpdated { .. } => Topic::Conversation,
            InboundEvent::SendMessageSuccess(_)
            | InboundEvent::SendMessageError(_)
            | InboundEvent::EditMessageSuccess(_)
            | InboundEvent::EditMessageError(_)
            | InboundEvent::ReplyMessageSuccess(_)
            | InboundEvent::ReplyMessageError(_) => Topic::Acks,
        }
    }
}

/// Events the client emits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum OutboundEvent {
    SendMessage {
        client_temp_id: String,
        conversation_id: String,
        body: String,
        participants: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
    },
    SendEmoji {
        client_temp_id: String,
        conversation_id: String,
        body: String,
        participants: Vec<String>,
    },
    EditMessage {
        client_temp_id: String,
        conversation_id: String,
        message_id: String,
        body: String,
    },
    ReplyMessage {
        client_temp_id: String,
        conversation_id: String,
        body: String,
        participants: Vec<String>,
        reply_to: String,
    },
    AddReaction {
        conversation_id: String,
        message_id: String,
        emoji: String,
    },
    RemoveReaction {
        conversation_id: String,
        message_id: String,
    },
    MessageRead {
        conversation_id: String,
        message_ids: Vec<String>,
    },
    Typing {
        conversation_id: String,
        typing: bool,
    },
    JoinRoom { conversation_id: String },
    LeaveRoom { conversation_id: String },
    /// Asks the server to compare its stored key for (conversation, user)
    /// against the supplied one. Ack payload: `{"verified": bool}`.
    VerifyKey {
        conversation_id: String,
        public_key: String,
    },
}

impl OutboundEvent {
    /// Wire name of this event, as the server knows it.
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::SendMessage { .. } => "sendMessage",
            OutboundEvent::SendEmoji { .. } => "sendEmoji",
            OutboundEvent::EditMessage { .. } => "editMessage",
            OutboundEvent::ReplyMessage { .. } => "replyMessage",
            OutboundEvent::AddReaction { .. } => "addReaction",
            OutboundEvent::RemoveReaction { .. } => "removeReaction",
            OutboundEvent::MessageRead { .. } => "messageRead",
            OutboundEvent::Typing { .. } => "typing",
            OutboundEvent::JoinRoom { .. } => "joinRoom",
            OutboundEvent::LeaveRoom { .. } => "leaveRoom",
            OutboundEvent::VerifyKey { .. } => "verifyKey",
        }
    }
}

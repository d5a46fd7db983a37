//! REST request/response types — the fallback and multipart path.
//! These map directly to JSON bodies on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::MessageEnvelope;
use crate::message::MediaItem;

/// What kind of submission a REST fallback carries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubmitKind {
    Send,
    Edit,
    Reply,
}

/// Message submission. The `client_temp_id` is the idempotency key: a socket
/// attempt and its REST fallback carry the same value, and the server must
/// reconcile them to one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitMessageRequest {
    pub kind: SubmitKind,
    pub client_temp_id: String,
    pub conversation_id: String,
    pub body: String,
    pub participants: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Only for `kind = Edit`: the server id of the message being edited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_message_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitMessageResponse {
    pub message_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub media: Vec<MediaItem>,
}

/// Raw bytes for one multipart media part.
#[derive(Debug, Clone)]
pub struct MediaUpload {
    pub filename: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// A page of message history, newest-first from the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage {
    pub messages: Vec<MessageEnvelope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

// ── Key exchange ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishKeyRequest {
    pub conversation_id: String,
    pub user_id: String,
    /// base64url X25519 public key.
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchKeyResponse {
    pub conversation_id: String,
    pub user_id: String,
    pub public_key: String,
    /// Server-side rotation counter; informational.
    #[serde(default)]
    pub key_version: u64,
}

/// Ack payload of the `verifyKey` socket round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyKeyAck {
    pub verified: bool,
}

//! In-memory transports with scripted behaviour.
//!
//! Deterministic doubles for the send pipeline and reconciliation tests:
//! no network, no real sockets, virtualised acks. The socket honours the
//! trait contract that a silent server simply never resolves the ack
//! future — the caller's timeout is what fires.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use cove_proto::api::{
    FetchKeyResponse, HistoryPage, MediaUpload, PublishKeyRequest, SubmitMessageRequest,
    SubmitMessageResponse, VerifyKeyAck,
};
use cove_proto::events::{InboundEvent, OutboundEvent, SendAck, Topic};

use super::{EventBus, RestTransport, SocketTransport, Subscription, TransportError};

/// How the fake server answers a socket submission.
#[derive(Debug, Clone)]
pub enum AckBehavior {
    /// Ack with a fresh server id.
    Ack,
    /// Error ack with the given reason.
    Reject(String),
    /// Never answer; the caller's timeout fires.
    Silent,
}

pub struct MemorySocket {
    connected: AtomicBool,
    bus: EventBus,
    ack_behavior: Mutex<AckBehavior>,
    verify_result: AtomicBool,
    next_id: AtomicU64,
    emitted: Mutex<Vec<OutboundEvent>>,
}

impl Default for MemorySocket {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySocket {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            bus: EventBus::new(),
            ack_behavior: Mutex::new(AckBehavior::Ack),
            verify_result: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            emitted: Mutex::new(Vec::new()),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_ack_behavior(&self, behavior: AckBehavior) {
        *self.ack_behavior.lock().expect("ack behavior lock") = behavior;
    }

    /// Scripted answer for `verifyKey` round-trips.
    pub fn set_verify_result(&self, verified: bool) {
        self.verify_result.store(verified, Ordering::SeqCst);
    }

    /// Inject an inbound server event, as if it arrived on the wire.
    pub fn push_inbound(&self, event: InboundEvent) {
        self.bus.publish(event);
    }

    pub fn emitted(&self) -> Vec<OutboundEvent> {
        self.emitted.lock().expect("emitted lock").clone()
    }

    fn client_temp_id(event: &OutboundEvent) -> Option<String> {
        match event {
            OutboundEvent::SendMessage { client_temp_id, .. }
            | OutboundEvent::SendEmoji { client_temp_id, .. }
            | OutboundEvent::EditMessage { client_temp_id, .. }
            | OutboundEvent::ReplyMessage { client_temp_id, .. } => Some(client_temp_id.clone()),
            _ => None,
        }
    }
}

#[async_trait]
impl SocketTransport for MemorySocket {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn emit(&self, event: OutboundEvent) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        self.emitted.lock().expect("emitted lock").push(event);
        Ok(())
    }

    async fn emit_with_ack(
        &self,
        event: OutboundEvent,
    ) -> Result<serde_json::Value, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        let temp_id = Self::client_temp_id(&event);
        self.emitted.lock().expect("emitted lock").push(event.clone());

        if matches!(event, OutboundEvent::VerifyKey { .. }) {
            let ack = VerifyKeyAck {
                verified: self.verify_result.load(Ordering::SeqCst),
            };
            return serde_json::to_value(ack)
                .map_err(|e| TransportError::Malformed(e.to_string()));
        }

        let behavior = self.ack_behavior.lock().expect("ack behavior lock").clone();
        match behavior {
            AckBehavior::Ack => {
                let n = self.next_id.fetch_add(1, Ordering::SeqCst);
                let ack = SendAck {
                    client_temp_id: temp_id.unwrap_or_default(),
                    message_id: format!("srv-sock-{n}"),
                    created_at: Utc::now(),
                };
                serde_json::to_value(ack).map_err(|e| TransportError::Malformed(e.to_string()))
            }
            AckBehavior::Reject(reason) => Err(TransportError::Rejected(reason)),
            AckBehavior::Silent => std::future::pending().await,
        }
    }

    fn subscribe(&self, topics: &[Topic]) -> Subscription {
        self.bus.subscribe(topics)
    }
}

// ── REST double ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum RestBehavior {
    Succeed,
    Fail(String),
}

pub struct MemoryRest {
    behavior: Mutex<RestBehavior>,
    next_id: AtomicU64,
    submissions: Mutex<Vec<(SubmitMessageRequest, usize)>>,
    published_keys: Mutex<HashMap<(String, String), String>>,
    history: Mutex<Vec<HistoryPage>>,
    /// Peers whose key fetch should fail, simulating an unpublished key.
    unavailable_peers: Mutex<Vec<String>>,
}

impl Default for MemoryRest {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRest {
    pub fn new() -> Self {
        Self {
            behavior: Mutex::new(RestBehavior::Succeed),
            next_id: AtomicU64::new(1),
            submissions: Mutex::new(Vec::new()),
            published_keys: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
            unavailable_peers: Mutex::new(Vec::new()),
        }
    }

    pub fn set_behavior(&self, behavior: RestBehavior) {
        *self.behavior.lock().expect("behavior lock") = behavior;
    }

    pub fn submissions(&self) -> Vec<(SubmitMessageRequest, usize)> {
        self.submissions.lock().expect("submissions lock").clone()
    }

    pub fn published_key(&self, conversation_id: &str, user_id: &str) -> Option<String> {
        self.published_keys
            .lock()
            .expect("keys lock")
            .get(&(conversation_id.to_string(), user_id.to_string()))
            .cloned()
    }

    /// Pre-register a peer's public key so `fetch_public_key` can serve it.
    pub fn seed_peer_key(&self, conversation_id: &str, user_id: &str, public_key: &str) {
        self.published_keys.lock().expect("keys lock").insert(
            (conversation_id.to_string(), user_id.to_string()),
            public_key.to_string(),
        );
    }

    pub fn set_peer_unavailable(&self, user_id: &str) {
        self.unavailable_peers
            .lock()
            .expect("unavailable lock")
            .push(user_id.to_string());
    }

    pub fn queue_history(&self, page: HistoryPage) {
        self.history.lock().expect("history lock").push(page);
    }
}

#[async_trait]
impl RestTransport for MemoryRest {
    async fn submit(
        &self,
        request: &SubmitMessageRequest,
        media: &[MediaUpload],
    ) -> Result<SubmitMessageResponse, TransportError> {
        self.submissions
            .lock()
            .expect("submissions lock")
            .push((request.clone(), media.len()));

        let behavior = self.behavior.lock().expect("behavior lock").clone();
        match behavior {
            RestBehavior::Succeed => {
                let n = self.next_id.fetch_add(1, Ordering::SeqCst);
                Ok(SubmitMessageResponse {
                    message_id: format!("srv-rest-{n}"),
                    created_at: Utc::now(),
                    media: media
                        .iter()
                        .map(|m| cove_proto::message::MediaItem {
                            filename: m.filename.clone(),
                            mime_type: m.mime_type.clone(),
                            size_bytes: m.bytes.len() as u64,
                            storage_ref: format!("stored/{}", m.filename),
                        })
                        .collect(),
                })
            }
            RestBehavior::Fail(reason) => Err(TransportError::Http(reason)),
        }
    }

    async fn fetch_history(
        &self,
        _conversation_id: &str,
        _cursor: Option<&str>,
        _limit: u32,
    ) -> Result<HistoryPage, TransportError> {
        let mut history = self.history.lock().expect("history lock");
        if history.is_empty() {
            return Ok(HistoryPage {
                messages: Vec::new(),
                next_cursor: None,
            });
        }
        Ok(history.remove(0))
    }

    async fn publish_public_key(
        &self,
        request: &PublishKeyRequest,
    ) -> Result<(), TransportError> {
        self.published_keys.lock().expect("keys lock").insert(
            (request.conversation_id.clone(), request.user_id.clone()),
            request.public_key.clone(),
        );
        Ok(())
    }

    async fn fetch_public_key(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<FetchKeyResponse, TransportError> {
        if self
            .unavailable_peers
            .lock()
            .expect("unavailable lock")
            .iter()
            .any(|p| p == user_id)
        {
            return Err(TransportError::Http(format!("404: no key for {user_id}")));
        }
        let keys = self.published_keys.lock().expect("keys lock");
        match keys.get(&(conversation_id.to_string(), user_id.to_string())) {
            Some(public_key) => Ok(FetchKeyResponse {
                conversation_id: conversation_id.to_string(),
                user_id: user_id.to_string(),
                public_key: public_key.clone(),
                key_version: 1,
            }),
            None => Err(TransportError::Http(format!("404: no key for {user_id}"))),
        }
    }
}

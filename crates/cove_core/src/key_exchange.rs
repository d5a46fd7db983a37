//! Key lifecycle against the backend: generate, publish, fetch, verify.
//!
//! The backend is a bulletin board for public halves only. Secret material
//! is generated locally, persisted encrypted, and never serialized into a
//! request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use cove_crypto::keys::{ConversationKeyPair, PublicKeyBytes};
use cove_proto::api::{PublishKeyRequest, VerifyKeyAck};
use cove_proto::events::OutboundEvent;
use cove_store::KeyStore;

use crate::error::ChatError;
use crate::transport::{RestTransport, SocketTransport, TransportError};

#[derive(Clone)]
pub struct KeyExchangeClient {
    key_store: KeyStore,
    rest: Arc<dyn RestTransport>,
    socket: Arc<dyn SocketTransport>,
    local_user_id: String,
    // Conversations whose last server verification failed, with the
    // remediation hint. Sends stay blocked until a verification passes.
    unverified: Arc<Mutex<HashMap<String, String>>>,
}

impl KeyExchangeClient {
    pub fn new(
        key_store: KeyStore,
        rest: Arc<dyn RestTransport>,
        socket: Arc<dyn SocketTransport>,
        local_user_id: String,
    ) -> Self {
        Self {
            key_store,
            rest,
            socket,
            local_user_id,
            unverified: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Error out if the conversation's last server verification failed.
    pub fn require_verified(&self, conversation_id: &str) -> Result<(), ChatError> {
        let unverified = self.unverified.lock().expect("verification lock poisoned");
        match unverified.get(conversation_id) {
            Some(remediation) => Err(ChatError::KeyUnverified {
                conversation_id: conversation_id.to_string(),
                remediation: remediation.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Generate and persist a fresh key pair for the conversation.
    /// Overwrites any existing pair: messages encrypted to the old key
    /// become permanently undecryptable. The public half still needs to be
    /// published via [`Self::exchange_public_key`].
    pub async fn generate_key_pair(
        &self,
        conversation_id: &str,
    ) -> Result<PublicKeyBytes, ChatError> {
        let pair = ConversationKeyPair::generate();
        self.key_store
            .store_private_key(conversation_id, &self.local_user_id, &pair)
            .await?;
        self.key_store
            .store_user_public_key(conversation_id, &self.local_user_id, &pair.public)
            .await?;
        info!(
            target: "cove_core::key_exchange",
            conversation_id,
            fingerprint = %pair.public.fingerprint(),
            "generated conversation key pair"
        );
        Ok(pair.public.clone())
    }

    /// Publish our stored public half to the backend, keyed by
    /// (conversation, user). Idempotent overwrite on the server side.
    pub async fn exchange_public_key(&self, conversation_id: &str) -> Result<(), ChatError> {
        let pair = self
            .key_store
            .get_private_key(conversation_id, &self.local_user_id)
            .await?
            .ok_or_else(|| ChatError::KeyMissing {
                conversation_id: conversation_id.to_string(),
            })?;
        self.rest
            .publish_public_key(&PublishKeyRequest {
                conversation_id: conversation_id.to_string(),
                user_id: self.local_user_id.clone(),
                public_key: pair.public_b64(),
            })
            .await?;
        Ok(())
    }

    /// Lazy generation: reuse the stored pair if one exists, otherwise
    /// generate and publish. Called on conversation entry and before the
    /// first send.
    pub async fn ensure_local_keys(
        &self,
        conversation_id: &str,
    ) -> Result<PublicKeyBytes, ChatError> {
        if let Some(pair) = self
            .key_store
            .get_private_key(conversation_id, &self.local_user_id)
            .await?
        {
            return Ok(pair.public.clone());
        }
        let public = self.generate_key_pair(conversation_id).await?;
        self.exchange_public_key(conversation_id).await?;
        Ok(public)
    }

    /// Fetch a peer's current public key from the server and cache it.
    /// The cached copy is invalidated first: a peer may have rotated keys
    /// from another device since we last looked.
    pub async fn fetch_peer_key(
        &self,
        conversation_id: &str,
        peer_user_id: &str,
    ) -> Result<PublicKeyBytes, ChatError> {
        self.key_store
            .invalidate_peer_key(conversation_id, peer_user_id)
            .await?;

        let response = self
            .rest
            .fetch_public_key(conversation_id, peer_user_id)
            .await
            .map_err(|e| match e {
                TransportError::Http(_) => ChatError::PeerKeyUnavailable {
                    conversation_id: conversation_id.to_string(),
                    peer_id: peer_user_id.to_string(),
                },
                other => ChatError::Transport(other),
            })?;

        let public = PublicKeyBytes::from_b64(&response.public_key)?;
        self.key_store
            .cache_peer_public_key(conversation_id, peer_user_id, public.clone())
            .await?;
        Ok(public)
    }

    /// Prepare a conversation for V2 sends: ensure our own pair exists and
    /// refresh every peer's public key. Fails on the first peer whose key
    /// the server does not have.
    pub async fn ensure_all_conversation_keys(
        &self,
        conversation_id: &str,
        participants: &[String],
    ) -> Result<(), ChatError> {
        self.ensure_local_keys(conversation_id).await?;
        for peer in participants {
            if peer == &self.local_user_id {
                continue;
            }
            self.fetch_peer_key(conversation_id, peer).await?;
        }
        Ok(())
    }

    /// Ask the server to confirm it holds the same public key we published.
    /// A mismatch blocks sending until the user regenerates.
    pub async fn verify_key_on_server(&self, conversation_id: &str) -> Result<(), ChatError> {
        let pair = self
            .key_store
            .get_private_key(conversation_id, &self.local_user_id)
            .await?
            .ok_or_else(|| ChatError::KeyMissing {
                conversation_id: conversation_id.to_string(),
            })?;

        let ack = self
            .socket
            .emit_with_ack(OutboundEvent::VerifyKey {
                conversation_id: conversation_id.to_string(),
                public_key: pair.public_b64(),
            })
            .await?;
        let ack: VerifyKeyAck = serde_json::from_value(ack)
            .map_err(|e| ChatError::Transport(TransportError::Malformed(e.to_string())))?;

        if !ack.verified {
            warn!(
                target: "cove_core::key_exchange",
                conversation_id,
                "server does not confirm local key, sends are blocked"
            );
            let remediation = format!(
                "regenerate the conversation key and compare fingerprints out of band \
                 (local: {})",
                pair.public.fingerprint()
            );
            self.unverified
                .lock()
                .expect("verification lock poisoned")
                .insert(conversation_id.to_string(), remediation.clone());
            return Err(ChatError::KeyUnverified {
                conversation_id: conversation_id.to_string(),
                remediation,
            });
        }
        self.unverified
            .lock()
            .expect("verification lock poisoned")
            .remove(conversation_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use cove_store::{backend::MemoryBackend, key_store::StoreKey};

    use super::*;
    use crate::transport::memory::{MemoryRest, MemorySocket};

    fn client(rest: Arc<MemoryRest>, socket: Arc<MemorySocket>) -> KeyExchangeClient {
        let store = KeyStore::new(Arc::new(MemoryBackend::new()), StoreKey::generate());
        KeyExchangeClient::new(store, rest, socket, "alice".into())
    }

    #[tokio::test]
    async fn generate_then_exchange_publishes_public_half() {
        let rest = Arc::new(MemoryRest::new());
        let client = client(rest.clone(), Arc::new(MemorySocket::new()));

        let public = client.generate_key_pair("c1").await.unwrap();
        assert!(rest.published_key("c1", "alice").is_none());

        client.exchange_public_key("c1").await.unwrap();
        assert_eq!(
            rest.published_key("c1", "alice").as_deref(),
            Some(public.to_b64().as_str())
        );
        assert!(client.key_store.has_keys("c1", "alice").await.unwrap());
    }

    #[tokio::test]
    async fn exchange_without_local_pair_is_an_error() {
        let client = client(Arc::new(MemoryRest::new()), Arc::new(MemorySocket::new()));
        let err = client.exchange_public_key("c1").await.unwrap_err();
        assert!(matches!(err, ChatError::KeyMissing { .. }));
    }

    #[tokio::test]
    async fn ensure_local_keys_is_idempotent() {
        let client = client(Arc::new(MemoryRest::new()), Arc::new(MemorySocket::new()));
        let first = client.ensure_local_keys("c1").await.unwrap();
        let second = client.ensure_local_keys("c1").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn fetch_replaces_stale_cached_peer_key() {
        let rest = Arc::new(MemoryRest::new());
        let client = client(rest.clone(), Arc::new(MemorySocket::new()));

        let old = ConversationKeyPair::generate();
        client
            .key_store
            .cache_peer_public_key("c1", "bob", old.public.clone())
            .await
            .unwrap();

        let rotated = ConversationKeyPair::generate();
        rest.seed_peer_key("c1", "bob", &rotated.public.to_b64());

        let fetched = client.fetch_peer_key("c1", "bob").await.unwrap();
        assert_eq!(fetched, rotated.public);
        assert_eq!(
            client.key_store.peer_public_key("c1", "bob").await.unwrap(),
            Some(rotated.public.clone())
        );
    }

    #[tokio::test]
    async fn missing_peer_key_maps_to_unavailable() {
        let rest = Arc::new(MemoryRest::new());
        rest.set_peer_unavailable("bob");
        let client = client(rest, Arc::new(MemorySocket::new()));

        let err = client.fetch_peer_key("c1", "bob").await.unwrap_err();
        assert!(matches!(
            err,
            ChatError::PeerKeyUnavailable { ref peer_id, .. } if peer_id == "bob"
        ));
    }

    #[tokio::test]
    async fn ensure_all_skips_self_and_fetches_peers() {
        let rest = Arc::new(MemoryRest::new());
        let peer = ConversationKeyPair::generate();
        rest.seed_peer_key("c1", "bob", &peer.public.to_b64());
        let client = client(rest, Arc::new(MemorySocket::new()));

        client
            .ensure_all_conversation_keys("c1", &["alice".into(), "bob".into()])
            .await
            .unwrap();
        assert!(client.key_store.has_keys("c1", "alice").await.unwrap());
        assert_eq!(
            client.key_store.peer_public_key("c1", "bob").await.unwrap(),
            Some(peer.public.clone())
        );
    }

    #[tokio::test]
    async fn unverified_key_blocks_with_fingerprint() {
        let socket = Arc::new(MemorySocket::new());
        socket.set_verify_result(false);
        let client = client(Arc::new(MemoryRest::new()), socket);

        let public = client.ensure_local_keys("c1").await.unwrap();
        let err = client.verify_key_on_server("c1").await.unwrap_err();
        match err {
            ChatError::KeyUnverified { remediation, .. } => {
                assert!(remediation.contains(&public.fingerprint()));
            }
            other => panic!("expected KeyUnverified, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn verified_key_passes() {
        let client = client(Arc::new(MemoryRest::new()), Arc::new(MemorySocket::new()));
        client.ensure_local_keys("c1").await.unwrap();
        client.verify_key_on_server("c1").await.unwrap();
    }
}

//! Durable store of per-(conversation, user) key pairs and cached peer
//! public keys, with an in-memory cache over the pluggable backend.
//!
//! Private key material is exposed only to the encryption engine and is
//! encrypted at rest with the store key. It is never serialized into a
//! network call.
//!
//! All mutation goes through one `RwLock` writer; socket callbacks and
//! UI-triggered handlers share this handle safely across threads.

use std::collections::HashMap;
use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use zeroize::ZeroizeOnDrop;

use cove_crypto::{aead, keys::ConversationKeyPair, keys::PublicKeyBytes};

use crate::{backend::KvBackend, error::StoreError};

const NS_PRIVATE: &str = "keys.private";
const NS_PUBLIC: &str = "keys.public";
const NS_PEER: &str = "keys.peer";
const AT_REST_AAD: &[u8] = b"cove-store-v1";

/// 32-byte key protecting sensitive values at rest. Zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct StoreKey(pub [u8; 32]);

impl StoreKey {
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self(key)
    }
}

/// Persisted form of a key pair: encrypted secret + clear public half.
#[derive(Serialize, Deserialize)]
struct StoredPair {
    secret_enc: String,
    public: String,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct Cache {
    /// (conversation, user) → persisted pair (secret still encrypted).
    pairs: HashMap<(String, String), String>,
    /// (conversation, peer) → public key.
    peers: HashMap<(String, String), PublicKeyBytes>,
}

/// Key store handle. Clone to share across tasks.
#[derive(Clone)]
pub struct KeyStore {
    backend: Arc<dyn KvBackend>,
    store_key: Arc<StoreKey>,
    cache: Arc<RwLock<Cache>>,
}

fn scope_key(conversation_id: &str, user_id: &str) -> String {
    format!("{conversation_id}:{user_id}")
}

impl KeyStore {
    pub fn new(backend: Arc<dyn KvBackend>, store_key: StoreKey) -> Self {
        Self {
            backend,
            store_key: Arc::new(store_key),
            cache: Arc::new(RwLock::new(Cache::default())),
        }
    }

    /// Whether a local key pair exists for this scope.
    pub async fn has_keys(&self, conversation_id: &str, user_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .load_pair_json(conversation_id, user_id)
            .await?
            .is_some())
    }

    /// Persist a key pair, overwriting any previous one for the scope.
    /// There is no rollback: ciphertexts addressed to the old key become
    /// permanently undecryptable.
    pub async fn store_private_key(
        &self,
        conversation_id: &str,
        user_id: &str,
        pair: &ConversationKeyPair,
    ) -> Result<(), StoreError> {
        let secret_ct = aead::xchacha_encrypt(&self.store_key.0, pair.secret_bytes(), AT_REST_AAD)?;
        let stored = StoredPair {
            secret_enc: URL_SAFE_NO_PAD.encode(secret_ct),
            public: pair.public_b64(),
            created_at: pair.created_at,
        };
        let json = serde_json::to_string(&stored)?;

        let key = scope_key(conversation_id, user_id);
        self.backend.put(NS_PRIVATE, &key, &json).await?;
        let mut cache = self.cache.write().await;
        cache
            .pairs
            .insert((conversation_id.to_string(), user_id.to_string()), json);
        Ok(())
    }

    /// Persist the local user's published public key (idempotent overwrite).
    pub async fn store_user_public_key(
        &self,
        conversation_id: &str,
        user_id: &str,
        public: &PublicKeyBytes,
    ) -> Result<(), StoreError> {
        self.backend
            .put(NS_PUBLIC, &scope_key(conversation_id, user_id), &public.to_b64())
            .await
    }

    /// Load the private key pair for a scope. Only the encryption engine
    /// should call this.
    pub async fn get_private_key(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Option<ConversationKeyPair>, StoreError> {
        let Some(json) = self.load_pair_json(conversation_id, user_id).await? else {
            return Ok(None);
        };
        let stored: StoredPair = serde_json::from_str(&json)?;
        let secret_ct = URL_SAFE_NO_PAD
            .decode(&stored.secret_enc)
            .map_err(cove_crypto::CryptoError::Base64Decode)?;
        let secret = aead::xchacha_decrypt(&self.store_key.0, &secret_ct, AT_REST_AAD)?;
        let pair = ConversationKeyPair::from_secret_bytes(&secret, stored.created_at)?;
        Ok(Some(pair))
    }

    /// Remove every key (own pairs, published publics, peer cache) for a
    /// conversation.
    pub async fn clear(&self, conversation_id: &str) -> Result<(), StoreError> {
        let prefix = format!("{conversation_id}:");
        self.backend.delete_prefix(NS_PRIVATE, &prefix).await?;
        self.backend.delete_prefix(NS_PUBLIC, &prefix).await?;
        self.backend.delete_prefix(NS_PEER, &prefix).await?;
        let mut cache = self.cache.write().await;
        cache.pairs.retain(|(conv, _), _| conv != conversation_id);
        cache.peers.retain(|(conv, _), _| conv != conversation_id);
        Ok(())
    }

    // ── Peer public-key cache ────────────────────────────────────────────────

    pub async fn cache_peer_public_key(
        &self,
        conversation_id: &str,
        peer_user_id: &str,
        public: PublicKeyBytes,
    ) -> Result<(), StoreError> {
        self.backend
            .put(NS_PEER, &scope_key(conversation_id, peer_user_id), &public.to_b64())
            .await?;
        let mut cache = self.cache.write().await;
        cache
            .peers
            .insert((conversation_id.to_string(), peer_user_id.to_string()), public);
        Ok(())
    }

    pub async fn peer_public_key(
        &self,
        conversation_id: &str,
        peer_user_id: &str,
    ) -> Result<Option<PublicKeyBytes>, StoreError> {
        {
            let cache = self.cache.read().await;
            if let Some(public) = cache
                .peers
                .get(&(conversation_id.to_string(), peer_user_id.to_string()))
            {
                return Ok(Some(public.clone()));
            }
        }
        let Some(b64) = self
            .backend
            .get(NS_PEER, &scope_key(conversation_id, peer_user_id))
            .await?
        else {
            return Ok(None);
        };
        let public = PublicKeyBytes::from_b64(&b64)?;
        let mut cache = self.cache.write().await;
        cache
            .peers
            .insert((conversation_id.to_string(), peer_user_id.to_string()), public.clone());
        Ok(Some(public))
    }

    /// Drop a cached peer key. Called before every refetch on conversation
    /// entry: a peer may have rotated keys elsewhere, and a stale entry
    /// causes silent undecryptable sends.
    pub async fn invalidate_peer_key(
        &self,
        conversation_id: &str,
        peer_user_id: &str,
    ) -> Result<(), StoreError> {
        self.backend
            .delete(NS_PEER, &scope_key(conversation_id, peer_user_id))
            .await?;
        let mut cache = self.cache.write().await;
        cache
            .peers
            .remove(&(conversation_id.to_string(), peer_user_id.to_string()));
        Ok(())
    }

    async fn load_pair_json(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Option<String>, StoreError> {
        {
            let cache = self.cache.read().await;
            if let Some(json) = cache
                .pairs
                .get(&(conversation_id.to_string(), user_id.to_string()))
            {
                return Ok(Some(json.clone()));
            }
        }
        let json = self
            .backend
            .get(NS_PRIVATE, &scope_key(conversation_id, user_id))
            .await?;
        if let Some(ref json) = json {
            let mut cache = self.cache.write().await;
            cache
                .pairs
                .insert((conversation_id.to_string(), user_id.to_string()), json.clone());
        }
        Ok(json)
    }
}

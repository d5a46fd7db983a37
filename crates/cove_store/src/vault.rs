//! Own-message plaintext vault.
//!
//! An ECDH-V2 ciphertext is addressed to the recipient's key material, so
//! the sender cannot decrypt its own messages. The plaintext of every
//! confirmed outgoing message is kept here instead, keyed by the
//! server-assigned id — never the client temp id, which is discarded after
//! reconciliation.
//!
//! This exists purely as a consequence of ECDH-V2's asymmetry; it is not a
//! general message cache.

use std::collections::HashMap;
use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use tokio::sync::RwLock;

use cove_crypto::aead;

use crate::{backend::KvBackend, error::StoreError, key_store::StoreKey};

const NS_VAULT: &str = "vault.own";
const AT_REST_AAD: &[u8] = b"cove-vault-v1";

#[derive(Clone)]
pub struct OwnMessageVault {
    backend: Arc<dyn KvBackend>,
    store_key: Arc<StoreKey>,
    cache: Arc<RwLock<HashMap<String, String>>>,
}

fn entry_key(conversation_id: &str, user_id: &str, message_id: &str) -> String {
    format!("{conversation_id}:{user_id}:{message_id}")
}

impl OwnMessageVault {
    pub fn new(backend: Arc<dyn KvBackend>, store_key: StoreKey) -> Self {
        Self {
            backend,
            store_key: Arc::new(store_key),
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Store the plaintext of a confirmed outgoing message. `message_id`
    /// must be the server-assigned id.
    pub async fn store_own_plaintext(
        &self,
        conversation_id: &str,
        message_id: &str,
        plaintext: &str,
        user_id: &str,
    ) -> Result<(), StoreError> {
        let ct = aead::xchacha_encrypt(&self.store_key.0, plaintext.as_bytes(), AT_REST_AAD)?;
        let key = entry_key(conversation_id, user_id, message_id);
        self.backend
            .put(NS_VAULT, &key, &URL_SAFE_NO_PAD.encode(ct))
            .await?;
        let mut cache = self.cache.write().await;
        cache.insert(key, plaintext.to_string());
        Ok(())
    }

    /// Look up the plaintext of one of the local user's own messages.
    pub async fn own_plaintext(
        &self,
        conversation_id: &str,
        message_id: &str,
        user_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let key = entry_key(conversation_id, user_id, message_id);
        {
            let cache = self.cache.read().await;
            if let Some(text) = cache.get(&key) {
                return Ok(Some(text.clone()));
            }
        }
        let Some(b64) = self.backend.get(NS_VAULT, &key).await? else {
            return Ok(None);
        };
        let ct = URL_SAFE_NO_PAD
            .decode(&b64)
            .map_err(cove_crypto::CryptoError::Base64Decode)?;
        let plaintext = aead::xchacha_decrypt(&self.store_key.0, &ct, AT_REST_AAD)?;
        let text = String::from_utf8(plaintext.to_vec())
            .map_err(|_| StoreError::NotFound(format!("vault entry {key} is not UTF-8")))?;
        let mut cache = self.cache.write().await;
        cache.insert(key, text.clone());
        Ok(Some(text))
    }

    /// Drop all vault entries for a conversation (e.g. on local wipe).
    pub async fn clear(&self, conversation_id: &str) -> Result<(), StoreError> {
        self.backend
            .delete_prefix(NS_VAULT, &format!("{conversation_id}:"))
            .await?;
        let mut cache = self.cache.write().await;
        cache.retain(|k, _| !k.starts_with(&format!("{conversation_id}:")));
        Ok(())
    }
}

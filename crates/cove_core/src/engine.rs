//! The encryption engine: the one place that turns plaintext into wire
//! bodies and back.
//!
//! Callers never pick a cipher. Outgoing messages use the conversation's
//! configured method; incoming bodies are classified by wire-format
//! detection, so a conversation switched to a new method still reads its
//! old history.
//!
//! ECDH-V2 ciphertexts are keyed for the recipient. Decrypting one of our
//! own V2 messages is refused outright (the caller resolves it from the
//! own-message vault instead): X25519 agreement would technically succeed
//! against our cached copy of the peer key, but that copy may be stale or
//! absent, and the vault is the authoritative source for own plaintext.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

use cove_crypto::{aead, agreement, keys::ConversationKeyPair, legacy, CryptoError};
use cove_proto::payload::{detect, EncryptedPayload, WireFormat};
use cove_store::{EncryptionMethod, KeyStore, PreferenceStore};

use crate::error::ChatError;

/// Rendered in place of a body that could not be decrypted. Never thrown
/// across the presentation boundary.
pub const UNDECRYPTABLE_PLACEHOLDER: &str = "[unable to decrypt]";

#[derive(Clone)]
pub struct EncryptionEngine {
    key_store: KeyStore,
    prefs: PreferenceStore,
    local_user_id: String,
}

impl EncryptionEngine {
    pub fn new(key_store: KeyStore, prefs: PreferenceStore, local_user_id: String) -> Self {
        Self {
            key_store,
            prefs,
            local_user_id,
        }
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    /// Encrypt an outgoing body with the conversation's configured method.
    pub async fn encrypt(
        &self,
        conversation_id: &str,
        recipient_id: &str,
        plaintext: &str,
    ) -> Result<String, ChatError> {
        let method = self.prefs.method(conversation_id).await?;
        let payload = match method {
            EncryptionMethod::EcdhV2 => {
                self.encrypt_v2(conversation_id, recipient_id, plaintext)
                    .await?
            }
            EncryptionMethod::V1 => EncryptedPayload::V1 {
                combined: legacy::encrypt(conversation_id, plaintext)?,
            },
            EncryptionMethod::BackendDelegated => EncryptedPayload::BackendDelegated {
                plaintext: plaintext.to_string(),
            },
        };
        Ok(payload.to_wire())
    }

    async fn encrypt_v2(
        &self,
        conversation_id: &str,
        recipient_id: &str,
        plaintext: &str,
    ) -> Result<EncryptedPayload, ChatError> {
        let pair = self.own_pair(conversation_id).await?;
        let peer = self
            .key_store
            .peer_public_key(conversation_id, recipient_id)
            .await?
            .ok_or_else(|| ChatError::PeerKeyUnavailable {
                conversation_id: conversation_id.to_string(),
                peer_id: recipient_id.to_string(),
            })?;

        let shared = pair.diffie_hellman(&peer)?;
        let salt = agreement::generate_salt();
        let key = agreement::message_key(
            &shared,
            &salt,
            conversation_id,
            &self.local_user_id,
            recipient_id,
        )?;
        let (ciphertext, iv) =
            aead::gcm_encrypt(&key, plaintext.as_bytes(), conversation_id.as_bytes())?;

        Ok(EncryptedPayload::EcdhV2 {
            ciphertext: URL_SAFE_NO_PAD.encode(ciphertext),
            iv: URL_SAFE_NO_PAD.encode(iv),
            salt: URL_SAFE_NO_PAD.encode(salt),
        })
    }

    /// Decrypt an inbound body, whichever scheme produced it.
    ///
    /// For the local user's own ECDH-V2 messages this returns
    /// [`ChatError::DecryptFailure`]; the caller consults the vault.
    pub async fn decrypt(
        &self,
        conversation_id: &str,
        sender_id: &str,
        body: &str,
    ) -> Result<String, ChatError> {
        match detect(body) {
            WireFormat::BackendDelegated { plaintext } => Ok(plaintext),
            WireFormat::V1 { combined } | WireFormat::V1Fallback { combined } => {
                legacy::decrypt(conversation_id, &combined).map_err(|e| {
                    ChatError::DecryptFailure {
                        conversation_id: conversation_id.to_string(),
                        reason: e.to_string(),
                    }
                })
            }
            WireFormat::EcdhV2 {
                ciphertext,
                iv,
                salt,
            } => {
                if sender_id == self.local_user_id {
                    return Err(ChatError::DecryptFailure {
                        conversation_id: conversation_id.to_string(),
                        reason: "own ciphertext is keyed for the recipient".into(),
                    });
                }
                self.decrypt_v2(conversation_id, sender_id, &ciphertext, &iv, &salt)
                    .await
            }
        }
    }

    async fn decrypt_v2(
        &self,
        conversation_id: &str,
        sender_id: &str,
        ciphertext_b64: &str,
        iv_b64: &str,
        salt_b64: &str,
    ) -> Result<String, ChatError> {
        let pair = self.own_pair(conversation_id).await?;
        let sender_public = self
            .key_store
            .peer_public_key(conversation_id, sender_id)
            .await?
            .ok_or_else(|| ChatError::PeerKeyUnavailable {
                conversation_id: conversation_id.to_string(),
                peer_id: sender_id.to_string(),
            })?;

        let ciphertext = URL_SAFE_NO_PAD
            .decode(ciphertext_b64)
            .map_err(CryptoError::Base64Decode)?;
        let iv = URL_SAFE_NO_PAD
            .decode(iv_b64)
            .map_err(CryptoError::Base64Decode)?;
        let salt = URL_SAFE_NO_PAD
            .decode(salt_b64)
            .map_err(CryptoError::Base64Decode)?;

        let shared = pair.diffie_hellman(&sender_public)?;
        // Directional binding: sender first, then us as the receiver.
        let key = agreement::message_key(
            &shared,
            &salt,
            conversation_id,
            sender_id,
            &self.local_user_id,
        )?;
        let plaintext = aead::gcm_decrypt(&key, &ciphertext, &iv, conversation_id.as_bytes())
            .map_err(|_| ChatError::DecryptFailure {
                conversation_id: conversation_id.to_string(),
                reason: "AEAD verification failed (stale or rotated key?)".into(),
            })?;
        String::from_utf8(plaintext.to_vec()).map_err(|_| ChatError::DecryptFailure {
            conversation_id: conversation_id.to_string(),
            reason: "decrypted body is not UTF-8".into(),
        })
    }

    async fn own_pair(&self, conversation_id: &str) -> Result<ConversationKeyPair, ChatError> {
        self.key_store
            .get_private_key(conversation_id, &self.local_user_id)
            .await?
            .ok_or_else(|| ChatError::KeyMissing {
                conversation_id: conversation_id.to_string(),
            })
    }
}

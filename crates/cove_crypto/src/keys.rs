//! Per-(conversation, user) X25519 key pairs.
//!
//! Every conversation gets its own key pair per participant. The secret half
//! never leaves the device; only the base64url public half is published to
//! the backend for the key exchange.
//!
//! At most one active pair exists per (conversation, user) scope. Regenerating
//! overwrites the previous pair with no rollback — ciphertexts addressed to
//! the old key become permanently undecryptable.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroizing, ZeroizeOnDrop};

use crate::error::CryptoError;

// ── Public key newtype ────────────────────────────────────────────────────────

/// 32-byte X25519 public key, base64url-encoded on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKeyBytes(pub Vec<u8>);

impl PublicKeyBytes {
    pub fn to_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.0)
    }

    pub fn from_b64(s: &str) -> Result<Self, CryptoError> {
        let bytes = URL_SAFE_NO_PAD.decode(s)?;
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKey(format!(
                "Public key must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    pub fn as_array(&self) -> Result<[u8; 32], CryptoError> {
        self.0
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("Expected 32-byte X25519 key".into()))
    }

    /// Human-readable fingerprint: BLAKE3 of the public key, truncated to
    /// 20 bytes, hex-encoded in groups of 4. Shown in the key-verification
    /// remediation message so users can compare out of band.
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(&self.0);
        let hex = hex::encode(&hash.as_bytes()[..20]);
        hex.chars()
            .collect::<Vec<_>>()
            .chunks(4)
            .map(|c| c.iter().collect::<String>())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// ── Conversation key pair ─────────────────────────────────────────────────────

/// X25519 key pair scoped to one (conversation, user). Drop clears the secret.
#[derive(Serialize, Deserialize, ZeroizeOnDrop)]
pub struct ConversationKeyPair {
    #[zeroize(skip)]
    pub public: PublicKeyBytes,
    secret_bytes: [u8; 32],
    #[zeroize(skip)]
    pub created_at: DateTime<Utc>,
}

impl ConversationKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKeyBytes(X25519Public::from(&secret).as_bytes().to_vec());
        Self {
            public,
            secret_bytes: secret.to_bytes(),
            created_at: Utc::now(),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8], created_at: DateTime<Utc>) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKey(format!(
                "Secret key must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        let secret = StaticSecret::from(arr);
        let public = PublicKeyBytes(X25519Public::from(&secret).as_bytes().to_vec());
        Ok(Self {
            public,
            secret_bytes: arr,
            created_at,
        })
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret_bytes
    }

    /// X25519 Diffie-Hellman against a peer's public key. The raw output is
    /// never used directly as a cipher key — see [`crate::agreement`].
    pub fn diffie_hellman(&self, peer: &PublicKeyBytes) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let secret = StaticSecret::from(self.secret_bytes);
        let peer_pub = X25519Public::from(peer.as_array()?);
        Ok(Zeroizing::new(secret.diffie_hellman(&peer_pub).to_bytes()))
    }

    /// Export the public key in base64url format for server upload.
    pub fn public_b64(&self) -> String {
        self.public.to_b64()
    }
}

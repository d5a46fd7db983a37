//! Per-message key derivation for the ECDH-V2 scheme.
//!
//! The raw X25519 shared secret is expanded with HKDF-SHA256 under a fresh
//! random salt per message. The info string binds the conversation and the
//! sender→receiver direction so a key derived for one pair of roles cannot
//! be replayed under another.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::CryptoError;

const V2_DOMAIN: &[u8] = b"cove-ecdh-v2";

/// Generate a fresh random 16-byte salt (one per encrypted message).
pub fn generate_salt() -> [u8; 16] {
    use rand::RngCore;
    let mut salt = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// Derive the 32-byte AES-256-GCM key for one message.
///
/// `shared_secret` is the X25519 DH output between the sender's private key
/// and the receiver's public key (or vice versa — DH is symmetric; direction
/// is enforced by the info binding and by engine policy).
pub fn message_key(
    shared_secret: &[u8; 32],
    salt: &[u8],
    conversation_id: &str,
    sender_id: &str,
    receiver_id: &str,
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let mut info = Vec::with_capacity(
        V2_DOMAIN.len() + conversation_id.len() + sender_id.len() + receiver_id.len() + 3,
    );
    info.extend_from_slice(V2_DOMAIN);
    info.push(0);
    info.extend_from_slice(conversation_id.as_bytes());
    info.push(0);
    info.extend_from_slice(sender_id.as_bytes());
    info.push(0);
    info.extend_from_slice(receiver_id.as_bytes());

    let mut key = Zeroizing::new([0u8; 32]);
    hkdf_expand(shared_secret, Some(salt), &info, key.as_mut())?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_inputs_same_key() {
        let secret = [7u8; 32];
        let salt = [1u8; 16];
        let k1 = message_key(&secret, &salt, "c1", "alice", "bob").unwrap();
        let k2 = message_key(&secret, &salt, "c1", "alice", "bob").unwrap();
        assert_eq!(*k1, *k2);
    }

    #[test]
    fn direction_changes_key() {
        let secret = [7u8; 32];
        let salt = [1u8; 16];
        let ab = message_key(&secret, &salt, "c1", "alice", "bob").unwrap();
        let ba = message_key(&secret, &salt, "c1", "bob", "alice").unwrap();
        assert_ne!(*ab, *ba);
    }

    #[test]
    fn salt_changes_key() {
        let secret = [7u8; 32];
        let k1 = message_key(&secret, &[1u8; 16], "c1", "alice", "bob").unwrap();
        let k2 = message_key(&secret, &[2u8; 16], "c1", "alice", "bob").unwrap();
        assert_ne!(*k1, *k2);
    }
}

//! Authenticated encryption helpers.
//!
//! Two constructions are in active use:
//! - AES-256-GCM for ECDH-V2 message payloads. The 12-byte IV travels as a
//!   separate payload field alongside the ciphertext.
//! - XChaCha20-Poly1305 (192-bit nonce) for the legacy V1 scheme and for
//!   encrypting values at rest in the local store. Wire format:
//!   [ nonce (24 bytes) | ciphertext + tag ].

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng, Payload},
    Aes256Gcm, Nonce,
};
use chacha20poly1305::XChaCha20Poly1305;
use zeroize::Zeroizing;

use crate::error::CryptoError;

// ── AES-256-GCM (ECDH-V2 payloads) ───────────────────────────────────────────

/// Encrypt with AES-256-GCM under a random 12-byte IV.
/// Returns (ciphertext+tag, iv).
pub fn gcm_encrypt(
    key: &[u8; 32],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<(Vec<u8>, [u8; 12]), CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AeadEncrypt)?;
    let nonce = Aes256Gcm::generate_nonce(&mut AeadOsRng);
    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadEncrypt)?;
    Ok((ciphertext, nonce.into()))
}

/// Decrypt an AES-256-GCM ciphertext produced by [`gcm_encrypt`].
pub fn gcm_decrypt(
    key: &[u8; 32],
    ciphertext: &[u8],
    iv: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if iv.len() != 12 {
        return Err(CryptoError::AeadDecrypt);
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AeadDecrypt)?;
    let nonce = Nonce::from_slice(iv);
    let plaintext = cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::AeadDecrypt)?;
    Ok(Zeroizing::new(plaintext))
}

// ── XChaCha20-Poly1305 (legacy V1 + at-rest values) ──────────────────────────

/// Encrypt `plaintext` with a 32-byte key, prepending a random 24-byte nonce.
pub fn xchacha_encrypt(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadEncrypt)?;
    let nonce = XChaCha20Poly1305::generate_nonce(&mut AeadOsRng);
    let ciphertext = cipher
        .encrypt(
            &nonce,
            chacha20poly1305::aead::Payload { msg: plaintext, aad },
        )
        .map_err(|_| CryptoError::AeadEncrypt)?;

    let mut out = Vec::with_capacity(24 + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt wire-format bytes (nonce || ciphertext+tag).
pub fn xchacha_decrypt(
    key: &[u8; 32],
    data: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if data.len() < 24 {
        return Err(CryptoError::AeadDecrypt);
    }
    let (nonce_bytes, ct) = data.split_at(24);
    let nonce = chacha20poly1305::XNonce::from_slice(nonce_bytes);
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadDecrypt)?;
    let plaintext = cipher
        .decrypt(nonce, chacha20poly1305::aead::Payload { msg: ct, aad })
        .map_err(|_| CryptoError::AeadDecrypt)?;
    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gcm_roundtrip() {
        let key = [3u8; 32];
        let (ct, iv) = gcm_encrypt(&key, b"hello", b"c1").unwrap();
        let pt = gcm_decrypt(&key, &ct, &iv, b"c1").unwrap();
        assert_eq!(&*pt, b"hello");
    }

    #[test]
    fn gcm_rejects_wrong_key() {
        let (ct, iv) = gcm_encrypt(&[3u8; 32], b"hello", b"").unwrap();
        assert!(gcm_decrypt(&[4u8; 32], &ct, &iv, b"").is_err());
    }

    #[test]
    fn gcm_rejects_wrong_aad() {
        let (ct, iv) = gcm_encrypt(&[3u8; 32], b"hello", b"c1").unwrap();
        assert!(gcm_decrypt(&[3u8; 32], &ct, &iv, b"c2").is_err());
    }

    #[test]
    fn xchacha_roundtrip() {
        let key = [9u8; 32];
        let ct = xchacha_encrypt(&key, b"legacy body", b"v1").unwrap();
        let pt = xchacha_decrypt(&key, &ct, b"v1").unwrap();
        assert_eq!(&*pt, b"legacy body");
    }

    #[test]
    fn xchacha_rejects_truncated_input() {
        let key = [9u8; 32];
        assert!(xchacha_decrypt(&key, &[0u8; 10], b"").is_err());
    }
}

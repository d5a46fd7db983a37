//! Legacy V1 symmetric scheme.
//!
//! Retained solely for reading and writing messages created before ECDH-V2
//! existed. The key is derived from the conversation id alone, so anyone who
//! knows the conversation id can decrypt — this is why V2 replaced it.
//!
//! Wire format: an opaque 4-segment colon-delimited string
//!   CV1:<salt_b64>:<nonce_b64>:<ct_b64>
//! where the nonce and ciphertext+tag segments together form the
//! XChaCha20-Poly1305 wire bytes.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use zeroize::Zeroizing;

use crate::{aead, agreement, error::CryptoError};

const V1_TAG: &str = "CV1";
const V1_DOMAIN: &[u8] = b"cove-v1-legacy";
const V1_AAD: &[u8] = b"cove-v1";

/// Derive the V1 conversation key. Deterministic per (conversation, salt).
fn conversation_key(conversation_id: &str, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let mut key = Zeroizing::new([0u8; 32]);
    agreement::hkdf_expand(
        conversation_id.as_bytes(),
        Some(salt),
        V1_DOMAIN,
        key.as_mut(),
    )?;
    Ok(key)
}

/// Encrypt plaintext into the V1 combined wire string.
pub fn encrypt(conversation_id: &str, plaintext: &str) -> Result<String, CryptoError> {
    let salt = agreement::generate_salt();
    let key = conversation_key(conversation_id, &salt)?;
    let wire = aead::xchacha_encrypt(&key, plaintext.as_bytes(), V1_AAD)?;
    let (nonce, ct) = wire.split_at(24);
    Ok(format!(
        "{V1_TAG}:{}:{}:{}",
        URL_SAFE_NO_PAD.encode(salt),
        URL_SAFE_NO_PAD.encode(nonce),
        URL_SAFE_NO_PAD.encode(ct),
    ))
}

/// Decrypt a V1 combined wire string.
pub fn decrypt(conversation_id: &str, combined: &str) -> Result<String, CryptoError> {
    let segments: Vec<&str> = combined.split(':').collect();
    if segments.len() != 4 || segments[0] != V1_TAG {
        return Err(CryptoError::MalformedPayload(format!(
            "expected 4-segment {V1_TAG} string, got {} segments",
            segments.len()
        )));
    }
    let salt = URL_SAFE_NO_PAD.decode(segments[1])?;
    let nonce = URL_SAFE_NO_PAD.decode(segments[2])?;
    let ct = URL_SAFE_NO_PAD.decode(segments[3])?;

    let key = conversation_key(conversation_id, &salt)?;
    let mut wire = Vec::with_capacity(nonce.len() + ct.len());
    wire.extend_from_slice(&nonce);
    wire.extend_from_slice(&ct);

    let plaintext = aead::xchacha_decrypt(&key, &wire, V1_AAD)?;
    String::from_utf8(plaintext.to_vec())
        .map_err(|_| CryptoError::MalformedPayload("V1 plaintext is not UTF-8".into()))
}

//! Encrypted payload variants and wire-format detection.
//!
//! Three schemes coexist in stored history, so every message body is a
//! string whose format must be detected before decryption:
//!
//! - Backend-delegated: sentinel marker prefix, plaintext after it.
//! - V1: opaque 4-segment colon-delimited string (`CV1:salt:nonce:ct`).
//! - ECDH-V2: JSON object carrying a `ciphertext` field plus `iv` and `salt`.
//!
//! Detection order (marker → tagged 4-segment colon → JSON-with-ciphertext →
//! V1 best-effort) mirrors the behaviour observed at historical call sites.
//! It has not been verified against all stored message data — change it only
//! with a migration plan for old ciphertexts. The V1 check demands the `CV1`
//! tag in the first segment: a V2 JSON body also contains exactly three
//! colons, so a bare segment count would swallow every V2 ciphertext.

/// Sentinel prefix for backend-delegated bodies. The client sends
/// `srv.e2ee::<plaintext>`; the server encrypts on receipt with its own
/// rotating keys and strips its encryption again before delivery.
pub const BACKEND_MARKER: &str = "srv.e2ee::";

/// First segment of a V1 combined string. Must match what the legacy
/// encryptor emits.
pub const V1_TAG: &str = "CV1";

/// A message body after encryption, before transport. Serialisation is
/// `to_wire` only; each variant has its own string form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncryptedPayload {
    /// ECDH-derived AES-256-GCM. All fields base64url.
    EcdhV2 {
        ciphertext: String,
        iv: String,
        salt: String,
    },
    /// Legacy colon-delimited opaque string.
    V1 { combined: String },
    /// Marker-tagged plaintext; the server performs encryption on receipt.
    BackendDelegated { plaintext: String },
}

impl EncryptedPayload {
    /// Serialise to the single wire string carried in a message body.
    pub fn to_wire(&self) -> String {
        match self {
            EncryptedPayload::EcdhV2 { ciphertext, iv, salt } => serde_json::json!({
                "ciphertext": ciphertext,
                "iv": iv,
                "salt": salt,
            })
            .to_string(),
            EncryptedPayload::V1 { combined } => combined.clone(),
            EncryptedPayload::BackendDelegated { plaintext } => {
                format!("{BACKEND_MARKER}{plaintext}")
            }
        }
    }
}

/// Detected wire format of an inbound body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFormat {
    BackendDelegated { plaintext: String },
    V1 { combined: String },
    EcdhV2 {
        ciphertext: String,
        iv: String,
        salt: String,
    },
    /// None of the positive checks matched; attempt a V1 decrypt as the
    /// last resort.
    V1Fallback { combined: String },
}

/// Classify a raw message body. Order is significant — see module docs.
pub fn detect(body: &str) -> WireFormat {
    if let Some(rest) = body.strip_prefix(BACKEND_MARKER) {
        return WireFormat::BackendDelegated {
            plaintext: rest.to_string(),
        };
    }
    let segments: Vec<&str> = body.split(':').collect();
    if segments.len() == 4 && segments[0] == V1_TAG {
        return WireFormat::V1 {
            combined: body.to_string(),
        };
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(obj) = value.as_object() {
            if obj.contains_key("ciphertext") {
                let field = |k: &str| {
                    obj.get(k)
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string()
                };
                return WireFormat::EcdhV2 {
                    ciphertext: field("ciphertext"),
                    iv: field("iv"),
                    salt: field("salt"),
                };
            }
        }
    }
    WireFormat::V1Fallback {
        combined: body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_wins_even_with_colons() {
        // A backend body whose plaintext happens to contain three colons must
        // not be mistaken for a V1 segment string.
        let body = format!("{BACKEND_MARKER}a:b:c");
        match detect(&body) {
            WireFormat::BackendDelegated { plaintext } => assert_eq!(plaintext, "a:b:c"),
            other => panic!("expected backend, got {other:?}"),
        }
    }

    #[test]
    fn four_segments_is_v1() {
        match detect("CV1:abc:def:ghi") {
            WireFormat::V1 { combined } => assert_eq!(combined, "CV1:abc:def:ghi"),
            other => panic!("expected v1, got {other:?}"),
        }
    }

    #[test]
    fn json_with_ciphertext_is_v2() {
        let body = r#"{"ciphertext":"ct","iv":"iv","salt":"s"}"#;
        match detect(body) {
            WireFormat::EcdhV2 { ciphertext, iv, salt } => {
                assert_eq!(ciphertext, "ct");
                assert_eq!(iv, "iv");
                assert_eq!(salt, "s");
            }
            other => panic!("expected v2, got {other:?}"),
        }
    }

    #[test]
    fn v2_json_colons_are_not_mistaken_for_v1() {
        // A V2 body contains exactly three colons (one per key); it must
        // still reach the JSON check.
        let body = r#"{"ciphertext":"YWJj","iv":"aXY","salt":"c2FsdA"}"#;
        assert_eq!(body.split(':').count(), 4);
        assert!(matches!(detect(body), WireFormat::EcdhV2 { .. }));
    }

    #[test]
    fn untagged_four_segments_falls_back() {
        assert!(matches!(detect("a:b:c:d"), WireFormat::V1Fallback { .. }));
    }

    #[test]
    fn json_without_ciphertext_falls_back() {
        assert!(matches!(
            detect(r#"{"body":"x"}"#),
            WireFormat::V1Fallback { .. }
        ));
    }

    #[test]
    fn anything_else_falls_back_to_v1() {
        assert!(matches!(detect("garbage"), WireFormat::V1Fallback { .. }));
    }

    #[test]
    fn wire_roundtrip_v2() {
        let payload = EncryptedPayload::EcdhV2 {
            ciphertext: "ct".into(),
            iv: "iv".into(),
            salt: "s".into(),
        };
        match detect(&payload.to_wire()) {
            WireFormat::EcdhV2 { ciphertext, .. } => assert_eq!(ciphertext, "ct"),
            other => panic!("expected v2, got {other:?}"),
        }
    }
}

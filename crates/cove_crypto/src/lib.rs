//! cove_crypto — Cove Secure Chat cryptographic primitives
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Public APIs return opaque newtypes to prevent accidental misuse.
//!
//! # Module layout
//! - `keys`      — per-(conversation, user) X25519 key pairs
//! - `agreement` — ECDH shared secret → HKDF per-message keys
//! - `aead`      — AES-256-GCM and XChaCha20-Poly1305 helpers
//! - `legacy`    — V1 conversation-derived symmetric scheme (read/write
//!                 compatibility for pre-V2 messages)
//! - `error`     — unified error type

pub mod aead;
pub mod agreement;
pub mod error;
pub mod keys;
pub mod legacy;

pub use error::CryptoError;

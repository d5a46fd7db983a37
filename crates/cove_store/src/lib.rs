//! cove_store — local persisted state for Cove Secure Chat
//!
//! # Encryption strategy
//! The durable backends do not encrypt by themselves. Sensitive values
//! (private key material, own-message plaintexts) are stored as
//! XChaCha20-Poly1305 ciphertext under a caller-provided 32-byte store key,
//! base64url-encoded. Non-sensitive values (public keys, preferences) are
//! stored in the clear to keep them greppable during support sessions.
//!
//! # Namespaces
//! Everything is keyed `(namespace, key)` on a pluggable [`KvBackend`]:
//! - `keys.private`     — `(conversation:user)` → encrypted key pair
//! - `keys.public`      — `(conversation:user)` → own published public key
//! - `keys.peer`        — `(conversation:peer)` → cached peer public key
//! - `prefs.encryption` — `conversation` → encryption method
//! - `vault.own`        — `(conversation:user:message_id)` → encrypted plaintext

pub mod backend;
pub mod error;
pub mod key_store;
pub mod prefs;
pub mod sqlite;
pub mod vault;

pub use backend::{KvBackend, MemoryBackend};
pub use error::StoreError;
pub use key_store::{KeyStore, StoreKey};
pub use prefs::{EncryptionMethod, PreferenceStore};
pub use sqlite::SqliteBackend;
pub use vault::OwnMessageVault;

use thiserror::Error;

use crate::transport::TransportError;

/// Failure taxonomy of the messaging subsystem.
///
/// None of these are process-fatal: transport failures fall back, decrypt
/// failures render a placeholder, terminal send failures surface retry /
/// remove controls, and an unverified key blocks with a remediation message.
#[derive(Debug, Error)]
pub enum ChatError {
    /// No local key pair for the conversation. Recovered by lazy generation.
    #[error("no local key pair for conversation {conversation_id}")]
    KeyMissing { conversation_id: String },

    /// The server does not confirm our key. Sending is blocked.
    #[error("key not verified by server for conversation {conversation_id}: {remediation}")]
    KeyUnverified {
        conversation_id: String,
        remediation: String,
    },

    /// A recipient's public key could not be fetched.
    #[error("public key unavailable for peer {peer_id} in conversation {conversation_id}")]
    PeerKeyUnavailable {
        conversation_id: String,
        peer_id: String,
    },

    /// Ciphertext could not be read. Rendered as a placeholder, never thrown
    /// across the presentation boundary.
    #[error("could not decrypt message in conversation {conversation_id}: {reason}")]
    DecryptFailure {
        conversation_id: String,
        reason: String,
    },

    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// Rejected before any network call.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] cove_store::StoreError),

    #[error(transparent)]
    Crypto(#[from] cove_crypto::CryptoError),
}

//! cove_core — key lifecycle, encryption engine, and the optimistic
//! message pipeline of Cove Secure Chat.
//!
//! # Architecture
//!
//! ```text
//! UI action
//!    ↓
//! MessageDispatcher ── encrypt via EncryptionEngine
//!    ↓                    (keys from KeyStore / KeyExchangeClient)
//! SocketTransport (ack, 5 s) ── fallback → RestTransport
//!    ↓
//! MessageReconciler ── merges server/peer events
//!    ↓
//! TimelineStore (single-writer reducer) → UI reads snapshots
//! ```
//!
//! Presentation code consumes only dispatcher results and timeline
//! snapshots; encryption internals stay opaque behind the engine.

pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod key_exchange;
pub mod reconciler;
pub mod timeline;
pub mod transport;

pub use dispatcher::{DispatcherConfig, MessageDispatcher, SendOutcome, SendPath};
pub use engine::{EncryptionEngine, UNDECRYPTABLE_PLACEHOLDER};
pub use error::ChatError;
pub use key_exchange::KeyExchangeClient;
pub use reconciler::MessageReconciler;
pub use timeline::{TimelineEvent, TimelineStore};

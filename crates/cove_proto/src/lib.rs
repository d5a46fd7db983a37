//! cove_proto — Cove Secure Chat wire types
//!
//! Everything the client and server agree on: encrypted payload formats,
//! the message model, socket event names, and REST DTOs. This crate has no
//! crypto and no I/O.

pub mod api;
pub mod events;
pub mod message;
pub mod payload;

pub use message::{Message, MessageStatus};
pub use payload::{EncryptedPayload, WireFormat};

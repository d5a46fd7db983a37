//! End-to-end send pipeline over scripted in-memory transports.

use std::sync::Arc;
use std::time::Duration;

use cove_core::dispatcher::{DispatcherConfig, MessageDispatcher, SendPath};
use cove_core::engine::EncryptionEngine;
use cove_core::error::ChatError;
use cove_core::key_exchange::KeyExchangeClient;
use cove_core::timeline::TimelineStore;
use cove_core::transport::memory::{AckBehavior, MemoryRest, MemorySocket, RestBehavior};
use cove_crypto::keys::ConversationKeyPair;
use cove_proto::api::MediaUpload;
use cove_proto::events::OutboundEvent;
use cove_proto::message::MessageStatus;
use cove_store::{
    backend::MemoryBackend, key_store::StoreKey, KeyStore, OwnMessageVault, PreferenceStore,
};

const CONV: &str = "c1";

struct Harness {
    socket: Arc<MemorySocket>,
    rest: Arc<MemoryRest>,
    dispatcher: MessageDispatcher,
    timeline: TimelineStore,
    vault: OwnMessageVault,
}

fn participants() -> Vec<String> {
    vec!["alice".into(), "bob".into()]
}

/// Alice's full stack, with Bob's public key already published so the
/// first send can fetch it.
fn harness() -> Harness {
    let backend = Arc::new(MemoryBackend::new());
    let store_key = StoreKey::generate();
    let key_store = KeyStore::new(backend.clone(), store_key.clone());
    let prefs = PreferenceStore::new(backend.clone());
    let vault = OwnMessageVault::new(backend, store_key);

    let socket = Arc::new(MemorySocket::new());
    let rest = Arc::new(MemoryRest::new());
    rest.seed_peer_key(CONV, "bob", &ConversationKeyPair::generate().public.to_b64());

    let engine = EncryptionEngine::new(key_store.clone(), prefs, "alice".into());
    let keys = KeyExchangeClient::new(key_store, rest.clone(), socket.clone(), "alice".into());
    let timeline = TimelineStore::new();
    let dispatcher = MessageDispatcher::new(
        DispatcherConfig {
            // Short enough to keep the fallback tests fast.
            ack_timeout: Duration::from_millis(50),
        },
        socket.clone(),
        rest.clone(),
        engine,
        keys,
        vault.clone(),
        timeline.clone(),
    );

    Harness {
        socket,
        rest,
        dispatcher,
        timeline,
        vault,
    }
}

#[tokio::test]
async fn socket_ack_confirms_and_fills_vault() {
    let h = harness();
    let outcome = h
        .dispatcher
        .send_text(CONV, &participants(), "hello bob")
        .await
        .unwrap();

    assert_eq!(outcome.via, SendPath::Socket);
    let msg = h.timeline.message(CONV, &outcome.client_temp_id).await.unwrap();
    assert_eq!(msg.status, MessageStatus::Sent);
    assert_eq!(msg.server_id.as_deref(), Some(outcome.server_id.as_str()));
    assert_eq!(msg.plain_text.as_deref(), Some("hello bob"));
    // The ciphertext on the wire is not the plaintext.
    assert_ne!(msg.encrypted_body.as_deref(), Some("hello bob"));

    // Vault keyed by the server id, not the temp id.
    assert_eq!(
        h.vault
            .own_plaintext(CONV, &outcome.server_id, "alice")
            .await
            .unwrap()
            .as_deref(),
        Some("hello bob")
    );
    // No REST traffic on the happy path.
    assert!(h.rest.submissions().is_empty());
}

#[tokio::test]
async fn silent_socket_falls_back_to_rest_with_same_temp_id() {
    let h = harness();
    h.socket.set_ack_behavior(AckBehavior::Silent);

    let outcome = h
        .dispatcher
        .send_text(CONV, &participants(), "over rest then")
        .await
        .unwrap();

    assert_eq!(outcome.via, SendPath::Rest);
    let submissions = h.rest.submissions();
    assert_eq!(submissions.len(), 1);
    // The idempotency key is carried unchanged into the fallback.
    assert_eq!(submissions[0].0.client_temp_id, outcome.client_temp_id);

    let msg = h.timeline.message(CONV, &outcome.client_temp_id).await.unwrap();
    assert_eq!(msg.status, MessageStatus::Sent);
    assert_eq!(msg.server_id.as_deref(), Some(outcome.server_id.as_str()));
}

#[tokio::test]
async fn rejected_socket_falls_back_to_rest() {
    let h = harness();
    h.socket
        .set_ack_behavior(AckBehavior::Reject("room closed".into()));

    let outcome = h
        .dispatcher
        .send_text(CONV, &participants(), "still delivered")
        .await
        .unwrap();
    assert_eq!(outcome.via, SendPath::Rest);
}

#[tokio::test]
async fn both_transports_failing_leaves_failed_entry_then_retry_succeeds() {
    let h = harness();
    h.socket.set_ack_behavior(AckBehavior::Reject("nope".into()));
    h.rest.set_behavior(RestBehavior::Fail("503".into()));

    let err = h
        .dispatcher
        .send_text(CONV, &participants(), "will fail")
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Transport(_)));

    let snapshot = h.timeline.snapshot(CONV).await;
    assert_eq!(snapshot.len(), 1);
    let failed = &snapshot[0];
    assert_eq!(failed.status, MessageStatus::Failed);
    // Plaintext is retained so the retry control can resend it.
    assert_eq!(failed.plain_text.as_deref(), Some("will fail"));

    h.socket.set_ack_behavior(AckBehavior::Ack);
    let outcome = h
        .dispatcher
        .retry(CONV, &failed.client_temp_id)
        .await
        .unwrap();
    assert_eq!(outcome.client_temp_id, failed.client_temp_id);

    let msg = h.timeline.message(CONV, &failed.client_temp_id).await.unwrap();
    assert_eq!(msg.status, MessageStatus::Sent);
    assert_eq!(h.timeline.snapshot(CONV).await.len(), 1);
}

#[tokio::test]
async fn retry_rejects_non_failed_entries() {
    let h = harness();
    let outcome = h
        .dispatcher
        .send_text(CONV, &participants(), "delivered fine")
        .await
        .unwrap();
    let err = h
        .dispatcher
        .retry(CONV, &outcome.client_temp_id)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Validation(_)));
}

#[tokio::test]
async fn remove_failed_discards_only_failed_entries() {
    let h = harness();
    let ok = h
        .dispatcher
        .send_text(CONV, &participants(), "keep me")
        .await
        .unwrap();

    h.socket.set_ack_behavior(AckBehavior::Reject("nope".into()));
    h.rest.set_behavior(RestBehavior::Fail("503".into()));
    let _ = h.dispatcher.send_text(CONV, &participants(), "drop me").await;

    let failed_id = h
        .timeline
        .snapshot(CONV)
        .await
        .into_iter()
        .find(|m| m.status == MessageStatus::Failed)
        .unwrap()
        .client_temp_id;

    // A confirmed entry is not removable.
    h.dispatcher.remove_failed(CONV, &ok.client_temp_id).await;
    assert_eq!(h.timeline.snapshot(CONV).await.len(), 2);

    h.dispatcher.remove_failed(CONV, &failed_id).await;
    let snapshot = h.timeline.snapshot(CONV).await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].client_temp_id, ok.client_temp_id);
}

#[tokio::test]
async fn media_always_goes_over_rest() {
    let h = harness();
    let media = vec![MediaUpload {
        filename: "photo.jpg".into(),
        mime_type: "image/jpeg".into(),
        bytes: vec![0xff, 0xd8, 0xff],
    }];
    let outcome = h
        .dispatcher
        .send_media(CONV, &participants(), "look at this", media)
        .await
        .unwrap();

    assert_eq!(outcome.via, SendPath::Rest);
    let submissions = h.rest.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].1, 1);
    // The socket never saw a send attempt.
    assert!(h
        .socket
        .emitted()
        .iter()
        .all(|e| !matches!(e, OutboundEvent::SendMessage { .. })));

    let msg = h.timeline.message(CONV, &outcome.client_temp_id).await.unwrap();
    assert_eq!(msg.media.len(), 1);
    assert_eq!(msg.status, MessageStatus::Sent);
}

#[tokio::test]
async fn empty_body_is_rejected_before_any_network_call() {
    let h = harness();
    let err = h
        .dispatcher
        .send_text(CONV, &participants(), "   ")
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Validation(_)));
    assert!(h.rest.submissions().is_empty());
    assert!(h.socket.emitted().is_empty());
    assert!(h.timeline.snapshot(CONV).await.is_empty());
}

#[tokio::test]
async fn unverified_key_blocks_open_conversation() {
    let h = harness();
    h.socket.set_verify_result(false);
    let err = h
        .dispatcher
        .open_conversation(CONV, &participants())
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::KeyUnverified { .. }));
}

#[tokio::test]
async fn failed_verification_blocks_sends_until_it_passes() {
    let h = harness();
    h.socket.set_verify_result(false);
    let _ = h.dispatcher.open_conversation(CONV, &participants()).await;

    // The block outlives the open attempt: sends fail before any
    // optimistic entry appears.
    let err = h
        .dispatcher
        .send_text(CONV, &participants(), "held back")
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::KeyUnverified { .. }));
    assert!(h.timeline.snapshot(CONV).await.is_empty());
    assert!(h.rest.submissions().is_empty());

    // A later successful verification clears it.
    h.socket.set_verify_result(true);
    h.dispatcher
        .open_conversation(CONV, &participants())
        .await
        .unwrap();
    h.dispatcher
        .send_text(CONV, &participants(), "now it goes")
        .await
        .unwrap();
}

#[tokio::test]
async fn room_guard_joins_on_open_and_leaves_on_drop() {
    let h = harness();
    let guard = h
        .dispatcher
        .open_conversation(CONV, &participants())
        .await
        .unwrap();
    assert!(h
        .socket
        .emitted()
        .iter()
        .any(|e| matches!(e, OutboundEvent::JoinRoom { .. })));

    drop(guard);
    // Leave is emitted from a spawned task.
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;
    assert!(h
        .socket
        .emitted()
        .iter()
        .any(|e| matches!(e, OutboundEvent::LeaveRoom { conversation_id } if conversation_id == CONV)));
}

#[tokio::test]
async fn edit_updates_timeline_and_vault_in_place() {
    let h = harness();
    let sent = h
        .dispatcher
        .send_text(CONV, &participants(), "first draft")
        .await
        .unwrap();

    h.dispatcher
        .edit_message(CONV, &participants(), &sent.server_id, "final text")
        .await
        .unwrap();

    let snapshot = h.timeline.snapshot(CONV).await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].plain_text.as_deref(), Some("final text"));
    assert_eq!(
        h.vault
            .own_plaintext(CONV, &sent.server_id, "alice")
            .await
            .unwrap()
            .as_deref(),
        Some("final text")
    );
}

#[tokio::test]
async fn failed_edit_restores_previous_text() {
    let h = harness();
    let sent = h
        .dispatcher
        .send_text(CONV, &participants(), "original")
        .await
        .unwrap();

    h.socket.set_ack_behavior(AckBehavior::Reject("nope".into()));
    h.rest.set_behavior(RestBehavior::Fail("503".into()));

    let err = h
        .dispatcher
        .edit_message(CONV, &participants(), &sent.server_id, "doomed edit")
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Transport(_)));

    let msg = h.timeline.message(CONV, &sent.server_id).await.unwrap();
    assert_eq!(msg.plain_text.as_deref(), Some("original"));
    assert_eq!(msg.status, MessageStatus::Sent);
    // The vault still holds the text the server has.
    assert_eq!(
        h.vault
            .own_plaintext(CONV, &sent.server_id, "alice")
            .await
            .unwrap()
            .as_deref(),
        Some("original")
    );
}

#[tokio::test]
async fn edit_is_visible_while_awaiting_confirmation() {
    let h = harness();
    let sent = h
        .dispatcher
        .send_text(CONV, &participants(), "original")
        .await
        .unwrap();

    h.socket.set_ack_behavior(AckBehavior::Silent);
    h.rest.set_behavior(RestBehavior::Fail("503".into()));

    let dispatcher = h.dispatcher.clone();
    let server_id = sent.server_id.clone();
    let task = tokio::spawn(async move {
        let _ = dispatcher
            .edit_message(CONV, &participants(), &server_id, "pending edit")
            .await;
    });

    // The silent socket holds the edit for the full 50 ms ack window; the
    // new text must be visible during that wait.
    let mut saw_pending = false;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(1)).await;
        let msg = h.timeline.message(CONV, &sent.server_id).await.unwrap();
        if msg.plain_text.as_deref() == Some("pending edit") {
            saw_pending = true;
            break;
        }
    }
    assert!(saw_pending);

    task.await.unwrap();
    // Both transports failed, so the original text is back.
    let msg = h.timeline.message(CONV, &sent.server_id).await.unwrap();
    assert_eq!(msg.plain_text.as_deref(), Some("original"));
}

#[tokio::test]
async fn missing_peer_key_degrades_to_backend_delegated() {
    let h = harness();
    // No key ever published for carol, and the server says so.
    h.rest.set_peer_unavailable("carol");

    let outcome = h
        .dispatcher
        .send_text(CONV, &["alice".into(), "carol".into()], "still goes out")
        .await
        .unwrap();

    let msg = h.timeline.message(CONV, &outcome.client_temp_id).await.unwrap();
    assert_eq!(msg.status, MessageStatus::Sent);
    assert!(msg
        .encrypted_body
        .as_deref()
        .unwrap()
        .starts_with(cove_proto::payload::BACKEND_MARKER));
}

#[tokio::test]
async fn emoji_send_uses_its_own_event() {
    let h = harness();
    h.dispatcher
        .send_emoji(CONV, &participants(), "🎉")
        .await
        .unwrap();
    assert!(h
        .socket
        .emitted()
        .iter()
        .any(|e| matches!(e, OutboundEvent::SendEmoji { .. })));
}

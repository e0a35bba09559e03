//! Edge case and boundary condition tests
//!
//! These tests verify the system handles unusual inputs,
//! error conditions, and boundary values correctly.

use std::sync::Arc;

use chatsync_core::types::RESERVED_ID_CHARS;
use chatsync_core::{
    BlobObjectStorage, ChatConfig, ChatEngine, ChatError, ConversationKey, GroupId,
    LocalIdentity, MemoryStore, Message, MessageDraft, MessageId, ProfileUpdate, RemoteStore,
    SignUp, StorePath, UserId,
};

fn form(name: &str, email: &str, password: &str) -> SignUp {
    SignUp {
        name: name.to_string(),
        email: email.to_string(),
        password: password.to_string(),
        confirm_password: password.to_string(),
        ..Default::default()
    }
}

struct Fixture {
    store: Arc<MemoryStore>,
    objects: Arc<BlobObjectStorage>,
    engine: ChatEngine,
}

fn fixture(config: ChatConfig) -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let objects = Arc::new(BlobObjectStorage::in_memory(config.max_upload_bytes));
    let engine = ChatEngine::new(
        store.clone(),
        Arc::new(LocalIdentity::in_memory()),
        objects.clone(),
        config,
    )
    .unwrap();
    Fixture {
        store,
        objects,
        engine,
    }
}

/// Register bob then alice on one engine; alice stays signed in.
async fn alice_and_bob(engine: &ChatEngine) -> (UserId, UserId) {
    let bob = engine.sign_up(form("Bob", "bob@example.com", "secret1")).await.unwrap();
    engine.sign_out().await.unwrap();
    let alice = engine.sign_up(form("Alice", "alice@example.com", "secret1")).await.unwrap();
    (alice, bob)
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_partial_config_keeps_defaults() {
    let config = ChatConfig::from_json_slice(br#"{"write_retries": 3}"#).unwrap();
    assert_eq!(config.write_retries, 3);
    assert_eq!(config.resubscribe_attempts, ChatConfig::default().resubscribe_attempts);
    assert_eq!(config.unnamed_group_name, "Unnamed Group");
}

#[test]
fn test_invalid_config_rejected() {
    assert!(ChatConfig::from_json_slice(br#"{"event_channel_capacity": 0}"#).is_err());
    assert!(ChatConfig::from_json_slice(b"not json").is_err());

    let config = ChatConfig {
        max_group_name_len: 0,
        ..Default::default()
    };
    assert!(ChatEngine::in_memory(config).is_err());
}

// ============================================================================
// Identifiers, Paths and Keys
// ============================================================================

#[test]
fn test_reserved_characters_in_ids() {
    assert!(UserId::new("").is_err());
    for c in RESERVED_ID_CHARS {
        let raw = format!("a{}b", c);
        assert!(UserId::new(raw.as_str()).is_err(), "{:?} accepted", raw);
        assert!(GroupId::new(raw.as_str()).is_err(), "{:?} accepted", raw);
    }
    assert!(UserId::new("user_01-Ab").is_ok());
}

#[test]
fn test_store_path_normalization() {
    let path = StorePath::parse("//users//alice/").unwrap();
    assert_eq!(path.to_string(), "users/alice");
    assert_eq!(path.key(), Some("alice"));

    assert!(StorePath::parse("").unwrap().is_root());
    assert_eq!(StorePath::root().to_string(), "/");
    assert!(StorePath::root().parent().is_none());

    assert!(StorePath::parse("users/a.b").is_err());
    assert!(StorePath::users().child("").is_err());
    assert!(StorePath::users().child("a#b").is_err());
}

#[test]
fn test_conversation_key_parse_rejects_malformed() {
    for raw in ["", "dm~bob~alice", "dm~a~a", "dm~a", "dm~a~b~c", "grp~", "chat~x", "grp~a~b"] {
        assert!(ConversationKey::parse(raw).is_err(), "{:?} accepted", raw);
    }
    assert!(ConversationKey::parse("dm~alice~bob").is_ok());
    assert!(ConversationKey::parse("grp~g1").unwrap().is_group());
}

#[test]
fn test_group_key_never_involves_users() {
    let key = ConversationKey::group(&GroupId::new("alice").unwrap());
    let alice = UserId::new("alice").unwrap();
    assert!(!key.involves(&alice));
    assert!(key.peer_of(&alice).is_none());
}

// ============================================================================
// Drafts and Previews
// ============================================================================

#[test]
fn test_location_bounds() {
    assert!(MessageDraft::location(90.0, 180.0).is_ok());
    assert!(MessageDraft::location(-90.0, -180.0).is_ok());
    assert!(MessageDraft::location(90.1, 0.0).is_err());
    assert!(MessageDraft::location(0.0, -180.5).is_err());
    assert!(MessageDraft::location(f64::NAN, 0.0).is_err());
}

#[test]
fn test_blank_drafts_are_invalid() {
    assert!(MessageDraft::text("").validate().is_err());
    assert!(MessageDraft::text(" \n\t ").validate().is_err());
    assert!(MessageDraft::text(" ")
        .with_attachment(vec![1], "image/png", "a.png")
        .validate()
        .is_ok());
}

#[test]
fn test_message_previews() {
    let message = |text: &str| Message {
        id: MessageId::new("m1").unwrap(),
        sender: UserId::new("alice").unwrap(),
        text: text.to_string(),
        timestamp: 0,
        attachment: None,
    };

    assert_eq!(message("short").preview(10), "short");
    assert_eq!(message("line one\nline two").preview(40), "line one...");
    assert_eq!(message("abcdefghijklmnop").preview(4), "abcd...");
    // Counts characters, not bytes
    assert_eq!(message("héllo wörld").preview(5), "héllo...");
    assert_eq!(message("").preview(10), "");
}

// ============================================================================
// Session Requirements and Validation
// ============================================================================

#[tokio::test]
async fn test_operations_require_session() {
    let engine = ChatEngine::in_memory(ChatConfig::default()).unwrap();
    let key = ConversationKey::parse("dm~alice~bob").unwrap();

    assert!(matches!(engine.contacts(), Err(ChatError::AuthFailed(_))));
    assert!(matches!(engine.conversations(), Err(ChatError::AuthFailed(_))));
    assert!(matches!(
        engine.send_message(&key, MessageDraft::text("hi")).await,
        Err(ChatError::AuthFailed(_))
    ));
    assert!(engine.resume().unwrap().is_none());
    // Signing out without a session is harmless
    engine.sign_out().await.unwrap();
}

#[tokio::test]
async fn test_sign_up_validation() {
    let engine = ChatEngine::in_memory(ChatConfig::default()).unwrap();

    let blank = engine.sign_up(form("   ", "a@example.com", "secret1")).await;
    assert!(matches!(blank, Err(ChatError::InvalidOperation(_))));

    let short = engine.sign_up(form("A", "a@example.com", "abc")).await;
    assert!(matches!(short, Err(ChatError::AuthFailed(_))));

    let malformed = engine.sign_up(form("A", "not-an-email", "secret1")).await;
    assert!(matches!(malformed, Err(ChatError::AuthFailed(_))));

    assert!(engine.current_user().is_none());
}

#[tokio::test]
async fn test_empty_profile_update_rejected() {
    let engine = ChatEngine::in_memory(ChatConfig::default()).unwrap();
    engine.sign_up(form("Alice", "alice@example.com", "secret1")).await.unwrap();

    let result = engine.update_profile(ProfileUpdate::default()).await;
    assert!(matches!(result, Err(ChatError::InvalidOperation(_))));
}

#[tokio::test]
async fn test_add_contact_rejections() {
    let engine = ChatEngine::in_memory(ChatConfig::default()).unwrap();
    engine.sign_up(form("Alice", "alice@example.com", "secret1")).await.unwrap();

    assert!(matches!(
        engine.add_contact("  ", "").await,
        Err(ChatError::InvalidOperation(_))
    ));
    assert!(matches!(
        engine.add_contact("nobody@example.com", "").await,
        Err(ChatError::NotFound(_))
    ));
    assert!(matches!(
        engine.add_contact("ALICE@example.com", "me").await,
        Err(ChatError::InvalidOperation(_))
    ));
    assert!(engine.contacts().unwrap().is_empty());
}

#[tokio::test]
async fn test_group_name_limits() {
    let f = fixture(ChatConfig::default());
    let (alice, bob) = alice_and_bob(&f.engine).await;

    let max = "x".repeat(50);
    assert!(f.engine.create_group(&max, &[bob.clone()]).await.is_ok());

    let too_long = "x".repeat(51);
    assert!(f.engine.create_group(&too_long, &[bob.clone()]).await.is_err());

    // Only the creator selected
    assert!(f.engine.create_group("Solo", &[alice]).await.is_err());
    assert!(f.engine.create_group("Nobody", &[]).await.is_err());
}

// ============================================================================
// Store and Upload Failures
// ============================================================================

#[tokio::test]
async fn test_single_write_conflict_is_retried() {
    let f = fixture(ChatConfig::default());
    let (_, bob) = alice_and_bob(&f.engine).await;
    let key = f.engine.direct_key(&bob).unwrap();
    let view = f.engine.open_conversation(&key).await.unwrap();

    f.store.fail_next_writes(1);
    let sent = f.engine.send_message(&key, MessageDraft::text("made it")).await.unwrap();
    assert_eq!(view.messages(), vec![sent]);
}

#[tokio::test]
async fn test_first_send_retries_conflicting_record_write() {
    let f = fixture(ChatConfig::default());
    let (_, bob) = alice_and_bob(&f.engine).await;
    let key = f.engine.direct_key(&bob).unwrap();

    // Never opened: the send creates the conversation record first
    f.store.fail_next_writes(1);
    let sent = f.engine.send_message(&key, MessageDraft::text("first")).await.unwrap();

    let users = f.store.read(&StorePath::chat_users(&key)).await.unwrap();
    assert!(users.is_some());
    let view = f.engine.open_conversation(&key).await.unwrap();
    assert_eq!(view.messages(), vec![sent]);
}

#[tokio::test]
async fn test_repeated_write_conflict_surfaces() {
    let f = fixture(ChatConfig::default());
    let (_, bob) = alice_and_bob(&f.engine).await;
    let key = f.engine.direct_key(&bob).unwrap();
    // Open first so the conversation record exists
    let view = f.engine.open_conversation(&key).await.unwrap();

    f.store.fail_next_writes(2);
    let result = f.engine.send_message(&key, MessageDraft::text("lost")).await;
    assert!(matches!(result, Err(ChatError::WriteConflict(_))));
    assert!(view.messages().is_empty());
}

#[tokio::test]
async fn test_upload_failure_writes_nothing() {
    let f = fixture(ChatConfig::default());
    let (_, bob) = alice_and_bob(&f.engine).await;
    let key = f.engine.direct_key(&bob).unwrap();
    let view = f.engine.open_conversation(&key).await.unwrap();

    f.objects.fail_next_uploads(1);
    let draft = MessageDraft::text("see photo").with_attachment(vec![1, 2, 3], "image/png", "p.png");
    let result = f.engine.send_message(&key, draft).await;
    assert!(matches!(result, Err(ChatError::UploadFailed(_))));
    assert!(view.messages().is_empty());
}

#[tokio::test]
async fn test_oversized_attachment_rejected() {
    let f = fixture(ChatConfig {
        max_upload_bytes: 16,
        ..Default::default()
    });
    let (_, bob) = alice_and_bob(&f.engine).await;
    let key = f.engine.direct_key(&bob).unwrap();

    let draft = MessageDraft::text("").with_attachment(vec![0; 17], "video/mp4", "clip.mp4");
    let result = f.engine.send_message(&key, draft).await;
    assert!(matches!(result, Err(ChatError::UploadFailed(_))));
}

#[tokio::test]
async fn test_self_conversation_rejected() {
    let f = fixture(ChatConfig::default());
    let (alice, _) = alice_and_bob(&f.engine).await;
    assert!(f.engine.direct_key(&alice).is_err());
}

#[tokio::test]
async fn test_outsider_cannot_touch_direct_conversation() {
    let f = fixture(ChatConfig::default());
    let (_, bob) = alice_and_bob(&f.engine).await;
    let carol = UserId::new("carol").unwrap();
    let key = ConversationKey::direct(&bob, &carol).unwrap();

    assert!(f.engine.send_message(&key, MessageDraft::text("hi")).await.is_err());
    assert!(f.engine.delete_conversation(&key).await.is_err());
    assert!(f.engine.open_conversation(&key).await.is_err());
}

#[tokio::test]
async fn test_unknown_group_is_not_found() {
    let f = fixture(ChatConfig::default());
    alice_and_bob(&f.engine).await;
    let key = ConversationKey::group(&GroupId::new("missing").unwrap());

    let result = f.engine.send_message(&key, MessageDraft::text("hi")).await;
    assert!(matches!(result, Err(ChatError::NotFound(_))));
}

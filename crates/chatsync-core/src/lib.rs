//! Chatsync Core Library
//!
//! Client-side realtime chat synchronization over a shared remote data store.
//!
//! ## Overview
//!
//! Chatsync keeps a live, consistent view of a user's conversations (direct
//! and group) by subscribing to a hierarchical remote store, merging the
//! updates of many independent listeners and deriving the views a chat
//! client shows: the time-sorted conversation list, per-conversation message
//! feeds, typing indicators and contact/group rosters.
//!
//! ## Core Principles
//!
//! - **Idempotent subscriptions**: one store listener per target, however
//!   often a view re-subscribes
//! - **Recompute from scratch**: derived lists never depend on the order in
//!   which listeners report
//! - **Explicit teardown**: every subscription has one owner that cancels it
//!
//! ## Quick Start
//!
//! ```ignore
//! use chatsync_core::{ChatConfig, ChatEngine, MessageDraft};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = ChatEngine::open("~/.chatsync", ChatConfig::default())?;
//!     engine.sign_in("alice@example.com", "secret").await?;
//!
//!     let bob = engine.add_contact("bob@example.com", "Bobby").await?.contact;
//!     let key = engine.direct_key(&bob)?;
//!     engine.send_message(&key, MessageDraft::text("Hello!")).await?;
//!
//!     for summary in engine.conversations()? {
//!         println!("{}: {}", summary.display_name, summary.preview(40));
//!     }
//!     Ok(())
//! }
//! ```

pub mod chat;
pub mod config;
pub mod engine;
pub mod error;
pub mod services;
pub mod storage;
pub mod store;
pub mod sync;
pub mod types;

// Re-exports
pub use chat::{
    Attachment, AttachmentKind, ConversationKey, ConversationView, DraftAttachment, Message,
    MessageDraft, TypingFlags,
};
pub use config::ChatConfig;
pub use engine::{ChatEngine, SignUp};
pub use error::{ChatError, ChatResult};
pub use services::{BlobObjectStorage, IdentityService, LocalIdentity, ObjectStorage};
pub use storage::Storage;
pub use store::{MemoryStore, RemoteStore, StoreEvent, StorePath};
pub use sync::{
    ChatEvent, ConversationSummary, DirectoryEntry, EntryState, GroupRoster, Subscription,
    SubscriptionStatus, SyncContext, SyncManager,
};
pub use types::*;

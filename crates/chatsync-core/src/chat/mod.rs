//! Conversations: identity, message feeds and typing flags
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  ConversationKey   dm~{a}~{b} | grp~{group}                     │
//! │  ├── ensure_conversation: check-then-create chats/{key}/users   │
//! │  └── StorePath::messages / typing_states                        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  MessageFeed       chats/{key}/messages → ordered Vec<Message>  │
//! │  ├── send_message: upload, append_child, write (retry once)     │
//! │  └── delete_conversation: chats/{key} → absent                  │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  TypingChannel     chats/{key}/typingStates → TypingFlags       │
//! │  └── set_typing: partial update of the caller's own flag        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ConversationView  feed + typing for one open conversation      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

mod conversation;
mod feed;
mod key;
mod message;
mod typing;

pub use conversation::{display_name, ConversationView};
pub use feed::{
    delete_conversation, parse_messages, send_message, sort_messages, FeedHandler, MessageFeed,
};
pub use key::{ensure_conversation, ConversationKey};
pub use message::{Attachment, AttachmentKind, DraftAttachment, Message, MessageDraft};
pub use typing::{set_typing, TypingChannel, TypingFlags};

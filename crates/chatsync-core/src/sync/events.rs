//! Chat event types and subscription status tracking
//!
//! ## Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SubscriptionStatus: health of one store listener               │
//! │  ├── Active: delivering updates                                 │
//! │  ├── Recovering: dropped by the store, resubscribing            │
//! │  └── Failed: resubscription attempts exhausted                  │
//! │                                                                 │
//! │  ChatEvent: notifications for the presentation layer            │
//! │  ├── DirectoryChanged / GroupsChanged / ProfileChanged          │
//! │  ├── ConversationsChanged: aggregate list republished           │
//! │  ├── FeedChanged / TypingChanged: one conversation updated      │
//! │  ├── MessageSent / ConversationDeleted: local writes acked      │
//! │  └── SubscriptionError / SubscriptionRecovered                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use crate::chat::ConversationKey;
use crate::types::{MessageId, UserId};

/// Health of a single store listener
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SubscriptionStatus {
    /// Delivering updates
    #[default]
    Active,
    /// The store dropped the listener; resubscription in progress
    Recovering {
        /// Attempt number (1-based)
        attempt: u32,
    },
    /// Resubscription gave up; the view is frozen at its last value
    Failed,
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionStatus::Active => write!(f, "Active"),
            SubscriptionStatus::Recovering { attempt } => {
                write!(f, "Recovering (attempt {})", attempt)
            }
            SubscriptionStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// Events emitted by the sync stages
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// A contact directory or group roster republished its snapshot
    DirectoryChanged {
        /// Owner of the contact list, or the group whose roster changed
        scope: String,
        /// Number of entries in the new snapshot
        entries: usize,
    },
    /// The list of groups the user belongs to changed
    GroupsChanged { user: UserId, groups: usize },
    /// A watched profile changed
    ProfileChanged { user: UserId },
    /// The aggregated conversation list was recomputed
    ConversationsChanged { count: usize },
    /// A conversation's message feed changed
    FeedChanged {
        key: ConversationKey,
        messages: usize,
    },
    /// Typing flags of a conversation changed
    TypingChanged {
        key: ConversationKey,
        /// Users currently flagged as typing
        typing: Vec<UserId>,
    },
    /// A message written by this client was acknowledged
    MessageSent {
        key: ConversationKey,
        id: MessageId,
    },
    /// A conversation was deleted by this client
    ConversationDeleted { key: ConversationKey },
    /// A listener was dropped by the store
    SubscriptionError {
        path: String,
        message: String,
        status: SubscriptionStatus,
    },
    /// A dropped listener was re-established
    SubscriptionRecovered { path: String },
}

impl ChatEvent {
    /// Get the conversation key associated with this event, if any
    pub fn conversation_key(&self) -> Option<&ConversationKey> {
        match self {
            ChatEvent::FeedChanged { key, .. } => Some(key),
            ChatEvent::TypingChanged { key, .. } => Some(key),
            ChatEvent::MessageSent { key, .. } => Some(key),
            ChatEvent::ConversationDeleted { key } => Some(key),
            _ => None,
        }
    }

    /// Whether this event reports a listener problem
    pub fn is_error(&self) -> bool {
        matches!(self, ChatEvent::SubscriptionError { .. })
    }
}

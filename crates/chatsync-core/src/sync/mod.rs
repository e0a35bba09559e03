//! Live synchronization stages
//!
//! Each stage owns its subscriptions and publishes a full snapshot through
//! a `tokio::sync::watch` channel whenever anything upstream changes.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  DirectorySync (contacts)      GroupListSync (groups + rosters) │
//! │          │                              │                       │
//! │          └──────────────┬───────────────┘                       │
//! │                         ▼                                       │
//! │           conversation sources (key, name, is_group)            │
//! │                         ▼                                       │
//! │  ConversationAggregator                                         │
//! │  ├── one MessageFeed per source (SubscriptionRegistry)          │
//! │  │   (feeds and profiles share store listeners per path)        │
//! │  └── recompute-from-scratch on every feed change                │
//! │                         ▼                                       │
//! │  watch::Receiver<Vec<ConversationSummary>>                      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`SyncManager`] wires the stages together in a background task.
//! Every stage also emits [`ChatEvent`]s on the shared broadcast bus.

pub mod aggregator;
pub mod directory;
pub mod events;
pub mod groups;
pub mod manager;
pub mod profile;
pub mod shared;
pub mod subscription;

pub use aggregator::{summarize, ConversationAggregator, ConversationSource, ConversationSummary};
pub use directory::{
    add_contact, filter_entries, find_user_by_email, DirectoryEntry, DirectoryObserver,
    DirectorySync, EntryState,
};
pub use events::{ChatEvent, SubscriptionStatus};
pub use groups::{create_group, parse_groups, GroupListSync, GroupRoster};
pub use manager::{conversation_sources, SyncManager};
pub use profile::ProfileSync;
pub use shared::{SharedSubscription, SharedSubscriptions};
pub use subscription::{ChangeHandler, Subscription, SubscriptionRegistry};

use std::sync::Arc;

use tokio::sync::broadcast;

use serde_json::Value;

use crate::config::ChatConfig;
use crate::error::ChatResult;
use crate::store::{RemoteStore, StorePath};

/// Everything a sync stage needs: the store, the config, the event bus and
/// the listeners shared between stages.
#[derive(Clone)]
pub struct SyncContext {
    /// Remote shared data store
    pub store: Arc<dyn RemoteStore>,
    /// Engine configuration
    pub config: Arc<ChatConfig>,
    events: broadcast::Sender<ChatEvent>,
    shared: Arc<SharedSubscriptions>,
}

impl SyncContext {
    pub fn new(store: Arc<dyn RemoteStore>, config: ChatConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        Self {
            store,
            config: Arc::new(config),
            events,
            shared: Arc::new(SharedSubscriptions::new()),
        }
    }

    /// Subscribe to `path` through the listener shared by every stage of
    /// this context. See [`SharedSubscriptions`].
    pub fn subscribe_shared(
        &self,
        path: StorePath,
        on_change: impl Fn(Option<Value>) + Send + Sync + 'static,
    ) -> ChatResult<SharedSubscription> {
        self.shared.open(self, path, Arc::new(on_change))
    }

    pub fn shared_subscriptions(&self) -> &SharedSubscriptions {
        &self.shared
    }

    /// Subscribe to chat events
    ///
    /// Multiple subscribers can exist; events are broadcast to all.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    /// Broadcast an event. Having no receivers is fine.
    pub fn emit(&self, event: ChatEvent) {
        let _ = self.events.send(event);
    }
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("config", &self.config)
            .field("event_receivers", &self.events.receiver_count())
            .field("shared_paths", &self.shared.len())
            .finish()
    }
}

//! Background sync manager wiring the pipeline stages of one session
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SyncManager (one per signed-in user)                           │
//! │  ├── contacts: DirectorySync      users/{me}/contactList        │
//! │  ├── groups: GroupListSync        groups (member == me)         │
//! │  ├── aggregator: ConversationAggregator                         │
//! │  └── task: JoinHandle                                           │
//! │      └── on contacts/groups change: recompute sources and       │
//! │          hand them to the aggregator                            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The stages never call each other; the task is the only link between
//! them. Stopping the manager aborts the task and cancels every
//! subscription the stages opened.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::aggregator::{ConversationAggregator, ConversationSource, ConversationSummary};
use super::directory::{DirectoryEntry, DirectorySync};
use super::groups::{GroupListSync, GroupRoster};
use super::SyncContext;
use crate::chat::{display_name, ConversationKey};
use crate::config::ChatConfig;
use crate::error::ChatResult;
use crate::types::{Group, UserId};

/// Conversations `me` takes part in: one direct conversation per contact and
/// one group conversation per group.
pub fn conversation_sources(
    me: &UserId,
    contacts: &[DirectoryEntry],
    rosters: &[GroupRoster],
    config: &ChatConfig,
) -> Vec<ConversationSource> {
    let groups: Vec<Group> = rosters.iter().map(|r| r.group.clone()).collect();

    let direct = contacts.iter().filter_map(|contact| {
        let key = ConversationKey::direct(me, &contact.id).ok()?;
        Some(ConversationSource {
            display_name: display_name(&key, me, contacts, &groups, config),
            key,
            is_group: false,
            online: contact.online,
        })
    });
    let grouped = rosters.iter().map(|roster| {
        let key = ConversationKey::group(roster.id());
        ConversationSource {
            display_name: display_name(&key, me, contacts, &groups, config),
            key,
            is_group: true,
            online: roster.others_online(me),
        }
    });
    direct.chain(grouped).collect()
}

/// Manager for the live pipeline of one user.
///
/// # Example
///
/// ```ignore
/// let manager = SyncManager::start(&ctx, &me)?;
/// let mut conversations = manager.watch_conversations();
///
/// while conversations.changed().await.is_ok() {
///     for summary in conversations.borrow().iter() {
///         println!("{}: {}", summary.display_name, summary.preview(40));
///     }
/// }
/// ```
pub struct SyncManager {
    ctx: SyncContext,
    user: UserId,
    contacts: Arc<DirectorySync>,
    groups: Arc<GroupListSync>,
    aggregator: Arc<ConversationAggregator>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncManager {
    /// Start every stage for `user` and the task linking them.
    ///
    /// Must be called from within a tokio runtime. Snapshots are populated
    /// before this returns.
    pub fn start(ctx: &SyncContext, user: &UserId) -> ChatResult<Self> {
        info!(%user, "Starting sync");
        let contacts = Arc::new(DirectorySync::contacts(ctx, user)?);
        let groups = Arc::new(GroupListSync::start(ctx, user)?);
        let aggregator = Arc::new(ConversationAggregator::new(ctx));

        let manager = Self {
            ctx: ctx.clone(),
            user: user.clone(),
            contacts,
            groups,
            aggregator,
            task: Mutex::new(None),
        };
        manager.refresh();

        let task = tokio::spawn(Self::source_task(
            manager.ctx.config.clone(),
            manager.user.clone(),
            manager.contacts.watch(),
            manager.groups.watch(),
            Arc::downgrade(&manager.aggregator),
        ));
        *manager.task.lock() = Some(task);
        Ok(manager)
    }

    /// Recompute conversation sources from the current snapshots.
    pub fn refresh(&self) {
        let sources = conversation_sources(
            &self.user,
            &self.contacts.snapshot(),
            &self.groups.snapshot(),
            &self.ctx.config,
        );
        self.aggregator.set_sources(sources);
    }

    /// Holds the aggregator weakly: an aborted task may linger until the
    /// runtime polls it again, and must not keep the stages alive meanwhile.
    async fn source_task(
        config: Arc<ChatConfig>,
        user: UserId,
        mut contacts: watch::Receiver<Vec<DirectoryEntry>>,
        mut groups: watch::Receiver<Vec<GroupRoster>>,
        aggregator: Weak<ConversationAggregator>,
    ) {
        debug!(%user, "Source task started");
        loop {
            tokio::select! {
                changed = contacts.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = groups.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            let Some(aggregator) = aggregator.upgrade() else {
                break;
            };
            let sources = conversation_sources(
                &user,
                &contacts.borrow_and_update(),
                &groups.borrow_and_update(),
                &config,
            );
            aggregator.set_sources(sources);
        }
        debug!(%user, "Source task ended");
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub fn contacts(&self) -> &DirectorySync {
        &self.contacts
    }

    pub fn groups(&self) -> &GroupListSync {
        &self.groups
    }

    pub fn aggregator(&self) -> &ConversationAggregator {
        &self.aggregator
    }

    /// Aggregated conversations, newest first
    pub fn conversations(&self) -> Vec<ConversationSummary> {
        self.aggregator.snapshot()
    }

    pub fn watch_conversations(&self) -> watch::Receiver<Vec<ConversationSummary>> {
        self.aggregator.watch()
    }

    /// Conversation sources currently fed to the aggregator
    pub fn sources(&self) -> Vec<ConversationSource> {
        self.aggregator.sources()
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Abort the task and cancel every subscription. Idempotent.
    pub fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            info!(user = %self.user, "Stopping sync");
            task.abort();
            self.aggregator.stop();
            self.groups.stop();
            self.contacts.stop();
        }
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        self.stop();
    }
}

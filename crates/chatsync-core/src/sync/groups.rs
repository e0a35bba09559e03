//! Group membership sync: the groups a user belongs to, with live rosters
//!
//! ```text
//!   groups ──► filter(member == me) ──► sort(created_at, id)
//!                     │
//!                     └─► one DirectorySync per group (groups/{id}/members)
//!                              └─► observer ──► roster entries ──► publish
//! ```
//!
//! Membership is fixed once a group exists, so the roster directory of a
//! group lives exactly as long as the group stays in the list.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::directory::{DirectoryEntry, DirectoryObserver, DirectorySync};
use super::events::ChatEvent;
use super::subscription::Subscription;
use super::SyncContext;
use crate::error::{ChatError, ChatResult};
use crate::store::{write_with_retry, StorePath};
use crate::types::{now_millis, Group, GroupId, UserId};

/// A group together with its resolved members
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRoster {
    pub group: Group,
    /// Resolved member entries, in membership order. Empty until the roster
    /// directory delivered.
    pub members: Vec<DirectoryEntry>,
}

impl GroupRoster {
    pub fn id(&self) -> &GroupId {
        &self.group.id
    }

    /// Member names joined with ", "
    pub fn member_names(&self) -> String {
        self.members
            .iter()
            .map(DirectoryEntry::label)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Whether any member, `me` included, is online
    pub fn any_online(&self) -> bool {
        self.members.iter().any(|m| m.online)
    }

    /// Whether any member other than `me` is online
    pub fn others_online(&self, me: &UserId) -> bool {
        self.members.iter().any(|m| m.online && &m.id != me)
    }

    /// Case-insensitive substring match on the group name
    pub fn matches(&self, query: &str) -> bool {
        let query = query.trim().to_lowercase();
        query.is_empty() || self.group.name.to_lowercase().contains(&query)
    }
}

/// Decode the `groups` subtree, keeping only groups `me` belongs to.
///
/// Ordered by creation time, then id.
pub fn parse_groups(value: Option<&Value>, me: &UserId) -> Vec<Group> {
    let Some(map) = value.and_then(Value::as_object) else {
        return Vec::new();
    };
    let mut groups: Vec<Group> = map
        .iter()
        .filter_map(|(key, record)| Group::from_value(key, record))
        .filter(|g| g.is_member(me))
        .collect();
    groups.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    groups
}

#[derive(Default)]
struct GroupState {
    groups: Vec<Group>,
    members: HashMap<GroupId, Vec<DirectoryEntry>>,
}

struct Shared {
    ctx: SyncContext,
    user: UserId,
    state: Mutex<GroupState>,
    /// Roster directories; created and dropped outside `state`
    rosters: Mutex<BTreeMap<GroupId, DirectorySync>>,
    tx: watch::Sender<Vec<GroupRoster>>,
}

impl Shared {
    fn on_groups(self: &Arc<Self>, value: Option<Value>) {
        let groups = parse_groups(value.as_ref(), &self.user);
        let ids: Vec<GroupId> = groups.iter().map(|g| g.id.clone()).collect();
        {
            let mut state = self.state.lock();
            state.members.retain(|id, _| ids.contains(id));
            state.groups = groups;
        }
        self.publish();

        let stale: Vec<DirectorySync> = {
            let mut rosters = self.rosters.lock();
            let gone: Vec<GroupId> = rosters.keys().filter(|id| !ids.contains(id)).cloned().collect();
            gone.iter().filter_map(|id| rosters.remove(id)).collect()
        };
        if !stale.is_empty() {
            debug!(user = %self.user, dropped = stale.len(), "Released group rosters");
        }
        drop(stale);

        for id in ids {
            if self.rosters.lock().contains_key(&id) {
                continue;
            }
            let weak: Weak<Shared> = Arc::downgrade(self);
            let group = id.clone();
            let observer: DirectoryObserver = Arc::new(move |entries: &[DirectoryEntry]| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_members(&group, entries);
                }
            });
            match DirectorySync::members_with(&self.ctx, &id, Some(observer)) {
                Ok(roster) => {
                    let duplicate = {
                        let mut rosters = self.rosters.lock();
                        if rosters.contains_key(&id) {
                            Some(roster)
                        } else {
                            rosters.insert(id.clone(), roster);
                            None
                        }
                    };
                    drop(duplicate);
                }
                Err(e) => warn!(%id, error = ?e, "Group roster subscription failed"),
            }
        }
    }

    fn on_members(&self, group: &GroupId, entries: &[DirectoryEntry]) {
        {
            let mut state = self.state.lock();
            if !state.groups.iter().any(|g| &g.id == group) {
                return;
            }
            if state.members.get(group).map(Vec::as_slice) == Some(entries) {
                return;
            }
            state.members.insert(group.clone(), entries.to_vec());
        }
        self.publish();
    }

    fn publish(&self) {
        let rosters: Vec<GroupRoster> = {
            let state = self.state.lock();
            state
                .groups
                .iter()
                .map(|group| GroupRoster {
                    group: group.clone(),
                    members: state.members.get(&group.id).cloned().unwrap_or_default(),
                })
                .collect()
        };
        let count = rosters.len();
        self.tx.send_replace(rosters);
        self.ctx.emit(ChatEvent::GroupsChanged {
            user: self.user.clone(),
            groups: count,
        });
    }
}

/// Live list of the groups a user belongs to.
///
/// Dropping it cancels the group-list subscription and every roster.
pub struct GroupListSync {
    shared: Arc<Shared>,
    list: Mutex<Option<Subscription>>,
}

impl GroupListSync {
    pub fn start(ctx: &SyncContext, user: &UserId) -> ChatResult<Self> {
        let (tx, _) = watch::channel(Vec::new());
        let shared = Arc::new(Shared {
            ctx: ctx.clone(),
            user: user.clone(),
            state: Mutex::new(GroupState::default()),
            rosters: Mutex::new(BTreeMap::new()),
            tx,
        });

        let weak = Arc::downgrade(&shared);
        let list = Subscription::open(ctx, StorePath::groups(), move |value| {
            if let Some(shared) = weak.upgrade() {
                shared.on_groups(value);
            }
        })?;
        debug!(%user, "Group list sync started");

        Ok(Self {
            shared,
            list: Mutex::new(Some(list)),
        })
    }

    pub fn snapshot(&self) -> Vec<GroupRoster> {
        self.shared.tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Vec<GroupRoster>> {
        self.shared.tx.subscribe()
    }

    pub fn get(&self, id: &GroupId) -> Option<GroupRoster> {
        self.shared.tx.borrow().iter().find(|r| r.id() == id).cloned()
    }

    /// Plain group records, without rosters
    pub fn groups(&self) -> Vec<Group> {
        self.shared.tx.borrow().iter().map(|r| r.group.clone()).collect()
    }

    /// Rosters matching `query` by group name
    pub fn filter(&self, query: &str) -> Vec<GroupRoster> {
        self.shared
            .tx
            .borrow()
            .iter()
            .filter(|r| r.matches(query))
            .cloned()
            .collect()
    }

    /// Number of live roster directories
    pub fn roster_count(&self) -> usize {
        self.shared.rosters.lock().len()
    }

    pub fn is_running(&self) -> bool {
        self.list.lock().is_some()
    }

    /// Cancel the list subscription and every roster. Idempotent.
    pub fn stop(&self) {
        let list = self.list.lock().take();
        if let Some(list) = list {
            list.cancel();
            let rosters = std::mem::take(&mut *self.shared.rosters.lock());
            debug!(user = %self.shared.user, rosters = rosters.len(), "Group list sync stopped");
            drop(rosters);
        }
    }
}

impl Drop for GroupListSync {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Create a group named `name` with `creator` and the `selected` members.
///
/// The name is trimmed and must be non-blank and at most
/// `config.max_group_name_len` characters. At least one member besides the
/// creator is required. The group key is allocated by the store.
pub async fn create_group(
    ctx: &SyncContext,
    creator: &UserId,
    name: &str,
    selected: &[UserId],
) -> ChatResult<Group> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ChatError::InvalidOperation("Group name is required".to_string()));
    }
    let max = ctx.config.max_group_name_len;
    if name.chars().count() > max {
        return Err(ChatError::InvalidOperation(format!(
            "Group name must be at most {} characters",
            max
        )));
    }
    if !selected.iter().any(|m| m != creator) {
        return Err(ChatError::InvalidOperation(
            "Select at least one member".to_string(),
        ));
    }

    let key = ctx.store.append_child(&StorePath::groups()).await?;
    let group = Group::new(
        GroupId::new(key)?,
        name,
        selected.iter().cloned(),
        creator.clone(),
        now_millis(),
    );
    let record = serde_json::to_value(&group)?;
    let path = StorePath::group(&group.id);

    write_with_retry(&ctx.config, "create_group", || {
        ctx.store.write(&path, Some(record.clone()))
    })
    .await?;

    info!(id = %group.id, members = group.members.len(), "Group created");
    Ok(group)
}

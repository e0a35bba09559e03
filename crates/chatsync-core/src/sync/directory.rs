//! Directory sync: a live list of id references resolved into profiles
//!
//! Used for a user's contact list (`users/{owner}/contactList`, each
//! reference carrying the owner's pseudo for that contact) and for a
//! group's member list (`groups/{id}/members`, no alias).
//!
//! ```text
//!   reference list ──► refs: [(id, alias)] ──► drop holds not in ids
//!                                          └─► subscribe_shared(users/{id})
//!   users/{id} change ──► replace entry `id` in place ──► publish snapshot
//! ```
//!
//! Profile listeners are shared through the [`SyncContext`]: a user who is
//! both a contact and a member of several groups has one `users/{id}`
//! listener, whose deliveries reach every directory referencing them.
//!
//! A snapshot never holds two entries for the same id. A reference whose
//! profile does not exist resolves to a placeholder entry instead of an
//! error.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, trace};

use super::events::ChatEvent;
use super::shared::SharedSubscription;
use super::subscription::Subscription;
use super::SyncContext;
use crate::error::{ChatError, ChatResult};
use crate::store::{write_with_retry, RemoteStore, StorePath};
use crate::types::contact::parse_contact_list;
use crate::types::group::parse_member_ids;
use crate::types::{ContactEntry, ContactRef, GroupId, UserId, UserProfile};

/// Resolution state of one directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Profile not delivered yet
    Loading,
    /// Profile present
    Resolved,
    /// Referenced profile does not exist
    Missing,
}

/// One resolved reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub id: UserId,
    /// Alias chosen by the list owner (contact pseudo), if any
    pub alias: Option<String>,
    /// Profile name, or the placeholder name when unresolved
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub picture: Option<String>,
    pub online: bool,
    pub state: EntryState,
}

impl DirectoryEntry {
    fn build(
        id: UserId,
        alias: Option<String>,
        profile: Option<&Option<UserProfile>>,
        placeholder: &str,
    ) -> Self {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        match profile {
            Some(Some(p)) => Self {
                id,
                alias,
                name: non_empty(&p.name).unwrap_or_else(|| placeholder.to_string()),
                email: non_empty(&p.email),
                phone: non_empty(&p.phone),
                picture: p.picture.clone(),
                online: p.online,
                state: EntryState::Resolved,
            },
            other => Self {
                id,
                alias,
                name: placeholder.to_string(),
                email: None,
                phone: None,
                picture: None,
                online: false,
                state: if other.is_some() {
                    EntryState::Missing
                } else {
                    EntryState::Loading
                },
            },
        }
    }

    /// Display label: the alias when set, otherwise the name
    pub fn label(&self) -> &str {
        match &self.alias {
            Some(alias) if !alias.trim().is_empty() => alias,
            _ => &self.name,
        }
    }

    /// Case-insensitive substring match on label, name and email
    pub fn matches(&self, query: &str) -> bool {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return true;
        }
        self.label().to_lowercase().contains(&query)
            || self.name.to_lowercase().contains(&query)
            || self
                .email
                .as_deref()
                .map(|e| e.to_lowercase().contains(&query))
                .unwrap_or(false)
    }
}

/// Entries matching `query` (see [`DirectoryEntry::matches`])
pub fn filter_entries<'a>(entries: &'a [DirectoryEntry], query: &str) -> Vec<&'a DirectoryEntry> {
    entries.iter().filter(|e| e.matches(query)).collect()
}

type ReferenceParser = fn(&Value) -> Vec<(UserId, Option<String>)>;

/// Callback receiving every published snapshot, after the watch channel
pub type DirectoryObserver = Arc<dyn Fn(&[DirectoryEntry]) + Send + Sync>;

#[derive(Default)]
struct DirectoryState {
    /// Current reference list, in list order
    refs: Vec<(UserId, Option<String>)>,
    /// Latest profile per id; `Some(None)` = profile absent
    profiles: HashMap<UserId, Option<UserProfile>>,
    /// Published snapshot
    entries: Vec<DirectoryEntry>,
}

struct Shared {
    ctx: SyncContext,
    scope: String,
    state: Mutex<DirectoryState>,
    /// Profile holds, one per referenced id
    profiles: Mutex<BTreeMap<UserId, SharedSubscription>>,
    tx: watch::Sender<Vec<DirectoryEntry>>,
    observer: Option<DirectoryObserver>,
}

impl Shared {
    fn on_references(self: &Arc<Self>, value: Option<Value>, parse: ReferenceParser) {
        let refs = value.as_ref().map(parse).unwrap_or_default();
        trace!(scope = %self.scope, count = refs.len(), "Reference list changed");

        let ids: Vec<UserId> = refs.iter().map(|(id, _)| id.clone()).collect();
        {
            let mut state = self.state.lock();
            state.profiles.retain(|id, _| ids.contains(id));
            state.refs = refs;
            let placeholder = &self.ctx.config.placeholder_name;
            let rebuilt: Vec<DirectoryEntry> = state
                .refs
                .iter()
                .map(|(id, alias)| {
                    DirectoryEntry::build(
                        id.clone(),
                        alias.clone(),
                        state.profiles.get(id),
                        placeholder,
                    )
                })
                .collect();
            state.entries = rebuilt;
        }
        self.publish();

        // Lock released: cancelling and opening both run listener callbacks
        let dropped: Vec<SharedSubscription> = {
            let mut profiles = self.profiles.lock();
            let stale: Vec<UserId> = profiles
                .keys()
                .filter(|id| !ids.contains(id))
                .cloned()
                .collect();
            stale.iter().filter_map(|id| profiles.remove(id)).collect()
        };
        if !dropped.is_empty() {
            debug!(scope = %self.scope, dropped = dropped.len(), "Released profile subscriptions");
        }
        drop(dropped);

        for id in ids {
            if self.profiles.lock().contains_key(&id) {
                continue;
            }
            let weak = Arc::downgrade(self);
            let profile_id = id.clone();
            let opened = self.ctx.subscribe_shared(StorePath::user(&id), move |value| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_profile(&profile_id, value);
                }
            });
            match opened {
                Ok(hold) => {
                    let duplicate = self.profiles.lock().insert(id, hold);
                    drop(duplicate);
                }
                Err(e) => {
                    debug!(scope = %self.scope, %id, error = ?e, "Profile subscription failed");
                    self.on_profile(&id, None);
                }
            }
        }
    }

    /// Drop every profile hold. Returns how many were held.
    fn release_profiles(&self) -> usize {
        let held = std::mem::take(&mut *self.profiles.lock());
        held.len()
    }

    fn on_profile(&self, id: &UserId, value: Option<Value>) {
        let profile = value.as_ref().and_then(UserProfile::from_value);
        {
            let mut state = self.state.lock();
            let Some(alias) = state
                .refs
                .iter()
                .find(|(ref_id, _)| ref_id == id)
                .map(|(_, alias)| alias.clone())
            else {
                // Reference removed while the notification was queued
                return;
            };
            state.profiles.insert(id.clone(), profile);
            let entry = DirectoryEntry::build(
                id.clone(),
                alias,
                state.profiles.get(id),
                &self.ctx.config.placeholder_name,
            );
            match state.entries.iter_mut().find(|e| &e.id == id) {
                Some(existing) if *existing == entry => return,
                Some(existing) => *existing = entry,
                None => state.entries.push(entry),
            }
        }
        self.publish();
    }

    fn publish(&self) {
        let entries = self.state.lock().entries.clone();
        let count = entries.len();
        if let Some(observer) = &self.observer {
            observer(&entries);
        }
        self.tx.send_replace(entries);
        self.ctx.emit(ChatEvent::DirectoryChanged {
            scope: self.scope.clone(),
            entries: count,
        });
    }
}

/// Live directory of resolved references.
///
/// Dropping it (or calling [`stop`](DirectorySync::stop)) cancels the list
/// subscription and every profile subscription it opened.
pub struct DirectorySync {
    shared: Arc<Shared>,
    list: Mutex<Option<Subscription>>,
}

impl DirectorySync {
    /// Contacts of `owner`, labelled with the owner's pseudos.
    pub fn contacts(ctx: &SyncContext, owner: &UserId) -> ChatResult<Self> {
        fn parse(value: &Value) -> Vec<(UserId, Option<String>)> {
            parse_contact_list(value)
                .into_iter()
                .map(|(id, pseudo)| (id, Some(pseudo)))
                .collect()
        }
        Self::start(
            ctx,
            format!("contacts:{}", owner),
            StorePath::contact_list(owner),
            parse,
            None,
        )
    }

    /// Members of a group.
    pub fn members(ctx: &SyncContext, group: &GroupId) -> ChatResult<Self> {
        Self::members_with(ctx, group, None)
    }

    /// Members of a group, also handing every snapshot to `observer`.
    pub fn members_with(
        ctx: &SyncContext,
        group: &GroupId,
        observer: Option<DirectoryObserver>,
    ) -> ChatResult<Self> {
        fn parse(value: &Value) -> Vec<(UserId, Option<String>)> {
            parse_member_ids(value).into_iter().map(|id| (id, None)).collect()
        }
        Self::start(
            ctx,
            format!("group:{}", group),
            StorePath::group(group).child_unchecked("members"),
            parse,
            observer,
        )
    }

    fn start(
        ctx: &SyncContext,
        scope: String,
        list_path: StorePath,
        parse: ReferenceParser,
        observer: Option<DirectoryObserver>,
    ) -> ChatResult<Self> {
        let (tx, _) = watch::channel(Vec::new());
        let shared = Arc::new(Shared {
            ctx: ctx.clone(),
            scope,
            state: Mutex::new(DirectoryState::default()),
            profiles: Mutex::new(BTreeMap::new()),
            tx,
            observer,
        });

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let list = Subscription::open(ctx, list_path, move |value| {
            if let Some(shared) = weak.upgrade() {
                shared.on_references(value, parse);
            }
        })?;
        debug!(scope = %shared.scope, "Directory sync started");

        Ok(Self {
            shared,
            list: Mutex::new(Some(list)),
        })
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Vec<DirectoryEntry> {
        self.shared.tx.borrow().clone()
    }

    /// Receiver notified on every republished snapshot
    pub fn watch(&self) -> watch::Receiver<Vec<DirectoryEntry>> {
        self.shared.tx.subscribe()
    }

    /// Entry for `id`, if referenced
    pub fn get(&self, id: &UserId) -> Option<DirectoryEntry> {
        self.shared.tx.borrow().iter().find(|e| &e.id == id).cloned()
    }

    /// Number of profiles this directory holds
    pub fn profile_subscriptions(&self) -> usize {
        self.shared.profiles.lock().len()
    }

    pub fn is_running(&self) -> bool {
        self.list.lock().is_some()
    }

    /// Cancel every subscription opened by this sync. Idempotent.
    pub fn stop(&self) {
        let list = self.list.lock().take();
        if let Some(list) = list {
            list.cancel();
            let released = self.shared.release_profiles();
            debug!(scope = %self.shared.scope, released, "Directory sync stopped");
        }
    }
}

impl Drop for DirectorySync {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Look a registered user up by email (trimmed, case-insensitive).
pub async fn find_user_by_email(
    store: &dyn RemoteStore,
    email: &str,
) -> ChatResult<Option<(UserId, UserProfile)>> {
    let users = store.read(&StorePath::users()).await?;
    let Some(users) = users.as_ref().and_then(Value::as_object) else {
        return Ok(None);
    };
    Ok(users.iter().find_map(|(id, record)| {
        let profile = UserProfile::from_value(record)?;
        if !profile.has_email(email) {
            return None;
        }
        Some((UserId::new(id.as_str()).ok()?, profile))
    }))
}

/// Add the user registered under `email` to `owner`'s contacts.
///
/// Writes both sides of the relationship: `owner` labels the contact with
/// `alias`, the contact labels `owner` with `owner`'s profile name.
/// Re-adding an existing contact only rewrites the two aliases.
pub async fn add_contact(
    ctx: &SyncContext,
    owner: &UserId,
    email: &str,
    alias: &str,
) -> ChatResult<ContactEntry> {
    let email = email.trim();
    if email.is_empty() {
        return Err(ChatError::InvalidOperation("Email is required".to_string()));
    }
    let (contact, _) = find_user_by_email(ctx.store.as_ref(), email)
        .await?
        .ok_or_else(|| ChatError::NotFound(format!("No user registered with {}", email)))?;
    if &contact == owner {
        return Err(ChatError::InvalidOperation(
            "Cannot add yourself as a contact".to_string(),
        ));
    }

    let owner_name = ctx
        .store
        .read(&StorePath::user(owner))
        .await?
        .as_ref()
        .and_then(UserProfile::from_value)
        .map(|p| p.name)
        .unwrap_or_default();

    let entry = ContactEntry::new(owner.clone(), contact, alias.trim());
    let reciprocal = entry.reciprocal(owner_name);
    for side in [&entry, &reciprocal] {
        let path = StorePath::contact_list(&side.owner);
        let mut fields = serde_json::Map::new();
        fields.insert(
            side.contact.to_string(),
            serde_json::to_value(ContactRef {
                pseudo: side.pseudo.clone(),
            })?,
        );
        write_with_retry(&ctx.config, "add_contact", || ctx.store.update(&path, fields.clone()))
            .await?;
    }

    info!(%owner, contact = %entry.contact, "Contact added");
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChatConfig;
    use crate::store::{MemoryStore, RemoteStore};
    use serde_json::json;

    fn uid(s: &str) -> UserId {
        UserId::new(s).unwrap()
    }

    async fn seeded() -> (Arc<MemoryStore>, SyncContext) {
        let store = Arc::new(MemoryStore::new());
        store
            .write(
                &StorePath::users(),
                Some(json!({
                    "alice": {"name": "Alice", "email": "alice@x.io", "online": true,
                              "contactList": {"bob": {"pseudo": "Bobby"}}},
                    "bob": {"name": "Bob", "email": "bob@x.io", "online": false},
                })),
            )
            .await
            .unwrap();
        let ctx = SyncContext::new(store.clone(), ChatConfig::default());
        (store, ctx)
    }

    #[tokio::test]
    async fn test_contacts_resolve_profiles() {
        let (_store, ctx) = seeded().await;
        let sync = DirectorySync::contacts(&ctx, &uid("alice")).unwrap();

        let entries = sync.snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].label(), "Bobby");
        assert_eq!(entries[0].name, "Bob");
        assert_eq!(entries[0].email.as_deref(), Some("bob@x.io"));
        assert_eq!(entries[0].state, EntryState::Resolved);
    }

    #[tokio::test]
    async fn test_profile_change_replaces_entry_in_place() {
        let (store, ctx) = seeded().await;
        let sync = DirectorySync::contacts(&ctx, &uid("alice")).unwrap();

        for online in [true, false, true] {
            store
                .write(&StorePath::user(&uid("bob")).child("online").unwrap(), Some(json!(online)))
                .await
                .unwrap();
        }

        let entries = sync.snapshot();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].online);
    }

    #[tokio::test]
    async fn test_one_profile_listener_per_contact() {
        let (store, ctx) = seeded().await;
        let sync = DirectorySync::contacts(&ctx, &uid("alice")).unwrap();

        // Rewriting the contact list re-runs reference resolution
        for pseudo in ["B", "Bo", "Bobby"] {
            store
                .write(
                    &StorePath::contact(&uid("alice"), &uid("bob")),
                    Some(json!({"pseudo": pseudo})),
                )
                .await
                .unwrap();
        }

        assert_eq!(sync.profile_subscriptions(), 1);
        assert_eq!(store.listener_count_at(&StorePath::user(&uid("bob"))), 1);
        assert_eq!(sync.snapshot()[0].label(), "Bobby");
    }

    #[tokio::test]
    async fn test_contact_and_rosters_share_profile_listener() {
        let (store, ctx) = seeded().await;
        let groups = [GroupId::new("g1").unwrap(), GroupId::new("g2").unwrap()];
        for group in &groups {
            store
                .write(
                    &StorePath::group(group),
                    Some(json!({"name": "G", "members": ["alice", "bob"], "createdBy": "alice"})),
                )
                .await
                .unwrap();
        }

        let contacts = DirectorySync::contacts(&ctx, &uid("alice")).unwrap();
        let first = DirectorySync::members(&ctx, &groups[0]).unwrap();
        let second = DirectorySync::members(&ctx, &groups[1]).unwrap();
        let bob = StorePath::user(&uid("bob"));
        assert_eq!(store.listener_count_at(&bob), 1);
        assert_eq!(ctx.shared_subscriptions().holders(&bob), 3);
        assert_eq!(second.get(&uid("bob")).unwrap().state, EntryState::Resolved);

        store
            .write(&bob.child("online").unwrap(), Some(json!(true)))
            .await
            .unwrap();
        for sync in [&contacts, &first, &second] {
            assert!(sync.get(&uid("bob")).unwrap().online);
        }

        // Leaving one roster keeps the listener for the others
        drop(first);
        assert_eq!(store.listener_count_at(&bob), 1);
        store
            .write(&bob.child("online").unwrap(), Some(json!(false)))
            .await
            .unwrap();
        assert!(!contacts.get(&uid("bob")).unwrap().online);
        assert!(!second.get(&uid("bob")).unwrap().online);

        contacts.stop();
        second.stop();
        assert_eq!(store.listener_count_at(&bob), 0);
    }

    #[tokio::test]
    async fn test_missing_profile_gets_placeholder() {
        let (store, ctx) = seeded().await;
        store
            .write(
                &StorePath::contact(&uid("alice"), &uid("ghost")),
                Some(json!({"pseudo": ""})),
            )
            .await
            .unwrap();
        let sync = DirectorySync::contacts(&ctx, &uid("alice")).unwrap();

        let ghost = sync.get(&uid("ghost")).unwrap();
        assert_eq!(ghost.name, "Unknown");
        assert_eq!(ghost.label(), "Unknown");
        assert_eq!(ghost.state, EntryState::Missing);
    }

    #[tokio::test]
    async fn test_removed_reference_releases_listener() {
        let (store, ctx) = seeded().await;
        let sync = DirectorySync::contacts(&ctx, &uid("alice")).unwrap();
        assert_eq!(store.listener_count_at(&StorePath::user(&uid("bob"))), 1);

        store
            .write(&StorePath::contact(&uid("alice"), &uid("bob")), None)
            .await
            .unwrap();

        assert!(sync.snapshot().is_empty());
        assert_eq!(store.listener_count_at(&StorePath::user(&uid("bob"))), 0);
    }

    #[tokio::test]
    async fn test_stop_cancels_everything() {
        let (store, ctx) = seeded().await;
        let sync = DirectorySync::contacts(&ctx, &uid("alice")).unwrap();
        assert_eq!(store.listener_count(), 2);

        sync.stop();
        sync.stop();
        assert_eq!(store.listener_count(), 0);
        assert!(!sync.is_running());
    }

    #[tokio::test]
    async fn test_group_members() {
        let (store, ctx) = seeded().await;
        let group = GroupId::new("g1").unwrap();
        store
            .write(
                &StorePath::group(&group),
                Some(json!({"name": "G", "members": ["alice", "bob"], "createdBy": "alice"})),
            )
            .await
            .unwrap();

        let sync = DirectorySync::members(&ctx, &group).unwrap();
        let names: Vec<String> = sync.snapshot().iter().map(|e| e.label().to_string()).collect();
        assert_eq!(names, vec!["Alice", "Bob"]);
    }

    #[tokio::test]
    async fn test_observer_sees_every_snapshot() {
        let (store, ctx) = seeded().await;
        let group = GroupId::new("g1").unwrap();
        store
            .write(
                &StorePath::group(&group),
                Some(json!({"name": "G", "members": ["alice"], "createdBy": "alice"})),
            )
            .await
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let observer: DirectoryObserver = Arc::new(move |entries: &[DirectoryEntry]| {
            sink.lock().push(entries.len());
        });
        let _sync = DirectorySync::members_with(&ctx, &group, Some(observer)).unwrap();

        store
            .write(
                &StorePath::group(&group).child("members").unwrap(),
                Some(json!(["alice", "bob"])),
            )
            .await
            .unwrap();
        assert_eq!(seen.lock().last().copied(), Some(2));
    }

    #[tokio::test]
    async fn test_add_contact_writes_both_sides() {
        let (store, ctx) = seeded().await;
        let entry = add_contact(&ctx, &uid("bob"), " Alice@X.io ", "Al").await.unwrap();
        assert_eq!(entry.contact, uid("alice"));

        let mine = store.read(&StorePath::contact(&uid("bob"), &uid("alice"))).await.unwrap();
        let theirs = store.read(&StorePath::contact(&uid("alice"), &uid("bob"))).await.unwrap();
        assert_eq!(mine, Some(json!({"pseudo": "Al"})));
        assert_eq!(theirs, Some(json!({"pseudo": "Bob"})));
    }

    #[tokio::test]
    async fn test_add_contact_rejections() {
        let (_store, ctx) = seeded().await;
        let missing = add_contact(&ctx, &uid("alice"), "nobody@x.io", "N").await;
        assert!(matches!(missing, Err(ChatError::NotFound(_))));

        let me = add_contact(&ctx, &uid("alice"), "alice@x.io", "Me").await;
        assert!(matches!(me, Err(ChatError::InvalidOperation(_))));
    }

    #[test]
    fn test_filter_is_case_insensitive() {
        let entry = DirectoryEntry::build(
            uid("bob"),
            Some("Bobby".into()),
            Some(&Some(UserProfile::new("Robert", "Bob@X.io", ""))),
            "Unknown",
        );
        let entries = vec![entry];
        assert_eq!(filter_entries(&entries, "bOB").len(), 1);
        assert_eq!(filter_entries(&entries, "x.IO").len(), 1);
        assert_eq!(filter_entries(&entries, "robert").len(), 1);
        assert_eq!(filter_entries(&entries, "carol").len(), 0);
        assert_eq!(filter_entries(&entries, "  ").len(), 1);
    }
}

//! Main ChatEngine - the entry point used by a presentation layer
//!
//! ChatEngine ties the remote store, the identity service and object
//! storage to the sync pipeline of the signed-in user:
//! - Account lifecycle (register, sign in/out, online flag)
//! - Profile edits and avatar upload
//! - Contacts, groups and the aggregated conversation list
//! - Opening conversations, sending messages, typing flags
//!
//! # Example
//!
//! ```ignore
//! use chatsync_core::{ChatConfig, ChatEngine, MessageDraft};
//!
//! let engine = ChatEngine::open("~/.chatsync", ChatConfig::default())?;
//! engine.sign_in("alice@example.com", "secret").await?;
//!
//! engine.add_contact("bob@example.com", "Bobby").await?;
//! let key = engine.direct_key(&bob)?;
//! engine.send_message(&key, MessageDraft::text("hi")).await?;
//!
//! for summary in engine.conversations()? {
//!     println!("{}: {}", summary.display_name, summary.preview(40));
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::chat::{
    self, display_name, ensure_conversation, ConversationKey, ConversationView, DraftAttachment,
    Message, MessageDraft,
};
use crate::config::ChatConfig;
use crate::error::{ChatError, ChatResult};
use crate::services::{BlobObjectStorage, IdentityService, LocalIdentity, ObjectStorage};
use crate::storage::Storage;
use crate::store::{write_with_retry, MemoryStore, RemoteStore, StorePath};
use crate::sync::{
    self, filter_entries, ChatEvent, ConversationSummary, DirectoryEntry, GroupRoster,
    ProfileSync, SyncContext, SyncManager,
};
use crate::types::{ContactEntry, Group, GroupId, ProfileUpdate, UserId, UserProfile};

/// Database file inside the data directory
const DB_FILE: &str = "chatsync.redb";

/// Registration form
#[derive(Debug, Clone, Default)]
pub struct SignUp {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub password: String,
    pub confirm_password: String,
    /// Optional avatar, uploaded before the account is created
    pub avatar: Option<DraftAttachment>,
}

/// Live state of the signed-in user
struct Session {
    user: UserId,
    sync: SyncManager,
    profile: ProfileSync,
}

impl Session {
    fn start(ctx: &SyncContext, user: &UserId) -> ChatResult<Self> {
        Ok(Self {
            user: user.clone(),
            sync: SyncManager::start(ctx, user)?,
            profile: ProfileSync::start(ctx, user)?,
        })
    }

    fn stop(&self) {
        self.sync.stop();
        self.profile.stop();
    }
}

/// Client-side chat engine for one user at a time.
pub struct ChatEngine {
    ctx: SyncContext,
    identity: Arc<dyn IdentityService>,
    objects: Arc<dyn ObjectStorage>,
    session: RwLock<Option<Arc<Session>>>,
    data_dir: Option<PathBuf>,
}

impl ChatEngine {
    /// Build an engine over explicit collaborators.
    pub fn new(
        store: Arc<dyn RemoteStore>,
        identity: Arc<dyn IdentityService>,
        objects: Arc<dyn ObjectStorage>,
        config: ChatConfig,
    ) -> ChatResult<Self> {
        config.validate()?;
        Ok(Self {
            ctx: SyncContext::new(store, config),
            identity,
            objects,
            session: RwLock::new(None),
            data_dir: None,
        })
    }

    /// Engine with an in-memory store, identity service and blob storage.
    pub fn in_memory(config: ChatConfig) -> ChatResult<Self> {
        let objects = BlobObjectStorage::in_memory(config.max_upload_bytes);
        Self::new(
            Arc::new(MemoryStore::new()),
            Arc::new(LocalIdentity::in_memory()),
            Arc::new(objects),
            config,
        )
    }

    /// Engine persisted under `data_dir`.
    ///
    /// The data tree, accounts, the current session and uploaded blobs all
    /// live in one redb database, so a later `open` resumes where this one
    /// stopped.
    ///
    /// # Errors
    ///
    /// Returns `ChatError::Io` if the directory cannot be created.
    /// Returns `ChatError::Database` if the database cannot be opened.
    pub fn open(data_dir: impl AsRef<Path>, config: ChatConfig) -> ChatResult<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        info!(?data_dir, "Opening chat engine");
        std::fs::create_dir_all(&data_dir)?;

        let storage = Storage::new(data_dir.join(DB_FILE))?;
        let store = MemoryStore::with_storage(storage.clone())?;
        let identity = LocalIdentity::open(storage.clone())?;
        let objects = BlobObjectStorage::open(storage, config.max_upload_bytes);

        let mut engine = Self::new(Arc::new(store), Arc::new(identity), Arc::new(objects), config)?;
        engine.data_dir = Some(data_dir);
        Ok(engine)
    }

    /// Data directory, if the engine is persisted
    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    pub fn config(&self) -> &ChatConfig {
        &self.ctx.config
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.ctx.store
    }

    /// Subscribe to chat events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ChatEvent> {
        self.ctx.subscribe_events()
    }

    fn session(&self) -> ChatResult<Arc<Session>> {
        self.session
            .read()
            .clone()
            .ok_or_else(|| ChatError::AuthFailed("No user is signed in".to_string()))
    }

    fn start_session(&self, user: &UserId) -> ChatResult<()> {
        let session = Arc::new(Session::start(&self.ctx, user)?);
        let previous = self.session.write().replace(session);
        if let Some(previous) = previous {
            previous.stop();
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Account Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Register a new account and sign it in.
    ///
    /// The avatar is uploaded first; the credential is only created once the
    /// upload succeeded. The profile is then written to `users/{id}`.
    pub async fn sign_up(&self, form: SignUp) -> ChatResult<UserId> {
        let name = form.name.trim();
        if name.is_empty() {
            return Err(ChatError::InvalidOperation("Name is required".to_string()));
        }
        if form.password != form.confirm_password {
            return Err(ChatError::AuthFailed("Passwords do not match".to_string()));
        }

        let picture = match form.avatar {
            Some(avatar) => Some(
                self.objects
                    .upload(avatar.bytes, &avatar.content_type, &avatar.name)
                    .await?,
            ),
            None => None,
        };

        let user = self.identity.sign_up(&form.email, &form.password).await?;
        let mut profile = UserProfile::new(name, form.email.trim(), form.phone.trim());
        profile.picture = picture;
        profile.online = true;
        let record = serde_json::to_value(&profile)?;
        let path = StorePath::user(&user);
        write_with_retry(self.config(), "sign_up", || {
            self.ctx.store.write(&path, Some(record.clone()))
        })
        .await?;

        self.start_session(&user)?;
        info!(%user, "Registered");
        Ok(user)
    }

    /// Authenticate, mark the user online and start syncing.
    pub async fn sign_in(&self, email: &str, password: &str) -> ChatResult<UserId> {
        let user = self.identity.sign_in(email, password).await?;
        self.set_online(&user, true).await?;
        self.start_session(&user)?;
        info!(%user, "Signed in");
        Ok(user)
    }

    /// Resume the identity service's current session, if any.
    ///
    /// Leaves the online flag untouched.
    pub fn resume(&self) -> ChatResult<Option<UserId>> {
        let Some(user) = self.identity.current_user() else {
            return Ok(None);
        };
        let running = self
            .session
            .read()
            .as_ref()
            .map(|s| s.user == user)
            .unwrap_or(false);
        if !running {
            self.start_session(&user)?;
            debug!(%user, "Session resumed");
        }
        Ok(Some(user))
    }

    /// Mark the user offline, cancel every subscription and end the session.
    pub async fn sign_out(&self) -> ChatResult<()> {
        let session = self.session.write().take();
        let user = session
            .as_ref()
            .map(|s| s.user.clone())
            .or_else(|| self.identity.current_user());
        if let Some(session) = session {
            session.stop();
        }

        if let Some(user) = &user {
            if let Err(e) = self.set_online(user, false).await {
                warn!(%user, error = ?e, "Could not clear online flag");
            }
        }
        self.identity.sign_out().await?;
        if let Some(user) = user {
            info!(%user, "Signed out");
        }
        Ok(())
    }

    /// Signed-in user, if any
    pub fn current_user(&self) -> Option<UserId> {
        self.session.read().as_ref().map(|s| s.user.clone())
    }

    pub async fn send_password_reset(&self, email: &str) -> ChatResult<()> {
        self.identity.send_password_reset(email).await
    }

    async fn set_online(&self, user: &UserId, online: bool) -> ChatResult<()> {
        let mut fields = Map::new();
        fields.insert("online".to_string(), Value::Bool(online));
        let path = StorePath::user(user);
        write_with_retry(self.config(), "set_online", || {
            self.ctx.store.update(&path, fields.clone())
        })
        .await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Profile Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Profile of the signed-in user
    pub fn profile(&self) -> ChatResult<Option<UserProfile>> {
        Ok(self.session()?.profile.snapshot())
    }

    pub fn watch_profile(&self) -> ChatResult<watch::Receiver<Option<UserProfile>>> {
        Ok(self.session()?.profile.watch())
    }

    /// Live profile of any user (conversation headers)
    pub fn watch_user(&self, user: &UserId) -> ChatResult<ProfileSync> {
        ProfileSync::start(&self.ctx, user)
    }

    /// Write the set fields of `update` to the signed-in user's profile.
    pub async fn update_profile(&self, update: ProfileUpdate) -> ChatResult<()> {
        let session = self.session()?;
        if update.is_empty() {
            return Err(ChatError::InvalidOperation("Nothing to update".to_string()));
        }
        let fields = update.to_fields();
        let path = StorePath::user(&session.user);
        write_with_retry(self.config(), "update_profile", || {
            self.ctx.store.update(&path, fields.clone())
        })
        .await?;
        info!(user = %session.user, fields = fields.len(), "Profile updated");
        Ok(())
    }

    /// Upload a new avatar, then point the profile at it.
    pub async fn upload_avatar(&self, bytes: Vec<u8>, content_type: &str) -> ChatResult<String> {
        self.session()?;
        let uri = self.objects.upload(bytes, content_type, "avatar").await?;
        self.update_profile(ProfileUpdate {
            picture: Some(uri.clone()),
            ..Default::default()
        })
        .await?;
        Ok(uri)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Contacts and Groups
    // ═══════════════════════════════════════════════════════════════════════

    /// Add the user registered under `email` as a contact labelled `alias`.
    pub async fn add_contact(&self, email: &str, alias: &str) -> ChatResult<ContactEntry> {
        let session = self.session()?;
        sync::add_contact(&self.ctx, &session.user, email, alias).await
    }

    /// Resolved contacts of the signed-in user
    pub fn contacts(&self) -> ChatResult<Vec<DirectoryEntry>> {
        Ok(self.session()?.sync.contacts().snapshot())
    }

    pub fn watch_contacts(&self) -> ChatResult<watch::Receiver<Vec<DirectoryEntry>>> {
        Ok(self.session()?.sync.contacts().watch())
    }

    /// Contacts whose label, name or email contains `query`
    pub fn search_contacts(&self, query: &str) -> ChatResult<Vec<DirectoryEntry>> {
        let contacts = self.contacts()?;
        Ok(filter_entries(&contacts, query).into_iter().cloned().collect())
    }

    /// Create a group with the signed-in user and `members`.
    pub async fn create_group(&self, name: &str, members: &[UserId]) -> ChatResult<Group> {
        let session = self.session()?;
        sync::create_group(&self.ctx, &session.user, name, members).await
    }

    /// Groups of the signed-in user, with rosters
    pub fn groups(&self) -> ChatResult<Vec<GroupRoster>> {
        Ok(self.session()?.sync.groups().snapshot())
    }

    pub fn watch_groups(&self) -> ChatResult<watch::Receiver<Vec<GroupRoster>>> {
        Ok(self.session()?.sync.groups().watch())
    }

    /// Groups whose name contains `query`
    pub fn search_groups(&self, query: &str) -> ChatResult<Vec<GroupRoster>> {
        Ok(self.session()?.sync.groups().filter(query))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Conversations
    // ═══════════════════════════════════════════════════════════════════════

    /// Conversations with at least one message, newest first
    pub fn conversations(&self) -> ChatResult<Vec<ConversationSummary>> {
        Ok(self.session()?.sync.conversations())
    }

    pub fn watch_conversations(&self) -> ChatResult<watch::Receiver<Vec<ConversationSummary>>> {
        Ok(self.session()?.sync.watch_conversations())
    }

    /// Key of the direct conversation with `peer`
    pub fn direct_key(&self, peer: &UserId) -> ChatResult<ConversationKey> {
        ConversationKey::direct(&self.session()?.user, peer)
    }

    /// Display name of a conversation as the signed-in user sees it
    pub fn conversation_name(&self, key: &ConversationKey) -> ChatResult<String> {
        let session = self.session()?;
        let contacts = session.sync.contacts().snapshot();
        let groups = session.sync.groups().groups();
        Ok(display_name(key, &session.user, &contacts, &groups, self.config()))
    }

    /// Participants of `key`, checking the signed-in user is one of them.
    async fn participants(&self, user: &UserId, key: &ConversationKey) -> ChatResult<Vec<UserId>> {
        match key {
            ConversationKey::Direct { low, high } => {
                if !key.involves(user) {
                    return Err(ChatError::InvalidOperation(format!(
                        "{} is not a participant of {}",
                        user, key
                    )));
                }
                Ok(vec![low.clone(), high.clone()])
            }
            ConversationKey::Group(id) => {
                let group = self.load_group(id).await?;
                if !group.is_member(user) {
                    return Err(ChatError::InvalidOperation(format!(
                        "{} is not a member of group {}",
                        user, id
                    )));
                }
                Ok(group.members)
            }
        }
    }

    async fn load_group(&self, id: &GroupId) -> ChatResult<Group> {
        self.ctx
            .store
            .read(&StorePath::group(id))
            .await?
            .as_ref()
            .and_then(|value| Group::from_value(id.as_str(), value))
            .ok_or_else(|| ChatError::NotFound(format!("group {}", id)))
    }

    /// Open a conversation: ensure its record, then follow its feed and
    /// typing flags until the view is closed.
    pub async fn open_conversation(&self, key: &ConversationKey) -> ChatResult<ConversationView> {
        let session = self.session()?;
        let participants = self.participants(&session.user, key).await?;
        ConversationView::open(&self.ctx, key, &session.user, &participants).await
    }

    /// Send `draft` to `key` as the signed-in user.
    pub async fn send_message(
        &self,
        key: &ConversationKey,
        draft: MessageDraft,
    ) -> ChatResult<Message> {
        let session = self.session()?;
        draft.validate()?;
        let participants = self.participants(&session.user, key).await?;
        ensure_conversation(&self.ctx, key, &participants).await?;
        chat::send_message(&self.ctx, self.objects.as_ref(), key, &session.user, draft).await
    }

    /// Set or clear the signed-in user's typing flag in `key`.
    pub async fn set_typing(&self, key: &ConversationKey, is_typing: bool) -> ChatResult<()> {
        let session = self.session()?;
        chat::set_typing(&self.ctx, key, &session.user, is_typing).await
    }

    /// Delete every message of `key`.
    pub async fn delete_conversation(&self, key: &ConversationKey) -> ChatResult<()> {
        let session = self.session()?;
        self.participants(&session.user, key).await?;
        chat::delete_conversation(&self.ctx, key).await
    }
}

impl Drop for ChatEngine {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config() -> ChatConfig {
        ChatConfig {
            retry_delay_ms: 0,
            ..Default::default()
        }
    }

    fn form(name: &str, email: &str) -> SignUp {
        SignUp {
            name: name.to_string(),
            email: email.to_string(),
            phone: "555".to_string(),
            password: "secret1".to_string(),
            confirm_password: "secret1".to_string(),
            avatar: None,
        }
    }

    #[tokio::test]
    async fn test_sign_up_writes_profile() {
        let engine = ChatEngine::in_memory(config()).unwrap();
        let user = engine.sign_up(form("Alice", "alice@x.io")).await.unwrap();

        assert_eq!(engine.current_user(), Some(user));
        let profile = engine.profile().unwrap().unwrap();
        assert_eq!(profile.name, "Alice");
        assert_eq!(profile.phone, "555");
        assert!(profile.online);
    }

    #[tokio::test]
    async fn test_sign_up_rejects_mismatched_passwords() {
        let engine = ChatEngine::in_memory(config()).unwrap();
        let mut bad = form("Alice", "alice@x.io");
        bad.confirm_password = "other".to_string();

        let result = engine.sign_up(bad).await;
        assert!(matches!(result, Err(ChatError::AuthFailed(_))));
        assert!(engine.current_user().is_none());
    }

    #[tokio::test]
    async fn test_sign_in_and_out_toggle_online() {
        let engine = ChatEngine::in_memory(config()).unwrap();
        let user = engine.sign_up(form("Alice", "alice@x.io")).await.unwrap();
        engine.sign_out().await.unwrap();

        let online = StorePath::user(&user).child("online").unwrap();
        assert_eq!(engine.store().read(&online).await.unwrap(), Some(Value::Bool(false)));
        assert!(matches!(engine.contacts(), Err(ChatError::AuthFailed(_))));

        engine.sign_in("alice@x.io", "secret1").await.unwrap();
        assert_eq!(engine.store().read(&online).await.unwrap(), Some(Value::Bool(true)));
    }

    #[tokio::test]
    async fn test_sign_out_releases_listeners() {
        let store = Arc::new(MemoryStore::new());
        let engine = ChatEngine::new(
            store.clone(),
            Arc::new(LocalIdentity::in_memory()),
            Arc::new(BlobObjectStorage::in_memory(1024)),
            config(),
        )
        .unwrap();
        engine.sign_up(form("Alice", "alice@x.io")).await.unwrap();
        assert!(store.listener_count() > 0);

        engine.sign_out().await.unwrap();
        assert_eq!(store.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_avatar_upload_updates_profile() {
        let engine = ChatEngine::in_memory(config()).unwrap();
        engine.sign_up(form("Alice", "alice@x.io")).await.unwrap();

        let uri = engine.upload_avatar(vec![1, 2, 3], "image/png").await.unwrap();
        assert_eq!(engine.profile().unwrap().unwrap().picture, Some(uri));
    }

    #[tokio::test]
    async fn test_send_to_group_requires_membership() {
        let engine = ChatEngine::in_memory(config()).unwrap();
        let alice = engine.sign_up(form("Alice", "alice@x.io")).await.unwrap();
        let bob = engine.sign_up(form("Bob", "bob@x.io")).await.unwrap();
        engine.sign_up(form("Carol", "carol@x.io")).await.unwrap();

        // carol is signed in now
        let group = engine.create_group("Pair", &[alice.clone()]).await.unwrap();
        let key = ConversationKey::group(&group.id);
        engine.send_message(&key, MessageDraft::text("hi")).await.unwrap();

        engine.sign_in("bob@x.io", "secret1").await.unwrap();
        assert_eq!(engine.current_user(), Some(bob));
        let result = engine.send_message(&key, MessageDraft::text("let me in")).await;
        assert!(matches!(result, Err(ChatError::InvalidOperation(_))));
    }

    #[tokio::test]
    async fn test_open_persisted_engine_resumes_session() {
        let dir = tempdir().unwrap();
        let user = {
            let engine = ChatEngine::open(dir.path(), config()).unwrap();
            engine.sign_up(form("Alice", "alice@x.io")).await.unwrap()
        };

        let engine = ChatEngine::open(dir.path(), config()).unwrap();
        assert_eq!(engine.resume().unwrap(), Some(user));
        assert_eq!(engine.profile().unwrap().unwrap().name, "Alice");
        assert_eq!(engine.data_dir(), Some(dir.path()));
    }
}

//! An open conversation: live feed plus live typing flags
//!
//! Also holds the naming rules shared by the conversation list and the
//! conversation header.

use tokio::sync::watch;
use tracing::debug;

use super::feed::MessageFeed;
use super::key::{ensure_conversation, ConversationKey};
use super::message::Message;
use super::typing::{TypingChannel, TypingFlags};
use crate::config::ChatConfig;
use crate::error::ChatResult;
use crate::sync::{DirectoryEntry, SyncContext};
use crate::types::{Group, UserId};

/// Display name of a conversation as seen by `me`.
///
/// Direct: the contact's label (pseudo, else profile name), or the
/// unknown-contact name when the peer is not in `contacts`.
/// Group: the group name, or the unnamed-group name when blank.
pub fn display_name(
    key: &ConversationKey,
    me: &UserId,
    contacts: &[DirectoryEntry],
    groups: &[Group],
    config: &ChatConfig,
) -> String {
    match key {
        ConversationKey::Direct { .. } => key
            .peer_of(me)
            .and_then(|peer| contacts.iter().find(|c| &c.id == peer))
            .map(|c| c.label().to_string())
            .unwrap_or_else(|| config.unknown_contact_name.clone()),
        ConversationKey::Group(id) => groups
            .iter()
            .find(|g| &g.id == id)
            .map(|g| g.name.trim())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| config.unnamed_group_name.clone()),
    }
}

/// A conversation opened by the presentation layer.
///
/// Closing (or dropping) the view cancels both subscriptions.
pub struct ConversationView {
    key: ConversationKey,
    me: UserId,
    feed: MessageFeed,
    typing: TypingChannel,
}

impl ConversationView {
    /// Ensure the conversation record exists, then subscribe to its feed
    /// and typing flags.
    pub async fn open(
        ctx: &SyncContext,
        key: &ConversationKey,
        me: &UserId,
        participants: &[UserId],
    ) -> ChatResult<Self> {
        let created = ensure_conversation(ctx, key, participants).await?;
        let feed = MessageFeed::subscribe(ctx, key)?;
        let typing = TypingChannel::subscribe(ctx, key)?;
        debug!(%key, created, "Conversation opened");
        Ok(Self {
            key: key.clone(),
            me: me.clone(),
            feed,
            typing,
        })
    }

    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    /// Ordered messages
    pub fn messages(&self) -> Vec<Message> {
        self.feed.snapshot()
    }

    pub fn watch_messages(&self) -> watch::Receiver<Vec<Message>> {
        self.feed.watch()
    }

    pub fn typing(&self) -> TypingFlags {
        self.typing.snapshot()
    }

    pub fn watch_typing(&self) -> watch::Receiver<TypingFlags> {
        self.typing.watch()
    }

    /// Whether someone other than the local user is typing
    pub fn others_typing(&self) -> bool {
        self.typing.snapshot().others_typing(&self.me)
    }

    pub fn close(&self) {
        self.feed.stop();
        self.typing.stop();
        debug!(key = %self.key, "Conversation closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::EntryState;
    use crate::types::GroupId;

    fn uid(s: &str) -> UserId {
        UserId::new(s).unwrap()
    }

    fn contact(id: &str, alias: &str, name: &str) -> DirectoryEntry {
        DirectoryEntry {
            id: uid(id),
            alias: Some(alias.to_string()),
            name: name.to_string(),
            email: None,
            phone: None,
            picture: None,
            online: false,
            state: EntryState::Resolved,
        }
    }

    #[test]
    fn test_direct_names() {
        let config = ChatConfig::default();
        let me = uid("alice");
        let contacts = vec![contact("bob", "Bobby", "Bob"), contact("carol", "", "Carol")];

        let bob = ConversationKey::direct(&me, &uid("bob")).unwrap();
        let carol = ConversationKey::direct(&me, &uid("carol")).unwrap();
        let dave = ConversationKey::direct(&me, &uid("dave")).unwrap();

        assert_eq!(display_name(&bob, &me, &contacts, &[], &config), "Bobby");
        assert_eq!(display_name(&carol, &me, &contacts, &[], &config), "Carol");
        assert_eq!(display_name(&dave, &me, &contacts, &[], &config), "Unknown User");
    }

    #[test]
    fn test_group_names() {
        let config = ChatConfig::default();
        let me = uid("alice");
        let named = Group::new(GroupId::new("g1").unwrap(), "Hikers", vec![], me.clone(), 0);
        let blank = Group::new(GroupId::new("g2").unwrap(), "  ", vec![], me.clone(), 0);
        let groups = vec![named, blank];

        let g1 = ConversationKey::group(&GroupId::new("g1").unwrap());
        let g2 = ConversationKey::group(&GroupId::new("g2").unwrap());
        let g3 = ConversationKey::group(&GroupId::new("g3").unwrap());
        assert_eq!(display_name(&g1, &me, &[], &groups, &config), "Hikers");
        assert_eq!(display_name(&g2, &me, &[], &groups, &config), "Unnamed Group");
        assert_eq!(display_name(&g3, &me, &[], &groups, &config), "Unnamed Group");
    }
}

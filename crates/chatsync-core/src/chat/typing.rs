//! Typing state channel
//!
//! `chats/{key}/typingStates` holds one boolean per participant. Each client
//! writes only its own flag with a partial update, so two participants
//! typing at once never clear each other's flag.
//!
//! Flags carry no timestamp and never expire: a client that disconnects
//! while typing leaves its flag set until it next clears it.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::trace;

use super::key::ConversationKey;
use crate::error::ChatResult;
use crate::store::{write_with_retry, StorePath};
use crate::sync::{ChatEvent, Subscription, SyncContext};
use crate::types::UserId;

/// All typing flags of one conversation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypingFlags {
    flags: BTreeMap<UserId, bool>,
}

impl TypingFlags {
    /// Decode the `typingStates` map. Non-boolean entries are ignored.
    pub fn from_value(value: Option<&Value>) -> Self {
        let flags = value
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(id, flag)| Some((UserId::new(id.as_str()).ok()?, flag.as_bool()?)))
                    .collect()
            })
            .unwrap_or_default();
        Self { flags }
    }

    pub fn is_typing(&self, user: &UserId) -> bool {
        self.flags.get(user).copied().unwrap_or(false)
    }

    /// Users whose flag is set
    pub fn typing_users(&self) -> Vec<UserId> {
        self.flags
            .iter()
            .filter(|(_, typing)| **typing)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Whether anyone other than `me` is typing
    pub fn others_typing(&self, me: &UserId) -> bool {
        self.flags.iter().any(|(id, typing)| *typing && id != me)
    }
}

/// Set or clear `user`'s typing flag without touching anyone else's.
pub async fn set_typing(
    ctx: &SyncContext,
    key: &ConversationKey,
    user: &UserId,
    is_typing: bool,
) -> ChatResult<()> {
    let path = StorePath::typing_states(key);
    let mut fields = Map::new();
    fields.insert(user.to_string(), Value::Bool(is_typing));

    write_with_retry(&ctx.config, "set_typing", || ctx.store.update(&path, fields.clone())).await?;
    trace!(%key, %user, is_typing, "Typing flag written");
    Ok(())
}

/// Live typing flags of one conversation
pub struct TypingChannel {
    key: ConversationKey,
    tx: Arc<watch::Sender<TypingFlags>>,
    subscription: Subscription,
}

impl TypingChannel {
    pub fn subscribe(ctx: &SyncContext, key: &ConversationKey) -> ChatResult<Self> {
        let (tx, _) = watch::channel(TypingFlags::default());
        let tx = Arc::new(tx);
        let publisher = tx.clone();
        let events = ctx.clone();
        let channel_key = key.clone();

        let subscription = Subscription::open(ctx, StorePath::typing_states(key), move |value| {
            let flags = TypingFlags::from_value(value.as_ref());
            let typing = flags.typing_users();
            publisher.send_replace(flags);
            events.emit(ChatEvent::TypingChanged {
                key: channel_key.clone(),
                typing,
            });
        })?;

        Ok(Self {
            key: key.clone(),
            tx,
            subscription,
        })
    }

    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    pub fn snapshot(&self) -> TypingFlags {
        self.tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<TypingFlags> {
        self.tx.subscribe()
    }

    pub fn stop(&self) {
        self.subscription.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChatConfig;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn uid(s: &str) -> UserId {
        UserId::new(s).unwrap()
    }

    #[test]
    fn test_flags_decoding() {
        let flags = TypingFlags::from_value(Some(&json!({"alice": true, "bob": false, "x": "yes"})));
        assert!(flags.is_typing(&uid("alice")));
        assert!(!flags.is_typing(&uid("bob")));
        assert!(!flags.is_typing(&uid("x")));
        assert_eq!(flags.typing_users(), vec![uid("alice")]);
        assert!(flags.others_typing(&uid("bob")));
        assert!(!flags.others_typing(&uid("alice")));
    }

    #[tokio::test]
    async fn test_set_typing_never_clobbers_others() {
        let store = Arc::new(MemoryStore::new());
        let ctx = SyncContext::new(store.clone(), ChatConfig::default());
        let (alice, bob) = (uid("alice"), uid("bob"));
        let key = ConversationKey::direct(&alice, &bob).unwrap();
        let channel = TypingChannel::subscribe(&ctx, &key).unwrap();

        set_typing(&ctx, &key, &alice, true).await.unwrap();
        set_typing(&ctx, &key, &bob, true).await.unwrap();

        let flags = channel.snapshot();
        assert!(flags.is_typing(&alice));
        assert!(flags.is_typing(&bob));

        set_typing(&ctx, &key, &alice, false).await.unwrap();
        let flags = channel.snapshot();
        assert!(!flags.is_typing(&alice));
        assert!(flags.is_typing(&bob));
        assert!(flags.others_typing(&alice));
        assert!(!flags.others_typing(&bob));
    }
}

//! Conversation identity
//!
//! A conversation key is derived from who takes part in it, never
//! allocated, so both sides of a direct chat compute the same key without
//! coordinating.
//!
//! ```text
//! direct:  dm~{lower id}~{higher id}     dm~alice~bob
//! group:   grp~{group id}                grp~01HV3K...
//! ```
//!
//! Identifiers can never contain `~` (see [`RESERVED_ID_CHARS`]), so a
//! direct key always has exactly three `~`-separated parts and a group key
//! exactly two. The two forms cannot collide whatever the ids are.
//!
//! [`RESERVED_ID_CHARS`]: crate::types::RESERVED_ID_CHARS

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{ChatError, ChatResult};
use crate::store::{write_with_retry, StorePath};
use crate::sync::SyncContext;
use crate::types::{GroupId, UserId};

const DIRECT_PREFIX: &str = "dm";
const GROUP_PREFIX: &str = "grp";
const SEPARATOR: char = '~';

/// Stable identifier of a direct or group conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ConversationKey {
    /// One-to-one conversation; ids are kept in ascending order
    Direct { low: UserId, high: UserId },
    /// Group conversation
    Group(GroupId),
}

impl ConversationKey {
    /// Key of the conversation between `a` and `b`, independent of argument order.
    pub fn direct(a: &UserId, b: &UserId) -> ChatResult<Self> {
        if a == b {
            return Err(ChatError::InvalidOperation(format!(
                "a direct conversation needs two distinct users, got {} twice",
                a
            )));
        }
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        Ok(Self::Direct {
            low: low.clone(),
            high: high.clone(),
        })
    }

    /// Key of a group's conversation
    pub fn group(id: &GroupId) -> Self {
        Self::Group(id.clone())
    }

    /// Parse a key produced by [`ConversationKey::to_string`].
    pub fn parse(key: &str) -> ChatResult<Self> {
        let invalid = || ChatError::InvalidOperation(format!("invalid conversation key {:?}", key));
        let parts: Vec<&str> = key.split(SEPARATOR).collect();
        match parts.as_slice() {
            [DIRECT_PREFIX, low, high] => {
                let low = UserId::new(*low).map_err(|_| invalid())?;
                let high = UserId::new(*high).map_err(|_| invalid())?;
                if low >= high {
                    return Err(invalid());
                }
                Ok(Self::Direct { low, high })
            }
            [GROUP_PREFIX, id] => Ok(Self::Group(GroupId::new(*id).map_err(|_| invalid())?)),
            _ => Err(invalid()),
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Self::Group(_))
    }

    pub fn group_id(&self) -> Option<&GroupId> {
        match self {
            Self::Group(id) => Some(id),
            Self::Direct { .. } => None,
        }
    }

    /// For a direct conversation, the participant that is not `me`.
    pub fn peer_of(&self, me: &UserId) -> Option<&UserId> {
        match self {
            Self::Direct { low, high } if low == me => Some(high),
            Self::Direct { low, high } if high == me => Some(low),
            _ => None,
        }
    }

    /// Whether `user` is one of the two ids of a direct key
    pub fn involves(&self, user: &UserId) -> bool {
        match self {
            Self::Direct { low, high } => low == user || high == user,
            Self::Group(_) => false,
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct { low, high } => {
                write!(f, "{DIRECT_PREFIX}{SEPARATOR}{low}{SEPARATOR}{high}")
            }
            Self::Group(id) => write!(f, "{GROUP_PREFIX}{SEPARATOR}{id}"),
        }
    }
}

impl FromStr for ConversationKey {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ConversationKey {
    type Error = ChatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ConversationKey> for String {
    fn from(key: ConversationKey) -> Self {
        key.to_string()
    }
}

/// Create the conversation record if it does not exist yet.
///
/// Writes only `chats/{key}/users`, so a record created concurrently by
/// the other participant keeps its messages. Two clients racing here both
/// write the same participant set; the later write wins.
///
/// The record write is retried after a rejected write like any other
/// mutation. Returns `true` if this call created the record.
pub async fn ensure_conversation(
    ctx: &SyncContext,
    key: &ConversationKey,
    participants: &[UserId],
) -> ChatResult<bool> {
    let store = ctx.store.as_ref();
    let users_path = StorePath::chat_users(key);
    if store.read(&users_path).await?.is_some() {
        return Ok(false);
    }
    if store.read(&StorePath::messages(key)).await?.is_some() {
        // Messages exist without a participant record (written by an older
        // client); treat the conversation as existing.
        return Ok(false);
    }

    let users: Map<String, Value> = participants
        .iter()
        .map(|id| (id.to_string(), Value::Bool(true)))
        .collect();
    if users.is_empty() {
        return Err(ChatError::InvalidOperation(format!(
            "conversation {} has no participants",
            key
        )));
    }
    let mut fields = Map::new();
    fields.insert("users".to_string(), Value::Object(users));
    let path = StorePath::chat(key);
    write_with_retry(&ctx.config, "ensure_conversation", || {
        store.update(&path, fields.clone())
    })
    .await?;

    debug!(%key, participants = participants.len(), "Created conversation record");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChatConfig;
    use crate::store::{MemoryStore, RemoteStore};
    use serde_json::json;
    use std::sync::Arc;

    fn uid(s: &str) -> UserId {
        UserId::new(s).unwrap()
    }

    #[test]
    fn test_direct_key_is_order_independent() {
        let ab = ConversationKey::direct(&uid("alice"), &uid("bob")).unwrap();
        let ba = ConversationKey::direct(&uid("bob"), &uid("alice")).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.to_string(), "dm~alice~bob");
    }

    #[test]
    fn test_direct_key_rejects_self() {
        assert!(ConversationKey::direct(&uid("alice"), &uid("alice")).is_err());
    }

    #[test]
    fn test_group_key_format() {
        let key = ConversationKey::group(&GroupId::new("g1").unwrap());
        assert_eq!(key.to_string(), "grp~g1");
        assert!(key.is_group());
    }

    #[test]
    fn test_parse_roundtrip_and_rejects() {
        for raw in ["dm~a~b", "grp~g1"] {
            assert_eq!(ConversationKey::parse(raw).unwrap().to_string(), raw);
        }
        for bad in ["", "dm~b~a", "dm~a~a", "dm~a", "grp~", "grp~a~b", "x~a", "a_b", "g1__"] {
            assert!(ConversationKey::parse(bad).is_err(), "{:?} should fail", bad);
        }
    }

    #[test]
    fn test_group_key_never_equals_direct_key() {
        // A group id that looks like a direct key still gets a distinct key
        let group = ConversationKey::group(&GroupId::new("dm").unwrap());
        let direct = ConversationKey::direct(&uid("a"), &uid("b")).unwrap();
        assert_ne!(group.to_string(), direct.to_string());
    }

    #[test]
    fn test_peer_of() {
        let key = ConversationKey::direct(&uid("alice"), &uid("bob")).unwrap();
        assert_eq!(key.peer_of(&uid("alice")), Some(&uid("bob")));
        assert_eq!(key.peer_of(&uid("bob")), Some(&uid("alice")));
        assert_eq!(key.peer_of(&uid("carol")), None);
    }

    #[test]
    fn test_serde_as_string() {
        let key = ConversationKey::direct(&uid("a"), &uid("b")).unwrap();
        assert_eq!(serde_json::to_value(&key).unwrap(), json!("dm~a~b"));
        let back: ConversationKey = serde_json::from_value(json!("dm~a~b")).unwrap();
        assert_eq!(back, key);
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent_and_keeps_messages() {
        let store = Arc::new(MemoryStore::new());
        let ctx = SyncContext::new(store.clone(), ChatConfig::default());
        let key = ConversationKey::direct(&uid("alice"), &uid("bob")).unwrap();
        let both = [uid("alice"), uid("bob")];

        assert!(ensure_conversation(&ctx, &key, &both).await.unwrap());
        store
            .write(
                &StorePath::messages(&key).child("m1").unwrap(),
                Some(json!({"sender": "bob", "text": "hi", "timestamp": 1})),
            )
            .await
            .unwrap();
        assert!(!ensure_conversation(&ctx, &key, &both).await.unwrap());

        let record = store.read(&StorePath::chat(&key)).await.unwrap().unwrap();
        assert_eq!(record["users"], json!({"alice": true, "bob": true}));
        assert_eq!(record["messages"]["m1"]["text"], json!("hi"));
    }

    #[tokio::test]
    async fn test_ensure_retries_rejected_write() {
        let store = Arc::new(MemoryStore::new());
        let ctx = SyncContext::new(store.clone(), ChatConfig::default());
        let key = ConversationKey::direct(&uid("alice"), &uid("bob")).unwrap();
        let both = [uid("alice"), uid("bob")];

        store.fail_next_writes(1);
        assert!(ensure_conversation(&ctx, &key, &both).await.unwrap());
        assert!(store.read(&StorePath::chat_users(&key)).await.unwrap().is_some());

        let other = ConversationKey::direct(&uid("alice"), &uid("carol")).unwrap();
        store.fail_next_writes(2);
        let result = ensure_conversation(&ctx, &other, &[uid("alice"), uid("carol")]).await;
        assert!(matches!(result, Err(ChatError::WriteConflict(_))));
    }
}

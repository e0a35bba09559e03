//! Message feed sync: the live ordered log of one conversation
//!
//! The store delivers `chats/{key}/messages` as an unordered keyed map.
//! Every notification is decoded from scratch into a list sorted by
//! `(timestamp, id)`, so the published order never depends on arrival
//! order.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info};

use super::key::ConversationKey;
use super::message::{Attachment, Message, MessageDraft};
use crate::error::{ChatError, ChatResult};
use crate::services::ObjectStorage;
use crate::store::{write_with_retry, StorePath};
use crate::sync::{ChatEvent, SharedSubscription, SyncContext};
use crate::types::{now_millis, MessageId, UserId};

/// Decode a messages map into a feed sorted ascending by timestamp.
///
/// Invalid records are skipped.
pub fn parse_messages(value: Option<&Value>) -> Vec<Message> {
    let Some(map) = value.and_then(Value::as_object) else {
        return Vec::new();
    };
    let mut messages: Vec<Message> = map
        .iter()
        .filter_map(|(id, record)| Message::from_value(id, record))
        .collect();
    sort_messages(&mut messages);
    messages
}

/// Sort by timestamp, then by store key (allocation order).
pub fn sort_messages(messages: &mut [Message]) {
    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
}

/// Callback receiving every republished feed
pub type FeedHandler = Arc<dyn Fn(&ConversationKey, &[Message]) + Send + Sync>;

/// Live feed of one conversation.
///
/// Every feed of the same conversation in one [`SyncContext`] (the
/// conversation list and an open conversation) shares one store listener.
pub struct MessageFeed {
    key: ConversationKey,
    tx: Arc<watch::Sender<Vec<Message>>>,
    subscription: SharedSubscription,
}

impl MessageFeed {
    /// Subscribe to the feed of `key`.
    pub fn subscribe(ctx: &SyncContext, key: &ConversationKey) -> ChatResult<Self> {
        Self::open(ctx, key, None)
    }

    /// Subscribe and also hand every republished feed to `on_messages`.
    pub fn open(
        ctx: &SyncContext,
        key: &ConversationKey,
        on_messages: Option<FeedHandler>,
    ) -> ChatResult<Self> {
        let (tx, _) = watch::channel(Vec::new());
        let tx = Arc::new(tx);
        let publisher = tx.clone();
        let events = ctx.clone();
        let feed_key = key.clone();

        let subscription = ctx.subscribe_shared(StorePath::messages(key), move |value| {
            let messages = parse_messages(value.as_ref());
            let count = messages.len();
            if let Some(handler) = &on_messages {
                handler(&feed_key, &messages);
            }
            publisher.send_replace(messages);
            events.emit(ChatEvent::FeedChanged {
                key: feed_key.clone(),
                messages: count,
            });
        })?;
        debug!(%key, "Feed subscribed");

        Ok(Self {
            key: key.clone(),
            tx,
            subscription,
        })
    }

    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    /// Current ordered messages
    pub fn snapshot(&self) -> Vec<Message> {
        self.tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Vec<Message>> {
        self.tx.subscribe()
    }

    /// Most recent message, if any
    pub fn latest(&self) -> Option<Message> {
        self.tx.borrow().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.tx.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.borrow().is_empty()
    }

    pub fn stop(&self) {
        self.subscription.cancel();
    }
}

/// Send a message to `key`.
///
/// The attachment, if any, is uploaded first; an upload failure aborts the
/// send before anything is written. The message key is allocated with
/// `append_child`, so concurrent senders never share a slot. Resolves once
/// the store acknowledged the write.
pub async fn send_message(
    ctx: &SyncContext,
    objects: &dyn ObjectStorage,
    key: &ConversationKey,
    sender: &UserId,
    draft: MessageDraft,
) -> ChatResult<Message> {
    draft.validate()?;
    let (text, file) = draft.into_parts();

    let attachment = match file {
        Some(file) => {
            let uri = objects
                .upload(file.bytes, &file.content_type, &file.name)
                .await
                .map_err(|e| match e {
                    ChatError::UploadFailed(_) => e,
                    other => ChatError::UploadFailed(other.to_string()),
                })?;
            Some(Attachment {
                uri,
                content_type: file.content_type,
                name: file.name,
            })
        }
        None => None,
    };

    let slot = ctx.store.append_child(&StorePath::messages(key)).await?;
    let message = Message {
        id: MessageId::new(slot)?,
        sender: sender.clone(),
        text,
        timestamp: now_millis(),
        attachment,
    };
    let record = serde_json::to_value(message.to_record())?;
    let path = StorePath::message(key, &message.id);

    write_with_retry(&ctx.config, "send_message", || {
        ctx.store.write(&path, Some(record.clone()))
    })
    .await?;

    info!(%key, id = %message.id, "Message sent");
    ctx.emit(ChatEvent::MessageSent {
        key: key.clone(),
        id: message.id.clone(),
    });
    Ok(message)
}

/// Delete a whole conversation: messages, typing flags and participants.
///
/// Subscribers see an empty feed.
pub async fn delete_conversation(ctx: &SyncContext, key: &ConversationKey) -> ChatResult<()> {
    let path = StorePath::chat(key);
    write_with_retry(&ctx.config, "delete_conversation", || ctx.store.write(&path, None)).await?;

    info!(%key, "Conversation deleted");
    ctx.emit(ChatEvent::ConversationDeleted { key: key.clone() });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChatConfig;
    use crate::services::BlobObjectStorage;
    use crate::store::{MemoryStore, RemoteStore};
    use serde_json::json;

    fn uid(s: &str) -> UserId {
        UserId::new(s).unwrap()
    }

    fn setup() -> (Arc<MemoryStore>, SyncContext, ConversationKey) {
        let store = Arc::new(MemoryStore::new());
        let config = ChatConfig {
            retry_delay_ms: 0,
            ..Default::default()
        };
        let ctx = SyncContext::new(store.clone(), config);
        let key = ConversationKey::direct(&uid("alice"), &uid("bob")).unwrap();
        (store, ctx, key)
    }

    #[test]
    fn test_parse_sorts_by_timestamp() {
        let value = json!({
            "c": {"sender": "a", "text": "third", "timestamp": 30},
            "a": {"sender": "a", "text": "second", "timestamp": 20},
            "b": {"sender": "b", "text": "first", "timestamp": 10},
            "bad": {"text": "no sender", "timestamp": 1},
        });
        let texts: Vec<String> = parse_messages(Some(&value)).into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
        assert!(parse_messages(None).is_empty());
    }

    #[tokio::test]
    async fn test_send_appears_in_feed() {
        let (_store, ctx, key) = setup();
        let objects = BlobObjectStorage::in_memory(1024);
        let feed = MessageFeed::subscribe(&ctx, &key).unwrap();
        assert!(feed.is_empty());

        send_message(&ctx, &objects, &key, &uid("alice"), MessageDraft::text("hi"))
            .await
            .unwrap();
        send_message(&ctx, &objects, &key, &uid("bob"), MessageDraft::text("hey"))
            .await
            .unwrap();

        let messages = feed.snapshot();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].text, "hi");
        assert_eq!(feed.latest().unwrap().sender, uid("bob"));
    }

    #[tokio::test]
    async fn test_feeds_of_one_conversation_share_listener() {
        let (store, ctx, key) = setup();
        let objects = BlobObjectStorage::in_memory(1024);
        let listed = MessageFeed::subscribe(&ctx, &key).unwrap();
        let opened = MessageFeed::subscribe(&ctx, &key).unwrap();
        assert_eq!(store.listener_count_at(&StorePath::messages(&key)), 1);

        send_message(&ctx, &objects, &key, &uid("alice"), MessageDraft::text("hi"))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(opened.len(), 1);

        opened.stop();
        send_message(&ctx, &objects, &key, &uid("bob"), MessageDraft::text("hey"))
            .await
            .unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(opened.len(), 1);
        assert_eq!(store.listener_count_at(&StorePath::messages(&key)), 1);

        drop(listed);
        assert_eq!(store.listener_count_at(&StorePath::messages(&key)), 0);
    }

    #[tokio::test]
    async fn test_attachment_uploaded_before_write() {
        let (_store, ctx, key) = setup();
        let objects = BlobObjectStorage::in_memory(1024);
        let feed = MessageFeed::subscribe(&ctx, &key).unwrap();

        let draft = MessageDraft::text("").with_attachment(vec![1, 2, 3], "image/png", "a.png");
        let sent = send_message(&ctx, &objects, &key, &uid("alice"), draft).await.unwrap();

        let file = sent.attachment.unwrap();
        assert!(objects.contains(&file.uri));
        assert_eq!(feed.snapshot()[0].attachment.as_ref().unwrap().name, "a.png");
    }

    #[tokio::test]
    async fn test_failed_upload_writes_nothing() {
        let (store, ctx, key) = setup();
        let objects = BlobObjectStorage::in_memory(1024);
        objects.fail_next_uploads(1);

        let draft = MessageDraft::text("look").with_attachment(vec![9], "image/png", "x.png");
        let result = send_message(&ctx, &objects, &key, &uid("alice"), draft).await;

        assert!(matches!(result, Err(ChatError::UploadFailed(_))));
        assert_eq!(store.read(&StorePath::messages(&key)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_blank_draft_rejected() {
        let (_store, ctx, key) = setup();
        let objects = BlobObjectStorage::in_memory(1024);
        let result = send_message(&ctx, &objects, &key, &uid("alice"), MessageDraft::text("  ")).await;
        assert!(matches!(result, Err(ChatError::InvalidOperation(_))));
    }

    #[tokio::test]
    async fn test_write_conflict_retried_once() {
        let (store, ctx, key) = setup();
        let objects = BlobObjectStorage::in_memory(1024);

        store.fail_next_writes(1);
        send_message(&ctx, &objects, &key, &uid("alice"), MessageDraft::text("one"))
            .await
            .unwrap();

        store.fail_next_writes(2);
        let result =
            send_message(&ctx, &objects, &key, &uid("alice"), MessageDraft::text("two")).await;
        assert!(matches!(result, Err(ChatError::WriteConflict(_))));

        let stored = store.read(&StorePath::messages(&key)).await.unwrap();
        assert_eq!(parse_messages(stored.as_ref()).len(), 1);
    }

    #[tokio::test]
    async fn test_delete_publishes_empty_feed() {
        let (_store, ctx, key) = setup();
        let objects = BlobObjectStorage::in_memory(1024);
        let feed = MessageFeed::subscribe(&ctx, &key).unwrap();
        send_message(&ctx, &objects, &key, &uid("alice"), MessageDraft::text("bye"))
            .await
            .unwrap();
        assert_eq!(feed.len(), 1);

        delete_conversation(&ctx, &key).await.unwrap();
        assert!(feed.is_empty());
    }
}

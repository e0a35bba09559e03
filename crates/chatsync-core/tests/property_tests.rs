//! Property-based tests for keys, paths and derived lists
//!
//! Uses proptest to verify the invariants the sync pipeline relies on:
//! conversation keys are symmetric, feeds and conversation lists have a
//! total order that does not depend on arrival order.

use std::collections::{BTreeMap, HashMap};

use chatsync_core::chat::sort_messages;
use chatsync_core::sync::{summarize, ConversationSource};
use chatsync_core::{ConversationKey, Message, MessageId, StorePath, UserId};
use proptest::prelude::*;

// ============================================================================
// Strategy Generators
// ============================================================================

fn user_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z0-9_-]{1,16}").expect("valid regex")
}

/// Two distinct user ids
fn user_pair_strategy() -> impl Strategy<Value = (String, String)> {
    (user_id_strategy(), user_id_strategy()).prop_filter("distinct", |(a, b)| a != b)
}

fn segment_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z0-9_-]{1,10}").expect("valid regex")
}

/// Messages with unique ids and arbitrary (often colliding) timestamps
fn messages_strategy(max: usize) -> impl Strategy<Value = Vec<Message>> {
    prop::collection::vec((0..50i64, "[a-z ]{0,20}"), 0..max).prop_map(|specs| {
        specs
            .into_iter()
            .enumerate()
            .map(|(i, (timestamp, text))| Message {
                id: MessageId::new(format!("m{:04}", i)).unwrap(),
                sender: UserId::new("alice").unwrap(),
                text,
                timestamp,
                attachment: None,
            })
            .collect()
    })
}

fn message(key: &ConversationKey, timestamp: i64) -> Message {
    Message {
        id: MessageId::new(format!("last-{}", timestamp)).unwrap(),
        sender: UserId::new("alice").unwrap(),
        text: key.to_string(),
        timestamp,
        attachment: None,
    }
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    /// Both participants compute the same direct key
    #[test]
    fn direct_key_is_symmetric((a, b) in user_pair_strategy()) {
        let a = UserId::new(a).unwrap();
        let b = UserId::new(b).unwrap();
        let ab = ConversationKey::direct(&a, &b).unwrap();
        let ba = ConversationKey::direct(&b, &a).unwrap();
        prop_assert_eq!(&ab, &ba);
        prop_assert!(ab.involves(&a));
        prop_assert!(ab.involves(&b));
        prop_assert_eq!(ab.peer_of(&a), Some(&b));
    }

    /// A key survives its string form
    #[test]
    fn direct_key_parses_back((a, b) in user_pair_strategy()) {
        let key = ConversationKey::direct(&UserId::new(a).unwrap(), &UserId::new(b).unwrap()).unwrap();
        prop_assert_eq!(ConversationKey::parse(&key.to_string()).unwrap(), key);
    }

    /// Nobody can hold a direct conversation with themselves
    #[test]
    fn direct_key_rejects_self(a in user_id_strategy()) {
        let a = UserId::new(a).unwrap();
        prop_assert!(ConversationKey::direct(&a, &a).is_err());
    }

    /// Paths survive their string form, and a child lies below its parent
    #[test]
    fn store_path_parse_and_contains(segments in prop::collection::vec(segment_strategy(), 1..6)) {
        let text = segments.join("/");
        let path = StorePath::parse(&text).unwrap();
        prop_assert_eq!(path.to_string(), text);
        prop_assert_eq!(path.segments().len(), segments.len());

        let parent = path.parent().unwrap();
        prop_assert!(parent.contains(&path));
        prop_assert!(!path.contains(&parent));
        prop_assert!(path.overlaps(&parent));
        prop_assert!(StorePath::root().contains(&path));
    }

    /// Sorting a feed gives the same result whatever order it arrived in
    #[test]
    fn feed_order_ignores_arrival_order(
        (messages, shuffled) in messages_strategy(30)
            .prop_flat_map(|m| (Just(m.clone()), Just(m).prop_shuffle()))
    ) {
        let mut expected = messages;
        let mut actual = shuffled;
        sort_messages(&mut expected);
        sort_messages(&mut actual);
        prop_assert_eq!(&expected, &actual);

        for pair in actual.windows(2) {
            prop_assert!(
                (pair[0].timestamp, &pair[0].id) < (pair[1].timestamp, &pair[1].id)
            );
        }
    }

    /// Conversations come newest first, one per non-empty feed
    #[test]
    fn summaries_sorted_newest_first(
        feeds in prop::collection::btree_map("[a-z0-9]{1,8}", prop::option::of(0..1000i64), 0..20)
    ) {
        let mut sources = BTreeMap::new();
        let mut latest = HashMap::new();
        for (group, timestamp) in &feeds {
            let key = ConversationKey::group(&chatsync_core::GroupId::new(group.as_str()).unwrap());
            sources.insert(key.clone(), ConversationSource {
                key: key.clone(),
                display_name: group.clone(),
                is_group: true,
                online: false,
            });
            if let Some(timestamp) = timestamp {
                latest.insert(key.clone(), message(&key, *timestamp));
            }
        }

        let summaries = summarize(&sources, &latest);
        prop_assert_eq!(summaries.len(), latest.len());
        for pair in summaries.windows(2) {
            prop_assert!(pair[0].timestamp >= pair[1].timestamp);
            if pair[0].timestamp == pair[1].timestamp {
                prop_assert!(pair[0].key < pair[1].key);
            }
        }
        for summary in &summaries {
            prop_assert_eq!(&summary.last_message, &latest[&summary.key]);
        }
    }
}

//! Conversation aggregator: one list of conversations, newest first
//!
//! Each source (a conversation the user takes part in) gets one
//! [`MessageFeed`]. Any feed change, or a change to the source set,
//! recomputes the whole summary list from the latest message of every feed.
//! Nothing depends on the order in which feeds report.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use super::events::ChatEvent;
use super::subscription::SubscriptionRegistry;
use super::SyncContext;
use crate::chat::{ConversationKey, FeedHandler, Message, MessageFeed};

/// A conversation the user takes part in, as known before reading its feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSource {
    pub key: ConversationKey,
    pub display_name: String,
    pub is_group: bool,
    /// Direct: the contact is online. Group: another member is online.
    pub online: bool,
}

/// One row of the aggregated conversation list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub key: ConversationKey,
    pub display_name: String,
    pub last_message: Message,
    pub is_group: bool,
    /// Timestamp of `last_message`
    pub timestamp: i64,
    pub online: bool,
}

impl ConversationSummary {
    fn new(source: &ConversationSource, last_message: Message) -> Self {
        Self {
            key: source.key.clone(),
            display_name: source.display_name.clone(),
            timestamp: last_message.timestamp,
            last_message,
            is_group: source.is_group,
            online: source.online,
        }
    }

    /// Preview of the last message, at most `max_chars` characters
    pub fn preview(&self, max_chars: usize) -> String {
        self.last_message.preview(max_chars)
    }
}

/// Summaries of every source with at least one message, newest first.
///
/// Ties on timestamp are broken by conversation key so the order is total.
pub fn summarize(
    sources: &BTreeMap<ConversationKey, ConversationSource>,
    latest: &HashMap<ConversationKey, Message>,
) -> Vec<ConversationSummary> {
    let mut summaries: Vec<ConversationSummary> = sources
        .values()
        .filter_map(|source| {
            let message = latest.get(&source.key)?;
            Some(ConversationSummary::new(source, message.clone()))
        })
        .collect();
    summaries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.key.cmp(&b.key)));
    summaries
}

#[derive(Default)]
struct AggregateState {
    sources: BTreeMap<ConversationKey, ConversationSource>,
    /// Latest message per feed; absent = empty feed
    latest: HashMap<ConversationKey, Message>,
}

struct Shared {
    ctx: SyncContext,
    state: Mutex<AggregateState>,
    tx: watch::Sender<Vec<ConversationSummary>>,
}

impl Shared {
    fn on_feed(&self, key: &ConversationKey, messages: &[Message]) {
        {
            let mut state = self.state.lock();
            if !state.sources.contains_key(key) {
                return;
            }
            match messages.last() {
                Some(last) => {
                    state.latest.insert(key.clone(), last.clone());
                }
                None => {
                    state.latest.remove(key);
                }
            }
        }
        trace!(%key, messages = messages.len(), "Feed reported");
        self.recompute();
    }

    fn recompute(&self) {
        let summaries = {
            let state = self.state.lock();
            summarize(&state.sources, &state.latest)
        };
        let count = summaries.len();
        let changed = self.tx.send_if_modified(|current| {
            if *current == summaries {
                return false;
            }
            *current = summaries;
            true
        });
        if changed {
            self.ctx.emit(ChatEvent::ConversationsChanged { count });
        }
    }
}

/// Aggregated, time-sorted view over many conversations.
///
/// Dropping it cancels every feed it opened.
pub struct ConversationAggregator {
    shared: Arc<Shared>,
    feeds: SubscriptionRegistry<ConversationKey, MessageFeed>,
    stopped: AtomicBool,
}

impl ConversationAggregator {
    pub fn new(ctx: &SyncContext) -> Self {
        let (tx, _) = watch::channel(Vec::new());
        Self {
            shared: Arc::new(Shared {
                ctx: ctx.clone(),
                state: Mutex::new(AggregateState::default()),
                tx,
            }),
            feeds: SubscriptionRegistry::new(),
            stopped: AtomicBool::new(false),
        }
    }

    /// Replace the set of conversations to aggregate.
    ///
    /// Feeds of dropped sources are cancelled, feeds of new sources opened;
    /// feeds of kept sources stay as they are. Names and online flags of
    /// kept sources are refreshed. Ignored once stopped.
    pub fn set_sources(&self, sources: Vec<ConversationSource>) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let keys: Vec<ConversationKey> = sources.iter().map(|s| s.key.clone()).collect();
        {
            let mut state = self.shared.state.lock();
            state.sources = sources.into_iter().map(|s| (s.key.clone(), s)).collect();
            state.latest.retain(|key, _| keys.contains(key));
        }
        self.shared.recompute();

        let dropped = self.feeds.retain(|key| keys.contains(key));
        if dropped > 0 {
            debug!(dropped, "Released conversation feeds");
        }
        for key in &keys {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            let weak: Weak<Shared> = Arc::downgrade(&self.shared);
            let handler: FeedHandler =
                Arc::new(move |key: &ConversationKey, messages: &[Message]| {
                    if let Some(shared) = weak.upgrade() {
                        shared.on_feed(key, messages);
                    }
                });
            let ctx = &self.shared.ctx;
            if let Err(e) = self.feeds.ensure(key, || MessageFeed::open(ctx, key, Some(handler))) {
                warn!(%key, error = ?e, "Conversation feed subscription failed");
            }
        }

        // A concurrent stop() may have cleared before these feeds were stored
        if self.stopped.load(Ordering::SeqCst) {
            self.release_all();
        }
    }

    /// Current summaries, newest first
    pub fn snapshot(&self) -> Vec<ConversationSummary> {
        self.shared.tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Vec<ConversationSummary>> {
        self.shared.tx.subscribe()
    }

    /// Sources currently aggregated
    pub fn sources(&self) -> Vec<ConversationSource> {
        self.shared.state.lock().sources.values().cloned().collect()
    }

    /// Number of live message feeds
    pub fn feed_count(&self) -> usize {
        self.feeds.len()
    }

    /// Cancel every feed and forget every source. Idempotent.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.release_all();
    }

    fn release_all(&self) {
        {
            let mut state = self.shared.state.lock();
            state.sources.clear();
            state.latest.clear();
        }
        let released = self.feeds.clear();
        if released > 0 {
            debug!(released, "Conversation aggregator stopped");
        }
        self.shared.recompute();
    }
}

impl Drop for ConversationAggregator {
    fn drop(&mut self) {
        self.stop();
    }
}

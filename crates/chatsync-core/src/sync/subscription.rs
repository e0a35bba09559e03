//! Subscription handles and the registry that deduplicates them
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Subscription (one live query)                                  │
//! │  ├── gate: closed by cancel(), no callback after it returns     │
//! │  ├── handle: current store listener (replaced on resubscribe)   │
//! │  └── status: Active → Recovering → Active | Failed              │
//! │                                                                 │
//! │  SubscriptionRegistry<K> (one per owning scope)                 │
//! │  ├── at most one Subscription per key                           │
//! │  ├── ensure: idempotent registration                            │
//! │  └── retain/clear: cancel what the scope no longer needs        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Callbacks run on the store's dispatch context. Never call `cancel` (or
//! drop a `Subscription`) while holding a lock the callback also takes.

use std::collections::btree_map::Entry as MapEntry;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::events::{ChatEvent, SubscriptionStatus};
use super::SyncContext;
use crate::error::ChatResult;
use crate::store::{Listener, ListenerGate, ListenerHandle, StoreEvent, StorePath};

/// Callback receiving the current value at a subscribed path
pub type ChangeHandler = Arc<dyn Fn(Option<Value>) + Send + Sync>;

struct Inner {
    ctx: SyncContext,
    path: StorePath,
    on_change: ChangeHandler,
    gate: ListenerGate,
    handle: Mutex<Option<ListenerHandle>>,
    attempts: AtomicU32,
    status: Mutex<SubscriptionStatus>,
}

impl Inner {
    fn attach(self: &Arc<Self>) -> ChatResult<()> {
        let weak = Arc::downgrade(self);
        let listener: Listener = Arc::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_event(event);
            }
        });
        let handle = self.ctx.store.subscribe(&self.path, listener)?;

        let mut slot = self.handle.lock();
        if !self.gate.is_open() {
            // Cancelled while subscribing
            drop(slot);
            self.ctx.store.unsubscribe(&handle);
            return Ok(());
        }
        *slot = Some(handle);
        Ok(())
    }

    fn on_event(self: &Arc<Self>, event: StoreEvent) {
        match event {
            StoreEvent::Value(value) => {
                let recovered = {
                    let mut status = self.status.lock();
                    let was_recovering = matches!(*status, SubscriptionStatus::Recovering { .. });
                    if was_recovering {
                        *status = SubscriptionStatus::Active;
                    }
                    was_recovering
                };
                if recovered && self.gate.is_open() {
                    self.attempts.store(0, Ordering::SeqCst);
                    info!(path = %self.path, "Subscription recovered");
                    self.ctx.emit(ChatEvent::SubscriptionRecovered {
                        path: self.path.to_string(),
                    });
                }
                self.gate.deliver(|| (self.on_change)(value));
            }
            StoreEvent::Cancelled { reason } => {
                if !self.gate.is_open() {
                    return;
                }
                self.handle.lock().take();
                let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;

                if attempt > self.ctx.config.resubscribe_attempts {
                    self.fail(&reason);
                    return;
                }

                warn!(path = %self.path, attempt, %reason, "Listener cancelled by store, resubscribing");
                let status = SubscriptionStatus::Recovering { attempt };
                *self.status.lock() = status.clone();
                self.ctx.emit(ChatEvent::SubscriptionError {
                    path: self.path.to_string(),
                    message: reason,
                    status,
                });

                if let Err(e) = self.attach() {
                    self.fail(&e.to_string());
                }
            }
        }
    }

    fn fail(&self, reason: &str) {
        warn!(path = %self.path, %reason, "Subscription failed, giving up");
        *self.status.lock() = SubscriptionStatus::Failed;
        self.ctx.emit(ChatEvent::SubscriptionError {
            path: self.path.to_string(),
            message: reason.to_string(),
            status: SubscriptionStatus::Failed,
        });
    }
}

/// A live, cancellable query against one store path.
///
/// The callback fires once with the current value (or `None`) and again on
/// every change. If the store drops the listener, the subscription reports a
/// [`ChatEvent::SubscriptionError`] and resubscribes, up to
/// `config.resubscribe_attempts` times in a row.
///
/// Dropping a `Subscription` cancels it.
pub struct Subscription {
    inner: Arc<Inner>,
}

impl Subscription {
    /// Subscribe to `path`.
    pub fn open(
        ctx: &SyncContext,
        path: StorePath,
        on_change: impl Fn(Option<Value>) + Send + Sync + 'static,
    ) -> ChatResult<Self> {
        let inner = Arc::new(Inner {
            ctx: ctx.clone(),
            path,
            on_change: Arc::new(on_change),
            gate: ListenerGate::new(),
            handle: Mutex::new(None),
            attempts: AtomicU32::new(0),
            status: Mutex::new(SubscriptionStatus::Active),
        });
        inner.attach()?;
        debug!(path = %inner.path, "Subscription opened");
        Ok(Self { inner })
    }

    pub fn path(&self) -> &StorePath {
        &self.inner.path
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.inner.status.lock().clone()
    }

    /// Whether the subscription has not been cancelled
    pub fn is_active(&self) -> bool {
        self.inner.gate.is_open()
    }

    /// Stop delivery. No callback runs after this returns. Idempotent.
    pub fn cancel(&self) {
        if !self.inner.gate.is_open() {
            return;
        }
        self.inner.gate.close();
        let handle = self.inner.handle.lock().take();
        if let Some(handle) = handle {
            self.inner.ctx.store.unsubscribe(&handle);
        }
        debug!(path = %self.inner.path, "Subscription cancelled");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("path", &self.inner.path)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Subscriptions of one owning scope, at most one per key.
///
/// `S` is anything that cancels itself on drop: a bare [`Subscription`] or
/// a stage built on one (a message feed). Removed entries are dropped after
/// the registry lock is released.
pub struct SubscriptionRegistry<K, S = Subscription> {
    entries: Mutex<BTreeMap<K, S>>,
}

impl<K: Ord + Clone, S> SubscriptionRegistry<K, S> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Open the subscription for `key` unless one exists.
    ///
    /// Returns `true` if a new subscription was opened.
    pub fn ensure<F>(&self, key: &K, open: F) -> ChatResult<bool>
    where
        F: FnOnce() -> ChatResult<S>,
    {
        if self.entries.lock().contains_key(key) {
            return Ok(false);
        }

        // Opening delivers the initial value, so the lock is not held
        let subscription = open()?;

        let duplicate = {
            let mut entries = self.entries.lock();
            match entries.entry(key.clone()) {
                MapEntry::Occupied(_) => Some(subscription),
                MapEntry::Vacant(slot) => {
                    slot.insert(subscription);
                    None
                }
            }
        };
        let opened = duplicate.is_none();
        drop(duplicate);
        Ok(opened)
    }

    /// Cancel every subscription whose key fails `keep`. Returns how many.
    pub fn retain(&self, keep: impl Fn(&K) -> bool) -> usize {
        let removed: Vec<S> = {
            let mut entries = self.entries.lock();
            let stale: Vec<K> = entries.keys().filter(|k| !keep(k)).cloned().collect();
            stale.iter().filter_map(|k| entries.remove(k)).collect()
        };
        removed.len()
    }

    /// Cancel everything. Returns how many subscriptions were cancelled.
    pub fn clear(&self) -> usize {
        let removed = std::mem::take(&mut *self.entries.lock());
        removed.len()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.lock().keys().cloned().collect()
    }
}

impl<K: Ord + Clone, S> Default for SubscriptionRegistry<K, S> {
    fn default() -> Self {
        Self::new()
    }
}

//! Shared subscriptions: one store listener per path, fanned out
//!
//! ```text
//!   DirectorySync(contacts) ─┐
//!   DirectorySync(group g1) ─┼─► SharedSubscriptions ──► users/{id} (1 listener)
//!   DirectorySync(group g2) ─┘        │
//!                                     └─ last value replayed to late holders
//! ```
//!
//! Every holder owns a [`SharedSubscription`]. The underlying
//! [`Subscription`] opens with the first holder of a path and is cancelled
//! when the last one goes away.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, trace};

use super::subscription::{ChangeHandler, Subscription};
use super::SyncContext;
use crate::error::ChatResult;
use crate::store::{ListenerGate, StorePath};

#[derive(Clone)]
struct Holder {
    gate: Arc<ListenerGate>,
    on_change: ChangeHandler,
    /// Version of the last value handed to this holder
    seen: Arc<AtomicU64>,
}

impl Holder {
    fn deliver(&self, version: u64, value: Option<Value>) {
        self.gate.deliver(|| {
            if self.seen.fetch_max(version, Ordering::SeqCst) < version {
                (self.on_change)(value);
            }
        });
    }
}

struct Slot {
    /// Distinguishes a reopened slot from the one a pending open started
    generation: u64,
    subscription: Option<Subscription>,
    last: Option<Option<Value>>,
    version: u64,
    holders: BTreeMap<u64, Holder>,
}

/// Store listeners shared by every stage of one [`SyncContext`].
#[derive(Default)]
pub struct SharedSubscriptions {
    slots: Mutex<HashMap<StorePath, Slot>>,
    next_id: AtomicU64,
}

impl SharedSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold `path`, opening its store listener if nobody holds it yet.
    ///
    /// `on_change` receives the current value once (immediately, if the
    /// path is already live) and again on every change.
    pub(crate) fn open(
        self: &Arc<Self>,
        ctx: &SyncContext,
        path: StorePath,
        on_change: ChangeHandler,
    ) -> ChatResult<SharedSubscription> {
        let token = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let holder = Holder {
            gate: Arc::new(ListenerGate::new()),
            on_change,
            seen: Arc::new(AtomicU64::new(0)),
        };
        let gate = holder.gate.clone();

        let (replay, starts) = {
            let mut slots = self.slots.lock();
            match slots.get_mut(&path) {
                Some(slot) => {
                    slot.holders.insert(token, holder.clone());
                    (slot.last.clone().map(|v| (slot.version, v)), None)
                }
                None => {
                    let mut holders = BTreeMap::new();
                    holders.insert(token, holder.clone());
                    slots.insert(
                        path.clone(),
                        Slot {
                            generation: token,
                            subscription: None,
                            last: None,
                            version: 0,
                            holders,
                        },
                    );
                    (None, Some(token))
                }
            }
        };

        if let Some(generation) = starts {
            // Not under the slot lock: opening delivers the initial value
            let weak: Weak<Self> = Arc::downgrade(self);
            let target = path.clone();
            let opened = Subscription::open(ctx, path.clone(), move |value| {
                if let Some(shared) = weak.upgrade() {
                    shared.deliver(&target, value);
                }
            });
            let stale = {
                let mut slots = self.slots.lock();
                let current = slots.get(&path).map(|s| s.generation) == Some(generation);
                match opened {
                    Ok(sub) if current => {
                        if let Some(slot) = slots.get_mut(&path) {
                            slot.subscription = Some(sub);
                        }
                        None
                    }
                    Ok(sub) => Some(sub),
                    Err(e) => {
                        if current {
                            slots.remove(&path);
                        }
                        drop(slots);
                        gate.close();
                        return Err(e);
                    }
                }
            };
            // Every holder left while the listener was opening
            drop(stale);
            debug!(%path, "Shared subscription opened");
        } else if let Some((version, value)) = replay {
            holder.deliver(version, value);
        }

        trace!(%path, token, "Shared subscription held");
        Ok(SharedSubscription {
            shared: Arc::downgrade(self),
            path,
            token,
            gate,
            released: AtomicBool::new(false),
        })
    }

    fn deliver(&self, path: &StorePath, value: Option<Value>) {
        let (version, holders) = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(path) else {
                return;
            };
            slot.version += 1;
            slot.last = Some(value.clone());
            (slot.version, slot.holders.values().cloned().collect::<Vec<_>>())
        };
        for holder in holders {
            holder.deliver(version, value.clone());
        }
    }

    fn release(&self, path: &StorePath, token: u64) {
        let removed = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(path) else {
                return;
            };
            slot.holders.remove(&token);
            if slot.holders.is_empty() {
                slots.remove(path)
            } else {
                None
            }
        };
        // Cancels the store listener outside the slot lock
        if let Some(slot) = removed {
            drop(slot);
            debug!(%path, "Shared subscription closed");
        }
    }

    /// Number of holders of `path`
    pub fn holders(&self, path: &StorePath) -> usize {
        self.slots
            .lock()
            .get(path)
            .map(|s| s.holders.len())
            .unwrap_or(0)
    }

    /// Whether the store listener for `path` is open
    pub fn is_live(&self, path: &StorePath) -> bool {
        self.slots
            .lock()
            .get(path)
            .map(|s| s.subscription.as_ref().map(Subscription::is_active).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Number of held paths
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

/// One holder's claim on a shared path.
///
/// Dropping it (or calling [`cancel`](SharedSubscription::cancel)) stops
/// delivery to this holder; no callback runs after `cancel` returns.
pub struct SharedSubscription {
    shared: Weak<SharedSubscriptions>,
    path: StorePath,
    token: u64,
    gate: Arc<ListenerGate>,
    released: AtomicBool,
}

impl SharedSubscription {
    pub fn path(&self) -> &StorePath {
        &self.path
    }

    pub fn is_active(&self) -> bool {
        self.gate.is_open()
    }

    /// Idempotent.
    pub fn cancel(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.gate.close();
        if let Some(shared) = self.shared.upgrade() {
            shared.release(&self.path, self.token);
        }
    }
}

impl Drop for SharedSubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for SharedSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSubscription")
            .field("path", &self.path)
            .field("active", &self.is_active())
            .finish()
    }
}

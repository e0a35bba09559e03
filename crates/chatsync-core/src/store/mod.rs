//! Remote shared data store
//!
//! The store is a hierarchical key/value tree shared by every client. This
//! module defines the interface the sync stages consume, plus an in-memory
//! implementation with optional local persistence.
//!
//! ## Notification model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  subscribe(path, listener)                                      │
//! │  ├── fires once immediately with the current value (or None)    │
//! │  ├── fires again whenever the value at or below `path` changes  │
//! │  │   (including an ancestor being overwritten or deleted)       │
//! │  └── fires Cancelled { reason } if the store drops the listener │
//! │                                                                 │
//! │  unsubscribe(handle)                                            │
//! │  └── closes the handle's gate: no delivery after it returns     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Notifications for one path arrive in the order the store applied the
//! writes. Nothing is promised across different paths.

mod memory;
mod path;
mod retry;

pub use memory::MemoryStore;
pub use path::StorePath;
pub use retry::write_with_retry;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::ReentrantMutex;
use serde_json::{Map, Value};

use crate::error::ChatResult;

/// What a listener receives.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// Current value at the subscribed path (`None` = absent)
    Value(Option<Value>),
    /// The store dropped the listener (transport or permission failure).
    /// No further events follow on this handle.
    Cancelled { reason: String },
}

/// Callback invoked by the store for every event on a subscribed path.
pub type Listener = Arc<dyn Fn(StoreEvent) + Send + Sync>;

/// Unique id of a registered listener within one store
pub type ListenerId = u64;

/// Delivery gate shared between a store and a listener handle.
///
/// The store delivers through the gate; closing it guarantees no delivery
/// starts afterwards. A close issued from another thread waits for an
/// in-flight delivery to finish. A close issued from inside the listener
/// itself (re-entrant) returns immediately.
#[derive(Debug)]
pub struct ListenerGate {
    open: AtomicBool,
    delivery: ReentrantMutex<()>,
}

impl ListenerGate {
    pub fn new() -> Self {
        Self {
            open: AtomicBool::new(true),
            delivery: ReentrantMutex::new(()),
        }
    }

    /// Run `deliver` unless the gate is closed. Returns whether it ran.
    pub fn deliver(&self, deliver: impl FnOnce()) -> bool {
        let _guard = self.delivery.lock();
        if !self.open.load(Ordering::SeqCst) {
            return false;
        }
        deliver();
        true
    }

    /// Close the gate. Idempotent.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        // Wait out a delivery running on another thread
        drop(self.delivery.lock());
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Default for ListenerGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Registration returned by [`RemoteStore::subscribe`].
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    id: ListenerId,
    path: StorePath,
    gate: Arc<ListenerGate>,
}

impl ListenerHandle {
    pub fn new(id: ListenerId, path: StorePath, gate: Arc<ListenerGate>) -> Self {
        Self { id, path, gate }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn path(&self) -> &StorePath {
        &self.path
    }

    pub fn gate(&self) -> &Arc<ListenerGate> {
        &self.gate
    }

    pub fn is_active(&self) -> bool {
        self.gate.is_open()
    }
}

/// The remote shared data store consumed by every sync stage.
///
/// Mutations resolve once the store acknowledged them. `subscribe` never
/// blocks: the initial value is delivered through the listener.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Current value at `path`, `None` if absent
    async fn read(&self, path: &StorePath) -> ChatResult<Option<Value>>;

    /// Replace the subtree at `path`. `None` deletes it.
    async fn write(&self, path: &StorePath, value: Option<Value>) -> ChatResult<()>;

    /// Merge `fields` into the object at `path`, touching only the listed
    /// children. A `null` field deletes that child.
    async fn update(&self, path: &StorePath, fields: Map<String, Value>) -> ChatResult<()>;

    /// Allocate a fresh child key under `path`.
    ///
    /// Keys are unique across concurrent callers and sort in allocation
    /// order. Nothing is written until the caller writes the child.
    async fn append_child(&self, path: &StorePath) -> ChatResult<String>;

    /// Register a listener on `path`.
    fn subscribe(&self, path: &StorePath, listener: Listener) -> ChatResult<ListenerHandle>;

    /// Remove a listener. Safe to call more than once.
    fn unsubscribe(&self, handle: &ListenerHandle);
}

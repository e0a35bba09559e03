//! In-memory implementation of [`RemoteStore`]
//!
//! The whole tree lives in one `serde_json::Value`. Every mutation runs
//! under the dispatch lock: the tree is changed, the affected listeners'
//! new values are computed and queued, and the queue is drained before the
//! lock is released. A listener that writes back into the store from inside
//! its callback only enqueues, so each path still sees its notifications in
//! the order the writes were applied.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{Listener, ListenerGate, ListenerHandle, ListenerId, RemoteStore, StoreEvent, StorePath};
use crate::error::{ChatError, ChatResult};
use crate::storage::Storage;

struct Registered {
    path: StorePath,
    listener: Listener,
    gate: Arc<ListenerGate>,
}

struct Delivery {
    listener: Listener,
    gate: Arc<ListenerGate>,
    event: StoreEvent,
    close_after: bool,
}

#[derive(Default)]
struct DispatchQueue {
    pending: VecDeque<Delivery>,
    draining: bool,
}

struct TreeState {
    root: Value,
    listeners: BTreeMap<ListenerId, Registered>,
}

/// Hierarchical JSON tree with change notification.
///
/// Empty objects, empty arrays and nulls are pruned on write, so an empty
/// subtree reads as absent. With [`MemoryStore::open`] every mutation is
/// written through to a redb file before listeners are notified.
pub struct MemoryStore {
    state: Mutex<TreeState>,
    dispatch: ReentrantMutex<RefCell<DispatchQueue>>,
    keys: Mutex<ulid::Generator>,
    next_listener: AtomicU64,
    failing_writes: AtomicU32,
    storage: Option<Storage>,
}

impl MemoryStore {
    /// Create an empty, purely in-memory store.
    pub fn new() -> Self {
        Self::with_root(Value::Object(Map::new()), None)
    }

    /// Open a store persisted at `path`, loading any existing tree.
    pub fn open(path: impl AsRef<Path>) -> ChatResult<Self> {
        Self::with_storage(Storage::new(path)?)
    }

    /// Open a store persisted in an already opened database.
    pub fn with_storage(storage: Storage) -> ChatResult<Self> {
        let root = storage.load_tree()?;
        debug!(nodes = root.len(), "Loaded persisted tree");
        Ok(Self::with_root(Value::Object(root), Some(storage)))
    }

    fn with_root(root: Value, storage: Option<Storage>) -> Self {
        Self {
            state: Mutex::new(TreeState {
                root,
                listeners: BTreeMap::new(),
            }),
            dispatch: ReentrantMutex::new(RefCell::new(DispatchQueue::default())),
            keys: Mutex::new(ulid::Generator::new()),
            next_listener: AtomicU64::new(1),
            failing_writes: AtomicU32::new(0),
            storage,
        }
    }

    // Test hooks

    /// Reject the next `count` writes/updates with `WriteConflict`.
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Drop every listener at or below `path`, delivering
    /// `StoreEvent::Cancelled` to each. Returns how many were dropped.
    pub fn cancel_listeners(&self, path: &StorePath, reason: &str) -> usize {
        let guard = self.dispatch.lock();
        let deliveries: Vec<Delivery> = {
            let mut state = self.state.lock();
            let ids: Vec<ListenerId> = state
                .listeners
                .iter()
                .filter(|(_, r)| path.contains(&r.path))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| state.listeners.remove(&id))
                .map(|r| Delivery {
                    listener: r.listener,
                    gate: r.gate,
                    event: StoreEvent::Cancelled {
                        reason: reason.to_string(),
                    },
                    close_after: true,
                })
                .collect()
        };
        let count = deliveries.len();
        warn!(%path, count, reason, "Cancelling listeners");
        self.drain(&guard, deliveries);
        count
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    /// Number of registered listeners on exactly `path`
    pub fn listener_count_at(&self, path: &StorePath) -> usize {
        self.state
            .lock()
            .listeners
            .values()
            .filter(|r| &r.path == path)
            .count()
    }

    /// Queue deliveries and, unless an outer frame on this thread is
    /// already draining, deliver everything queued.
    fn drain(
        &self,
        guard: &ReentrantMutexGuard<'_, RefCell<DispatchQueue>>,
        deliveries: Vec<Delivery>,
    ) {
        {
            let mut queue = guard.borrow_mut();
            queue.pending.extend(deliveries);
            if queue.draining {
                return;
            }
            queue.draining = true;
        }
        loop {
            let next = guard.borrow_mut().pending.pop_front();
            let Some(delivery) = next else { break };
            let Delivery {
                listener,
                gate,
                event,
                close_after,
            } = delivery;
            gate.deliver(|| listener(event));
            if close_after {
                gate.close();
            }
        }
        guard.borrow_mut().draining = false;
    }

    fn take_injected_failure(&self, path: &StorePath) -> ChatResult<()> {
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            debug!(%path, "Injected write conflict");
            return Err(ChatError::WriteConflict(path.to_string()));
        }
        Ok(())
    }

    /// Apply `change` to a copy of the tree, persist it, install it and
    /// notify every listener whose value changed.
    fn mutate(&self, path: &StorePath, change: impl FnOnce(&mut Value)) -> ChatResult<()> {
        let guard = self.dispatch.lock();
        self.take_injected_failure(path)?;

        let deliveries = {
            let mut state = self.state.lock();
            let mut next = state.root.clone();
            change(&mut next);
            prune_root(&mut next);

            if let Some(storage) = &self.storage {
                persist(storage, path, &next)?;
            }

            let deliveries: Vec<Delivery> = state
                .listeners
                .values()
                .filter(|r| r.path.overlaps(path))
                .filter_map(|r| {
                    let before = value_at(&state.root, &r.path);
                    let after = value_at(&next, &r.path);
                    (before != after).then(|| Delivery {
                        listener: r.listener.clone(),
                        gate: r.gate.clone(),
                        event: StoreEvent::Value(after.cloned()),
                        close_after: false,
                    })
                })
                .collect();
            state.root = next;
            deliveries
        };

        self.drain(&guard, deliveries);
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn read(&self, path: &StorePath) -> ChatResult<Option<Value>> {
        let state = self.state.lock();
        Ok(value_at(&state.root, path).cloned())
    }

    async fn write(&self, path: &StorePath, value: Option<Value>) -> ChatResult<()> {
        let value = value.and_then(normalize);
        self.mutate(path, |root| set_at(root, path.segments(), value))
    }

    async fn update(&self, path: &StorePath, fields: Map<String, Value>) -> ChatResult<()> {
        let mut children = Vec::with_capacity(fields.len());
        for (key, value) in fields {
            children.push((path.child(&key)?, normalize(value)));
        }
        self.mutate(path, |root| {
            for (child, value) in children {
                set_at(root, child.segments(), value);
            }
        })
    }

    async fn append_child(&self, path: &StorePath) -> ChatResult<String> {
        let key = self
            .keys
            .lock()
            .generate()
            .map_err(|e| ChatError::Storage(format!("key allocation under {}: {}", path, e)))?;
        Ok(key.to_string())
    }

    fn subscribe(&self, path: &StorePath, listener: Listener) -> ChatResult<ListenerHandle> {
        let guard = self.dispatch.lock();
        let id = self.next_listener.fetch_add(1, Ordering::SeqCst);
        let gate = Arc::new(ListenerGate::new());

        let initial = {
            let mut state = self.state.lock();
            let current = value_at(&state.root, path).cloned();
            state.listeners.insert(
                id,
                Registered {
                    path: path.clone(),
                    listener: listener.clone(),
                    gate: gate.clone(),
                },
            );
            current
        };
        debug!(%path, listener = id, "Listener registered");

        self.drain(
            &guard,
            vec![Delivery {
                listener,
                gate: gate.clone(),
                event: StoreEvent::Value(initial),
                close_after: false,
            }],
        );
        Ok(ListenerHandle::new(id, path.clone(), gate))
    }

    fn unsubscribe(&self, handle: &ListenerHandle) {
        let removed = self.state.lock().listeners.remove(&handle.id()).is_some();
        handle.gate().close();
        if removed {
            debug!(path = %handle.path(), listener = handle.id(), "Listener removed");
        }
    }
}

/// Borrow the value at `path`, `None` if any segment is missing.
fn value_at<'a>(root: &'a Value, path: &StorePath) -> Option<&'a Value> {
    let mut node = root;
    for segment in path.segments() {
        node = node.as_object()?.get(segment)?;
    }
    Some(node)
}

/// Set (or remove, with `None`) the node at `segments`, creating
/// intermediate objects and overwriting non-object intermediates.
fn set_at(node: &mut Value, segments: &[String], value: Option<Value>) {
    let Some((first, rest)) = segments.split_first() else {
        *node = value.unwrap_or_else(|| Value::Object(Map::new()));
        return;
    };
    if !node.is_object() {
        if value.is_none() {
            return;
        }
        *node = Value::Object(Map::new());
    }
    let Some(map) = node.as_object_mut() else {
        return;
    };
    if rest.is_empty() {
        match value {
            Some(value) => {
                map.insert(first.clone(), value);
            }
            None => {
                map.remove(first);
            }
        }
        return;
    }
    match map.get_mut(first) {
        Some(child) => set_at(child, rest, value),
        None if value.is_some() => {
            let mut child = Value::Object(Map::new());
            set_at(&mut child, rest, value);
            map.insert(first.clone(), child);
        }
        None => {}
    }
}

/// Strip nulls and empty containers. `None` means the value is empty.
fn normalize(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let map: Map<String, Value> = map
                .into_iter()
                .filter_map(|(k, v)| normalize(v).map(|v| (k, v)))
                .collect();
            (!map.is_empty()).then_some(Value::Object(map))
        }
        Value::Array(items) => {
            let items: Vec<Value> = items.into_iter().filter_map(normalize).collect();
            (!items.is_empty()).then_some(Value::Array(items))
        }
        other => Some(other),
    }
}

fn prune_root(root: &mut Value) {
    let pruned = normalize(std::mem::take(root));
    *root = pruned.unwrap_or_else(|| Value::Object(Map::new()));
}

/// Write through the top-level node(s) touched by a mutation at `path`.
fn persist(storage: &Storage, path: &StorePath, root: &Value) -> ChatResult<()> {
    let empty = Map::new();
    let map = root.as_object().unwrap_or(&empty);
    match path.segments().first() {
        Some(top) => storage.save_tree_node(top, map.get(top)),
        None => storage.save_tree(map),
    }
}

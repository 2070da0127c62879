//! Listener registries with snapshot fan-out.
//!
//! Notification iterates over a snapshot of the registered callbacks, so a
//! listener can unsubscribe itself (or others) mid-pass without poisoning
//! the iteration, and a listener removed before the pass runs is not
//! invoked.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Id-keyed callback registry for one event kind.
pub struct ListenerSet<T> {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<u64, Callback<T>>>,
}

impl<T: Clone> ListenerSet<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Register a callback; the returned id removes it again.
    pub fn add(&self, listener: impl Fn(T) + Send + Sync + 'static) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.listeners.lock().insert(id, Arc::new(listener));
        id
    }

    /// Remove a callback by id. Returns `false` for unknown ids.
    pub fn remove(&self, id: u64) -> bool {
        self.listeners.lock().remove(&id).is_some()
    }

    /// Invoke every currently registered callback with a clone of `value`.
    pub fn notify(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = self.listeners.lock().values().cloned().collect();
        for listener in snapshot {
            listener(value.clone());
        }
    }

    /// Number of registered callbacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Whether no callbacks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }
}

impl<T: Clone> Default for ListenerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

//! In-process publish/subscribe.
//!
//! [`Listeners`] is an ordered list of callbacks; [`KeyedEventBus`] maps
//! exact keys to such lists. Dispatch always iterates over a snapshot taken
//! before the first listener runs, so a listener may subscribe or unsubscribe
//! (itself or others) while being dispatched to without disturbing the
//! in-progress iteration. No lock is held while a listener runs.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::types::Key;

/// A registered callback.
pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Identifies one registration, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type Entries<E> = Vec<(ListenerId, Listener<E>)>;

/// An ordered list of listeners for one event stream.
pub struct Listeners<E> {
    entries: Mutex<Entries<E>>,
}

impl<E> Listeners<E> {
    /// Create an empty listener list.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Register a listener. Listeners run in registration order.
    pub fn add(&self, listener: Listener<E>) -> ListenerId {
        let id = ListenerId::next();
        self.entries.lock().push((id, listener));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    /// Invoke every listener registered at the time of the call.
    pub fn dispatch(&self, event: &E) -> usize {
        let snapshot: Vec<Listener<E>> = self
            .entries
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in &snapshot {
            listener(event);
        }
        snapshot.len()
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Remove every listener.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Publish/subscribe keyed by exact [`Key`] match.
pub struct KeyedEventBus<E> {
    subscriptions: Mutex<HashMap<Key, Entries<E>>>,
}

impl<E> KeyedEventBus<E> {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Register a listener on a key.
    pub fn subscribe(&self, key: &Key, listener: Listener<E>) -> ListenerId {
        let id = ListenerId::next();
        self.subscriptions
            .lock()
            .entry(key.clone())
            .or_default()
            .push((id, listener));
        id
    }

    /// Remove a listener from a key. Unknown ids are ignored.
    pub fn unsubscribe(&self, key: &Key, id: ListenerId) -> bool {
        let mut subscriptions = self.subscriptions.lock();
        let Some(entries) = subscriptions.get_mut(key) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            subscriptions.remove(key);
        }
        removed
    }

    /// Deliver an event to the listeners of `key`, in registration order.
    ///
    /// Returns the number of listeners invoked.
    pub fn dispatch(&self, key: &Key, event: &E) -> usize {
        let snapshot: Vec<Listener<E>> = match self.subscriptions.lock().get(key) {
            Some(entries) => entries.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => return 0,
        };
        for listener in &snapshot {
            listener(event);
        }
        snapshot.len()
    }

    /// Number of listeners on a key.
    pub fn listener_count(&self, key: &Key) -> usize {
        self.subscriptions.lock().get(key).map_or(0, Vec::len)
    }

    /// Keys with at least one listener.
    pub fn keys(&self) -> Vec<Key> {
        self.subscriptions.lock().keys().cloned().collect()
    }

    /// Remove every subscription.
    pub fn clear(&self) {
        self.subscriptions.lock().clear();
    }
}

impl<E> Default for KeyedEventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

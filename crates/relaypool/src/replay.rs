//! Reference-counted shared subscriptions.
//!
//! Several logical subscribers can attach to one live event source. Late
//! joiners get every buffered event replayed in arrival order. The source is
//! cancelled once, when the last attached subscriber detaches.
//!
//! Shared subscriptions live in a [`SharedSubscriptions`] table keyed by
//! [`SharedId`]; the table hands the source back to the caller on the final
//! detach instead of holding a cancel closure.

use std::collections::HashMap;
use std::sync::Arc;

use crate::on_event::guarded;

/// Receives replayed and live items.
pub type ReplayCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SharedId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachId(u64);

/// One live source with its buffered history and attached subscribers.
pub struct SharedSubscription<T> {
    events: Vec<T>,
    subscribers: Vec<(AttachId, ReplayCallback<T>)>,
    next_attach: u64,
    released: bool,
}

impl<T> Default for SharedSubscription<T> {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            subscribers: Vec::new(),
            next_attach: 0,
            released: false,
        }
    }
}

impl<T> SharedSubscription<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replay the buffer to `callback`, then keep it for live items.
    pub fn attach(&mut self, callback: ReplayCallback<T>) -> AttachId {
        for item in &self.events {
            guarded("replay", || callback(item));
        }
        let id = AttachId(self.next_attach);
        self.next_attach += 1;
        self.subscribers.push((id, callback));
        id
    }

    /// Remove a subscriber.
    ///
    /// Returns true exactly once: when this detach leaves the subscription
    /// without subscribers. The caller then cancels the source.
    pub fn detach(&mut self, id: AttachId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(attach, _)| *attach != id);
        if self.subscribers.len() == before || !self.subscribers.is_empty() || self.released {
            return false;
        }
        self.released = true;
        true
    }

    /// Buffer an item and hand it to every subscriber.
    pub fn emit(&mut self, item: T) {
        for (_, callback) in &self.subscribers {
            guarded("event", || callback(&item));
        }
        self.events.push(item);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn buffered(&self) -> &[T] {
        &self.events
    }

    /// Whether the source is still running.
    pub fn is_live(&self) -> bool {
        !self.released
    }
}

struct Entry<T, S> {
    key: String,
    source: S,
    subscription: SharedSubscription<T>,
}

/// Arena of shared subscriptions, addressable by id and by cache key.
pub struct SharedSubscriptions<T, S> {
    next_id: u64,
    entries: HashMap<SharedId, Entry<T, S>>,
    by_key: HashMap<String, SharedId>,
}

impl<T, S> Default for SharedSubscriptions<T, S> {
    fn default() -> Self {
        Self {
            next_id: 0,
            entries: HashMap::new(),
            by_key: HashMap::new(),
        }
    }
}

impl<T, S: Copy> SharedSubscriptions<T, S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new shared subscription fed by `source`, replacing any entry with the same key.
    pub fn insert(&mut self, key: String, source: S) -> SharedId {
        let id = SharedId(self.next_id);
        self.next_id += 1;
        if let Some(previous) = self.by_key.insert(key.clone(), id) {
            self.entries.remove(&previous);
        }
        self.entries.insert(
            id,
            Entry {
                key,
                source,
                subscription: SharedSubscription::new(),
            },
        );
        id
    }

    /// The live shared subscription registered under `key`, if any.
    pub fn find(&self, key: &str) -> Option<SharedId> {
        self.by_key
            .get(key)
            .copied()
            .filter(|id| self.entries.get(id).is_some_and(|e| e.subscription.is_live()))
    }

    pub fn attach(&mut self, id: SharedId, callback: ReplayCallback<T>) -> Option<AttachId> {
        self.entries
            .get_mut(&id)
            .map(|entry| entry.subscription.attach(callback))
    }

    /// Detach a subscriber. Returns the source to cancel when it was the last one;
    /// the entry is then dropped from the table.
    pub fn detach(&mut self, id: SharedId, attach: AttachId) -> Option<S> {
        let entry = self.entries.get_mut(&id)?;
        if !entry.subscription.detach(attach) {
            return None;
        }
        let entry = self.entries.remove(&id)?;
        if self.by_key.get(&entry.key) == Some(&id) {
            self.by_key.remove(&entry.key);
        }
        Some(entry.source)
    }

    pub fn emit(&mut self, id: SharedId, item: T) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.subscription.emit(item);
        }
    }

    pub fn get(&self, id: SharedId) -> Option<&SharedSubscription<T>> {
        self.entries.get(&id).map(|entry| &entry.subscription)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_key.clear();
    }
}

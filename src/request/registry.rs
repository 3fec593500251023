//! Identity-keyed registry of in-flight requests and their listeners.
//!
//! Every decision that touches an entry (register, merge, close) runs while the
//! registry lock is held.  Completion closes the entry's listener set before it
//! notifies, so an aggregation either lands in the set before the snapshot or
//! sees a closed entry and starts a new request.  Eviction removes an entry only
//! if it is still the one that was closed.  Completion and progress are bound to
//! the request that owns the entry, so a stale request sharing the identity of a
//! newer one never touches the newer entry.

use std::sync::{Arc, Mutex};

use hashbrown::HashMap;

use super::cached_request::{CachedRequest, RequestKey};
use super::listener::{same_listener, ListenerRef};
use crate::sync::lock;

#[derive(Default)]
struct SetState {
    listeners: Vec<ListenerRef>,
    closed: bool,
}

pub(crate) struct Entry {
    request: Arc<CachedRequest>,
    listeners: Mutex<SetState>,
}

impl Entry {
    fn new(request: Arc<CachedRequest>) -> Entry {
        Entry {
            request,
            listeners: Mutex::new(SetState::default()),
        }
    }

    // false once the entry has been closed for completion
    fn merge(&self, incoming: &[ListenerRef]) -> bool {
        let mut state = lock(&self.listeners);
        if state.closed {
            return false;
        }
        for listener in incoming {
            if !state.listeners.iter().any(|l| same_listener(l, listener)) {
                state.listeners.push(listener.clone());
            }
        }
        true
    }

    fn close(&self) -> Vec<ListenerRef> {
        let mut state = lock(&self.listeners);
        state.closed = true;
        state.listeners.clone()
    }

    fn owned_by(&self, request: &CachedRequest) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.request), request)
    }

    fn is_closed(&self) -> bool {
        lock(&self.listeners).closed
    }

    fn snapshot(&self) -> Vec<ListenerRef> {
        lock(&self.listeners).listeners.clone()
    }

    fn remove(&self, outgoing: &[ListenerRef]) {
        lock(&self.listeners)
            .listeners
            .retain(|l| !outgoing.iter().any(|o| same_listener(l, o)));
    }

    fn len(&self) -> usize {
        lock(&self.listeners).listeners.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Registration {
    /// merged into an entry that is already in flight
    Aggregated,
    /// a new entry was created; the caller must hand the request off
    Added,
    /// nothing in flight and the request may not start one
    Unprocessable,
}

#[derive(Default)]
pub struct ListenerRegistry {
    entries: Mutex<HashMap<RequestKey, Arc<Entry>>>,
}

impl ListenerRegistry {
    pub fn new() -> ListenerRegistry {
        ListenerRegistry::default()
    }

    /// The atomic lookup / decide / insert-or-merge step of submission.
    pub(crate) fn register(
        &self,
        request: &Arc<CachedRequest>,
        listeners: &[ListenerRef],
    ) -> Registration {
        let mut entries = lock(&self.entries);

        if let Some(existing) = entries.get(request.key()) {
            if existing.merge(listeners) {
                return Registration::Aggregated;
            }
        }

        if !request.is_processable() {
            return Registration::Unprocessable;
        }

        // replaces a closed entry whose completion has not evicted it yet
        let entry = Arc::new(Entry::new(request.clone()));
        entry.merge(listeners);
        entries.insert(request.key().clone(), entry);

        Registration::Added
    }

    /// Close the entry owned by `request` and return it with the listeners to notify.
    pub(crate) fn close(&self, request: &CachedRequest) -> Option<(Arc<Entry>, Vec<ListenerRef>)> {
        let entries = lock(&self.entries);
        let entry = entries.get(request.key())?;
        if !entry.owned_by(request) || entry.is_closed() {
            return None;
        }
        let listeners = entry.close();
        Some((entry.clone(), listeners))
    }

    /// Remove `key` if it still maps to `entry`.
    pub(crate) fn evict(&self, key: &RequestKey, entry: &Arc<Entry>) -> bool {
        let mut entries = lock(&self.entries);
        match entries.get(key) {
            Some(current) if Arc::ptr_eq(current, entry) => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// the registered request for `key`, if one is open
    pub fn find_request(&self, key: &RequestKey) -> Option<Arc<CachedRequest>> {
        lock(&self.entries)
            .get(key)
            .filter(|entry| !entry.is_closed())
            .map(|entry| entry.request.clone())
    }

    /// listeners of the entry owned by `request`
    pub(crate) fn listeners(&self, request: &CachedRequest) -> Vec<ListenerRef> {
        lock(&self.entries)
            .get(request.key())
            .filter(|entry| entry.owned_by(request))
            .map(|entry| entry.snapshot())
            .unwrap_or_default()
    }

    pub(crate) fn remove_listeners(&self, key: &RequestKey, listeners: &[ListenerRef]) {
        if let Some(entry) = lock(&self.entries).get(key) {
            entry.remove(listeners);
        }
    }

    pub fn contains(&self, key: &RequestKey) -> bool {
        lock(&self.entries).contains_key(key)
    }

    pub fn listener_count(&self, key: &RequestKey) -> usize {
        lock(&self.entries)
            .get(key)
            .map_or(0, |entry| entry.len())
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (identity, listener count) for every entry
    pub fn summary(&self) -> Vec<(RequestKey, usize)> {
        lock(&self.entries)
            .iter()
            .map(|(key, entry)| (key.clone(), entry.len()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::freshness::CacheDuration;
    use crate::request::listener::ChannelListener;

    fn request(key: &str) -> Arc<CachedRequest> {
        Arc::new(CachedRequest::from_cache::<String>(key, CacheDuration::ONE_MINUTE))
    }

    fn listener() -> ListenerRef {
        let (listener, _rx) = ChannelListener::<String>::new();
        listener
    }

    #[test]
    fn register_then_aggregate() {
        let registry = ListenerRegistry::new();
        let first = request("k1");
        let (l1, l2) = (listener(), listener());

        assert_eq!(registry.register(&first, &[l1.clone()]), Registration::Added);
        assert_eq!(
            registry.register(&request("k1"), &[l2.clone(), l1.clone()]),
            Registration::Aggregated
        );

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.listener_count(first.key()), 2);
        assert!(Arc::ptr_eq(
            &registry.find_request(first.key()).unwrap(),
            &first
        ));
    }

    #[test]
    fn unprocessable_without_entry() {
        let registry = ListenerRegistry::new();
        let pending = Arc::new(CachedRequest::pending_only::<String>("k1"));
        assert_eq!(
            registry.register(&pending, &[listener()]),
            Registration::Unprocessable
        );
        assert!(registry.is_empty());

        // with an entry in flight it aggregates
        registry.register(&request("k1"), &[]);
        assert_eq!(
            registry.register(&pending, &[listener()]),
            Registration::Aggregated
        );
    }

    #[test]
    fn close_then_evict() {
        let registry = ListenerRegistry::new();
        let first = request("k1");
        registry.register(&first, &[listener(), listener()]);

        let (entry, listeners) = registry.close(&first).unwrap();
        assert_eq!(listeners.len(), 2);
        assert!(registry.close(&first).is_none());
        assert!(registry.find_request(first.key()).is_none());

        assert!(registry.evict(first.key(), &entry));
        assert!(!registry.evict(first.key(), &entry));
        assert!(registry.is_empty());
    }

    #[test]
    fn submission_after_close_starts_new_entry() {
        let registry = ListenerRegistry::new();
        let first = request("k1");
        registry.register(&first, &[listener()]);
        let (closed, _) = registry.close(&first).unwrap();

        let late = listener();
        let second = request("k1");
        assert_eq!(
            registry.register(&second, &[late.clone()]),
            Registration::Added
        );

        // the old request can neither close nor evict the new entry
        assert!(registry.close(&first).is_none());
        assert!(registry.listeners(&first).is_empty());
        assert!(!registry.evict(first.key(), &closed));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.listeners(&second).len(), 1);
    }

    #[test]
    fn remove_listeners() {
        let registry = ListenerRegistry::new();
        let first = request("k1");
        let (l1, l2) = (listener(), listener());
        registry.register(&first, &[l1.clone(), l2.clone()]);

        registry.remove_listeners(first.key(), &[l1.clone()]);
        let remaining = registry.listeners(&first);
        assert_eq!(remaining.len(), 1);
        assert!(same_listener(&remaining[0], &l2));
        assert_eq!(registry.summary(), vec![(first.key().clone(), 1)]);
    }
}

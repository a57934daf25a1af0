//! Subscription registry: topic/pattern -> ordered registrations.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::callback::Callback;
use crate::message::Extra;

/// Handle returned by every registration, used to unregister it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(pub(crate) u64);

impl SubscriptionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// One callback registered under one key.
pub(crate) struct Registration<M> {
    pub id: SubscriptionId,
    pub callback: Arc<dyn Callback<M>>,
    pub extra: Arc<Extra>,
}

impl<M> Clone for Registration<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            callback: Arc::clone(&self.callback),
            extra: Arc::clone(&self.extra),
        }
    }
}

/// Maps each key to its registrations in insertion order.
///
/// Dispatchers take a [`snapshot`](Registry::snapshot) and invoke callbacks
/// without holding the lock, so callbacks may register and unregister freely.
pub(crate) struct Registry<K, M> {
    entries: Mutex<HashMap<K, Vec<Registration<M>>>>,
}

impl<K: Eq + Hash + Clone, M> Registry<K, M> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Add one registration under every key. Keys are expected to be distinct.
    pub fn insert(
        &self,
        keys: &[K],
        id: SubscriptionId,
        callback: Arc<dyn Callback<M>>,
        extra: Arc<Extra>,
    ) {
        let mut entries = self.entries.lock();
        for key in keys {
            entries.entry(key.clone()).or_default().push(Registration {
                id,
                callback: Arc::clone(&callback),
                extra: Arc::clone(&extra),
            });
        }
    }

    /// Remove every registration with `id`.
    ///
    /// Returns `None` if the id was unknown, otherwise the keys left without
    /// any registration.
    pub fn remove(&self, id: SubscriptionId) -> Option<Vec<K>> {
        let mut entries = self.entries.lock();
        let mut found = false;
        let mut emptied = Vec::new();
        entries.retain(|key, registrations| {
            let before = registrations.len();
            registrations.retain(|r| r.id != id);
            found |= registrations.len() != before;
            if registrations.is_empty() {
                emptied.push(key.clone());
                false
            } else {
                true
            }
        });
        found.then_some(emptied)
    }

    /// Drop registrations under `key` whose owner is gone. Returns true if the
    /// key was left empty and removed.
    pub fn prune_dead(&self, key: &K) -> bool {
        let mut entries = self.entries.lock();
        let Some(registrations) = entries.get_mut(key) else {
            return false;
        };
        registrations.retain(|r| r.callback.is_alive());
        if registrations.is_empty() {
            entries.remove(key);
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self, key: &K) -> Vec<Registration<M>> {
        self.entries.lock().get(key).cloned().unwrap_or_default()
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.lock().keys().cloned().collect()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.entries
            .lock()
            .values()
            .any(|registrations| registrations.iter().any(|r| r.id == id))
    }
}

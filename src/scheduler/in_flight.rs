//! Process-local set of keys with a dispatch in progress.

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

/// Concurrency-safe set guaranteeing at most one holder per key.
///
/// Cloning shares the underlying set.
#[derive(Debug)]
pub struct InFlightTracker<K> {
    keys: Arc<Mutex<HashSet<K>>>,
}

impl<K> Clone for InFlightTracker<K> {
    fn clone(&self) -> Self {
        Self {
            keys: Arc::clone(&self.keys),
        }
    }
}

impl<K> Default for InFlightTracker<K> {
    fn default() -> Self {
        Self {
            keys: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

impl<K: Eq + Hash + Clone> InFlightTracker<K> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<K>> {
        // The set is consistent after every single insert/remove.
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomically insert `key`. Returns false if it was already present.
    pub fn try_acquire(&self, key: K) -> bool {
        self.lock().insert(key)
    }

    pub fn release(&self, key: &K) {
        self.lock().remove(key);
    }

    /// Like `try_acquire`, but the key is released when the guard drops.
    pub fn try_guard(&self, key: K) -> Option<InFlightGuard<K>> {
        if self.try_acquire(key.clone()) {
            Some(InFlightGuard {
                tracker: self.clone(),
                key,
            })
        } else {
            None
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Holds a key in the tracker; releases it on drop, including during unwinding.
#[derive(Debug)]
pub struct InFlightGuard<K: Eq + Hash + Clone> {
    tracker: InFlightTracker<K>,
    key: K,
}

impl<K: Eq + Hash + Clone> InFlightGuard<K> {
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Eq + Hash + Clone> Drop for InFlightGuard<K> {
    fn drop(&mut self) {
        self.tracker.release(&self.key);
    }
}

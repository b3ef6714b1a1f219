//! Reader-writer-locked set with an RAII single-flight guard.

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

/// A clonable, thread-safe set. `acquire` turns it into a single-flight
/// admission gate: the first caller for a key wins and holds the slot until
/// its [`SetGuard`] drops.
#[derive(Debug)]
pub struct ConcurrentSet<T> {
    inner: Arc<RwLock<HashSet<T>>>,
}

impl<T> Clone for ConcurrentSet<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for ConcurrentSet<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashSet::new())),
        }
    }
}

impl<T: Eq + Hash + Clone> ConcurrentSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, key: T) {
        self.inner.write().expect("set lock").insert(key);
    }

    /// Atomically insert `key`, returning whether it was new.
    pub fn add_unique(&self, key: T) -> bool {
        self.inner.write().expect("set lock").insert(key)
    }

    pub fn remove(&self, key: &T) {
        self.inner.write().expect("set lock").remove(key);
    }

    pub fn contains(&self, key: &T) -> bool {
        self.inner.read().expect("set lock").contains(key)
    }

    /// Claim `key` for exclusive processing. Returns `None` when another
    /// holder is already in flight. The slot is released when the returned
    /// guard drops, on every exit path including unwinding.
    pub fn acquire(&self, key: T) -> Option<SetGuard<T>> {
        if !self.add_unique(key.clone()) {
            return None;
        }

        Some(SetGuard {
            inner: Arc::clone(&self.inner),
            key,
        })
    }
}

/// Holds a single-flight slot in a [`ConcurrentSet`]; releases it on drop.
#[derive(Debug)]
pub struct SetGuard<T: Eq + Hash> {
    inner: Arc<RwLock<HashSet<T>>>,
    key: T,
}

impl<T: Eq + Hash> Drop for SetGuard<T> {
    fn drop(&mut self) {
        self.inner.write().expect("set lock").remove(&self.key);
    }
}

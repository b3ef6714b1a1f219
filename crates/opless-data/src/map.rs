//! Reader-writer-locked hash map.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

/// A clonable, thread-safe map. All clones share the same underlying state.
#[derive(Debug)]
pub struct ConcurrentMap<K, V> {
    inner: Arc<RwLock<HashMap<K, V>>>,
}

impl<K, V> Clone for ConcurrentMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Default for ConcurrentMap<K, V> {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> ConcurrentMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: K, value: V) {
        self.inner.write().expect("map lock").insert(key, value);
    }

    /// Remove a key, returning the value it held.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.write().expect("map lock").remove(key)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.read().expect("map lock").get(key).cloned()
    }

    pub fn get_or(&self, key: &K, default: V) -> V {
        self.get(key).unwrap_or(default)
    }

    /// Apply `f` to the value at `key`, atomically under the write lock.
    /// Returns false (and does nothing) when the key is absent.
    pub fn update(&self, key: &K, f: impl FnOnce(&mut V)) -> bool {
        let mut inner = self.inner.write().expect("map lock");
        match inner.get_mut(key) {
            Some(value) => {
                f(value);
                true
            }
            None => false,
        }
    }

    pub fn for_each(&self, mut f: impl FnMut(&K, &V)) {
        let inner = self.inner.read().expect("map lock");
        for (k, v) in inner.iter() {
            f(k, v);
        }
    }

    pub fn values(&self) -> Vec<V> {
        self.inner.read().expect("map lock").values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("map lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every entry.
    pub fn drain(&self) -> Vec<(K, V)> {
        self.inner.write().expect("map lock").drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let map = ConcurrentMap::new();
        map.insert("a", 1);
        assert_eq!(map.get(&"a"), Some(1));
        assert_eq!(map.get_or(&"b", 7), 7);
        assert_eq!(map.remove(&"a"), Some(1));
        assert_eq!(map.get(&"a"), None);
    }

    #[test]
    fn update_only_applies_to_existing_keys() {
        let map = ConcurrentMap::new();
        map.insert("a", 1);

        assert!(map.update(&"a", |v| *v += 10));
        assert_eq!(map.get(&"a"), Some(11));

        assert!(!map.update(&"b", |v| *v += 10));
        assert_eq!(map.get(&"b"), None);
    }

    #[test]
    fn values_and_for_each_see_all_entries() {
        let map = ConcurrentMap::new();
        map.insert("a", 1);
        map.insert("b", 2);

        let mut values = map.values();
        values.sort();
        assert_eq!(values, vec![1, 2]);

        let mut count = 0;
        map.for_each(|_, _| count += 1);
        assert_eq!(count, 2);
    }

    #[test]
    fn clones_share_state() {
        let map = ConcurrentMap::new();
        let other = map.clone();
        map.insert("a", 1);
        assert_eq!(other.get(&"a"), Some(1));
    }

    #[test]
    fn concurrent_inserts_are_all_visible() {
        let map: ConcurrentMap<u32, u32> = ConcurrentMap::new();
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let map = map.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        map.insert(t * 100 + i, i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(map.len(), 800);
    }
}

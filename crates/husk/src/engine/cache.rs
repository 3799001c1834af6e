//! Least-recently-used cache for compiled modules.
//!
//! Entries live in a [`Slab`] and are threaded onto a doubly linked list
//! ordered from least to most recently used. A hash index maps keys to slab
//! slots, so lookup, promotion, insertion and eviction are all O(1).

use std::collections::HashMap;
use std::hash::Hash;

use slab::Slab;

#[derive(Debug)]
struct Entry<K, V> {
    key: K,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Bounded LRU map.
#[derive(Debug)]
pub struct ModuleCache<K, V> {
    capacity: usize,
    entries: Slab<Entry<K, V>>,
    index: HashMap<K, usize>,
    /// Least recently used
    head: Option<usize>,
    /// Most recently used
    tail: Option<usize>,
}

impl<K: Clone + Eq + Hash, V> ModuleCache<K, V> {
    /// Create a cache holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Slab::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            head: None,
            tail: None,
        }
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Whether `key` is cached, without touching recency.
    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Look up `key` and mark it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let slot = *self.index.get(key)?;
        self.detach(slot);
        self.push_back(slot);
        Some(&self.entries[slot].value)
    }

    /// Look up `key` without changing its position.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.index.get(key).map(|&slot| &self.entries[slot].value)
    }

    /// Insert or replace `key` as most recently used.
    ///
    /// Returns the least recently used entry if it had to be evicted to make room.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(&slot) = self.index.get(&key) {
            self.entries[slot].value = value;
            self.detach(slot);
            self.push_back(slot);
            return None;
        }

        let evicted = if self.index.len() >= self.capacity {
            self.pop_front()
        } else {
            None
        };

        let slot = self.entries.insert(Entry {
            key: key.clone(),
            value,
            prev: None,
            next: None,
        });
        self.index.insert(key, slot);
        self.push_back(slot);
        evicted
    }

    /// Remove `key` from the cache.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.index.remove(key)?;
        self.detach(slot);
        Some(self.entries.remove(slot).value)
    }

    /// Keys from least to most recently used.
    pub fn keys(&self) -> Vec<K> {
        let mut keys = Vec::with_capacity(self.len());
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            let entry = &self.entries[slot];
            keys.push(entry.key.clone());
            cursor = entry.next;
        }
        keys
    }

    fn pop_front(&mut self) -> Option<(K, V)> {
        let slot = self.head?;
        self.detach(slot);
        let entry = self.entries.remove(slot);
        self.index.remove(&entry.key);
        Some((entry.key, entry.value))
    }

    fn detach(&mut self, slot: usize) {
        let (prev, next) = {
            let entry = &mut self.entries[slot];
            (entry.prev.take(), entry.next.take())
        };
        match prev {
            Some(p) => self.entries[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.entries[n].prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_back(&mut self, slot: usize) {
        self.entries[slot].prev = self.tail;
        self.entries[slot].next = None;
        match self.tail {
            Some(t) => self.entries[t].next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut cache = ModuleCache::new(2);
        assert!(cache.is_empty());
        assert!(cache.insert("a", 1).is_none());
        assert_eq!(cache.get(&"a"), Some(&1));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"missing"), None);
    }

    #[test]
    fn test_evicts_least_recently_inserted() {
        let mut cache = ModuleCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);

        assert_eq!(cache.insert("c", 3), Some(("a", 1)));
        assert_eq!(cache.keys(), vec!["b", "c"]);
        assert!(!cache.contains(&"a"));
    }

    #[test]
    fn test_get_promotes_entry() {
        let mut cache = ModuleCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);

        cache.get(&"a");
        assert_eq!(cache.insert("c", 3), Some(("b", 2)));
        assert_eq!(cache.keys(), vec!["a", "c"]);
    }

    #[test]
    fn test_peek_does_not_promote() {
        let mut cache = ModuleCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);

        assert_eq!(cache.peek(&"a"), Some(&1));
        assert_eq!(cache.insert("c", 3), Some(("a", 1)));
    }

    #[test]
    fn test_reinsert_replaces_without_eviction() {
        let mut cache = ModuleCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);

        assert!(cache.insert("a", 10).is_none());
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.keys(), vec!["b", "a"]);
        assert_eq!(cache.peek(&"a"), Some(&10));
    }

    #[test]
    fn test_remove_relinks_list() {
        let mut cache = ModuleCache::new(3);
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("c", 3);

        assert_eq!(cache.remove(&"b"), Some(2));
        assert_eq!(cache.keys(), vec!["a", "c"]);
        assert_eq!(cache.remove(&"b"), None);

        cache.remove(&"a");
        cache.remove(&"c");
        assert!(cache.is_empty());
        assert!(cache.keys().is_empty());

        cache.insert("d", 4);
        assert_eq!(cache.keys(), vec!["d"]);
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let mut cache = ModuleCache::new(0);
        assert_eq!(cache.capacity(), 1);
        cache.insert("a", 1);
        assert_eq!(cache.insert("b", 2), Some(("a", 1)));
        assert_eq!(cache.len(), 1);
    }
}

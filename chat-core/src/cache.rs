//! Bounded least-recently-used cache.
//!
//! Used by the session layer to keep recently visited conversations warm
//! without growing without bound:
//! - `get()` / `insert()` refresh recency
//! - `insert()` over capacity evicts the least recently used entry

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// LRU cache with a fixed capacity.
#[derive(Debug)]
pub struct LruCache<K, V> {
    /// Maximum number of entries.
    capacity: usize,
    /// Keys, least recently used first.
    order: VecDeque<K>,
    /// Stored values.
    entries: HashMap<K, V>,
}

impl<K: Clone + Eq + Hash, V> LruCache<K, V> {
    /// Create a cache holding at most `capacity` entries.
    ///
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            entries: HashMap::with_capacity(capacity),
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get a value and mark it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        if !self.entries.contains_key(key) {
            return None;
        }
        self.touch(key);
        self.entries.get(key)
    }

    /// Insert or replace a value, marking it most recently used.
    ///
    /// Returns the evicted entry, if the insert pushed one out.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if self.entries.insert(key.clone(), value).is_some() {
            self.touch(&key);
            return None;
        }
        self.order.push_back(key);
        if self.entries.len() > self.capacity {
            let oldest = self.order.pop_front()?;
            let evicted = self.entries.remove(&oldest)?;
            return Some((oldest, evicted));
        }
        None
    }

    /// Remove everything, returning the values.
    pub fn drain(&mut self) -> Vec<(K, V)> {
        let mut drained = Vec::with_capacity(self.entries.len());
        while let Some(key) = self.order.pop_front() {
            if let Some(value) = self.entries.remove(&key) {
                drained.push((key, value));
            }
        }
        drained
    }

    fn touch(&mut self, key: &K) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            if let Some(k) = self.order.remove(pos) {
                self.order.push_back(k);
            }
        }
    }
}

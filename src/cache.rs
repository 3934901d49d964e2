//! S3-FIFO cache for value-log chunks.
//!
//! New entries enter a small probationary queue; entries read at least twice
//! before probation ends are promoted to the main queue, everything else
//! falls through to a ghost list that remembers recently evicted keys so a
//! quick re-insert skips probation. Access frequency is capped so one hot
//! burst cannot pin an entry forever.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Maximum frequency credit an entry can accumulate.
const MAX_FREQUENCY_LIMIT: u8 = 3;

struct Entry<V> {
    value: V,
    freq: AtomicU8,
}

pub struct Cache<K, V>
where
    K: PartialEq + Eq + Hash + Clone + Debug,
    V: Clone,
{
    max_cache_size: usize,
    max_main_size: usize,
    /// New keys are appended here first.
    small: VecDeque<K>,
    /// Keys that survived probation.
    main: VecDeque<K>,
    /// Keys recently evicted from small before proving themselves.
    ghost: VecDeque<K>,
    entries: HashMap<K, Entry<V>>,
    stats: Stats,
}

impl<K, V> Cache<K, V>
where
    K: PartialEq + Eq + Hash + Clone + Debug,
    V: Clone,
{
    pub fn new(max_cache_size: usize) -> Self {
        let max_small_size = max_cache_size / 10;
        Cache {
            max_cache_size,
            max_main_size: max_cache_size - max_small_size,
            small: VecDeque::new(),
            main: VecDeque::new(),
            ghost: VecDeque::new(),
            entries: HashMap::new(),
            stats: Stats::new(),
        }
    }

    /// Returns a clone of the cached value for `key`, if present.
    pub fn get(&self, key: &K) -> Option<V> {
        if let Some(entry) = self.entries.get(key) {
            let freq = (entry.freq.load(Ordering::SeqCst) + 1).min(MAX_FREQUENCY_LIMIT);
            entry.freq.store(freq, Ordering::SeqCst);
            self.stats.hit();
            Some(entry.value.clone())
        } else {
            self.stats.miss();
            None
        }
    }

    /// Inserts `value` under `key`, evicting as needed.
    pub fn insert(&mut self, key: K, value: V) {
        if self.max_cache_size == 0 || self.entries.contains_key(&key) {
            return;
        }
        while self.entries.len() >= self.max_cache_size {
            self.evict();
        }

        let entry = Entry {
            value,
            freq: AtomicU8::new(0),
        };
        if let Some(idx) = self.ghost.iter().position(|k| k == &key) {
            // Seen recently: skip probation.
            self.ghost.remove(idx);
            self.main.push_back(key.clone());
        } else {
            self.small.push_back(key.clone());
        }
        self.entries.insert(key, entry);
    }

    /// (hits, misses) since creation.
    pub fn stats(&self) -> (usize, usize) {
        self.stats.get()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict(&mut self) {
        if self.main.len() >= self.max_main_size || self.small.is_empty() {
            self.evict_main();
        } else {
            self.evict_small();
        }
    }

    fn evict_main(&mut self) {
        while let Some(key) = self.main.pop_front() {
            let freq = match self.entries.get(&key) {
                Some(entry) => entry.freq.load(Ordering::SeqCst),
                None => continue,
            };
            if freq > 0 {
                // Second chance, at a discount.
                if let Some(entry) = self.entries.get(&key) {
                    entry.freq.store(freq - 1, Ordering::SeqCst);
                }
                self.main.push_back(key);
            } else {
                self.entries.remove(&key);
                return;
            }
        }
    }

    fn evict_small(&mut self) {
        while let Some(key) = self.small.pop_front() {
            let freq = match self.entries.get(&key) {
                Some(entry) => entry.freq.load(Ordering::SeqCst),
                None => continue,
            };
            if freq > 1 {
                self.main.push_back(key);
            } else {
                self.entries.remove(&key);
                self.remember_ghost(key);
                return;
            }
        }
    }

    fn remember_ghost(&mut self, key: K) {
        if self.ghost.len() >= self.max_cache_size {
            self.ghost.pop_front();
        }
        self.ghost.push_back(key);
    }
}

struct Stats {
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl Stats {
    fn new() -> Self {
        Stats {
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::SeqCst);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::SeqCst);
    }

    fn get(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::SeqCst),
            self.misses.load(Ordering::SeqCst),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut cache: Cache<u64, Vec<u8>> = Cache::new(4);
        cache.insert(1, vec![0xaa]);
        cache.insert(2, vec![0xbb]);

        assert_eq!(cache.get(&1), Some(vec![0xaa]));
        assert_eq!(cache.get(&2), Some(vec![0xbb]));
        assert_eq!(cache.get(&3), None);
        assert_eq!(cache.stats(), (2, 1));
    }

    #[test]
    fn test_capacity_is_bounded() {
        let mut cache: Cache<u64, u64> = Cache::new(8);
        for i in 0..100 {
            cache.insert(i, i);
        }
        assert!(cache.len() <= 8);
    }

    #[test]
    fn test_hot_entries_survive_eviction() {
        let mut cache: Cache<u64, u64> = Cache::new(8);
        cache.insert(42, 42);
        // Promote out of probation.
        cache.get(&42);
        cache.get(&42);

        for i in 0..100 {
            cache.insert(i, i);
            // Keep the hot key hot.
            cache.get(&42);
        }
        assert_eq!(cache.get(&42), Some(42));
    }

    #[test]
    fn test_zero_capacity_caches_nothing() {
        let mut cache: Cache<u64, u64> = Cache::new(0);
        cache.insert(1, 1);
        assert!(cache.is_empty());
        assert_eq!(cache.get(&1), None);
    }

    #[test]
    fn test_duplicate_insert_keeps_first() {
        let mut cache: Cache<u64, u64> = Cache::new(4);
        cache.insert(1, 10);
        cache.insert(1, 20);
        assert_eq!(cache.get(&1), Some(10));
        assert_eq!(cache.len(), 1);
    }
}

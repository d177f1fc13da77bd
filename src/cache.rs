use std::{
    collections::HashMap,
    fmt::Debug,
    hash::Hash,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

struct Entry<V> {
    value: V,
    /// Tick of the most recent access; lowest tick is evicted first.
    last_used: AtomicU64,
}

/// Bounded least-recently-used cache.
///
/// Entries are few and fixed-cost (deserialized node blocks), so eviction is
/// a linear scan for the stalest tick rather than a linked recency list.
/// Correctness never depends on cache contents; a miss falls back to a file
/// read.
pub struct Cache<K, V>
where
    K: PartialEq + Eq + Hash + Clone + Debug,
    V: Clone,
{
    capacity: usize,
    entries: HashMap<K, Entry<V>>,
    tick: AtomicU64,
    stats: Stats,
}

impl<K, V> Cache<K, V>
where
    K: PartialEq + Eq + Hash + Clone + Debug,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        Cache {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            tick: AtomicU64::new(0),
            stats: Stats::new(),
        }
    }

    /// Returns a clone of the cached value and marks it recently used.
    pub fn get(&self, key: &K) -> Option<V> {
        if let Some(entry) = self.entries.get(key) {
            let now = self.tick.fetch_add(1, Ordering::SeqCst) + 1;
            entry.last_used.store(now, Ordering::SeqCst);
            self.stats.hit();
            Some(entry.value.clone())
        } else {
            self.stats.miss();
            None
        }
    }

    /// Inserts a new entry, evicting the least recently used one when full.
    pub fn insert(&mut self, key: K, value: V) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.evict();
        }
        let now = self.tick.fetch_add(1, Ordering::SeqCst) + 1;
        self.entries.insert(
            key,
            Entry {
                value,
                last_used: AtomicU64::new(now),
            },
        );
    }

    /// Drops every entry, e.g. when the backing file is discarded.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// (hits, misses) counters.
    pub fn stats(&self) -> (usize, usize) {
        self.stats.get()
    }

    fn evict(&mut self) {
        let stalest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used.load(Ordering::SeqCst))
            .map(|(key, _)| key.clone());
        if let Some(key) = stalest {
            self.entries.remove(&key);
        }
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
        let mut cache = Cache::new(2);

        cache.insert("apple", "red");
        cache.insert("banana", "yellow");

        assert_eq!(cache.get(&"apple"), Some("red"));
        assert_eq!(cache.get(&"banana"), Some("yellow"));
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let mut cache = Cache::new(2);

        cache.insert(1, "one");
        cache.insert(2, "two");

        // Touch 1 so that 2 becomes the eviction candidate.
        assert_eq!(cache.get(&1), Some("one"));

        cache.insert(3, "three");

        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&1), Some("one"));
        assert_eq!(cache.get(&3), Some("three"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_reinsert_does_not_evict() {
        let mut cache = Cache::new(2);

        cache.insert(1, "one");
        cache.insert(2, "two");
        cache.insert(2, "two again");

        assert_eq!(cache.get(&1), Some("one"));
        assert_eq!(cache.get(&2), Some("two again"));
    }

    #[test]
    fn test_clear() {
        let mut cache = Cache::new(4);
        cache.insert(1, 1);
        cache.insert(2, 2);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.get(&1), None);
    }

    #[test]
    fn test_hit_ratio() {
        let cap = 10;
        let mut cache = Cache::new(cap);

        for i in 0..cap {
            cache.insert(i, i);
        }

        for i in 0..cap {
            assert_eq!(cache.get(&i), Some(i));
        }

        let (hits, misses) = cache.stats();
        assert_eq!(hits, cap);
        assert_eq!(misses, 0);

        assert_eq!(cache.get(&cap), None);
        let (_, misses) = cache.stats();
        assert_eq!(misses, 1);
    }
}

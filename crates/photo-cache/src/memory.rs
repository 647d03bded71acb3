//! Weight-bounded in-process LRU tier

use crate::value::Weighted;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

struct Inner<V> {
    /// Values with the weight they were admitted at
    entries: LruCache<String, (V, u64)>,
    size: u64,
    max_size: u64,
}

impl<V> Inner<V> {
    fn remove(&mut self, key: &str) -> bool {
        match self.entries.pop(key) {
            Some((_, weight)) => {
                self.size -= weight;
                true
            }
            None => false,
        }
    }
}

/// Bounded LRU map from cache key to value, sized by [`Weighted::weight`]
pub struct MemoryStore<V> {
    inner: Mutex<Inner<V>>,
}

impl<V: Weighted + Clone> MemoryStore<V> {
    pub fn new(max_size: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                size: 0,
                max_size,
            }),
        }
    }

    /// Insert or replace a value, evicting least recently used entries to
    /// make room. A value heavier than the whole budget is not stored and
    /// any previous value for the key is dropped; returns `false` then.
    pub fn put(&self, key: &str, value: V) -> bool {
        let weight = value.weight();
        let mut inner = self.inner.lock();
        inner.remove(key);

        if weight > inner.max_size {
            debug!(key, weight, max_size = inner.max_size, "Value too large for memory cache");
            return false;
        }

        while inner.size + weight > inner.max_size {
            match inner.entries.pop_lru() {
                Some((evicted, (_, w))) => {
                    inner.size -= w;
                    debug!(key = %evicted, weight = w, "Evicted from memory cache");
                }
                None => break,
            }
        }

        inner.entries.put(key.to_string(), (value, weight));
        inner.size += weight;
        true
    }

    /// Look up a value and mark it most recently used
    pub fn get(&self, key: &str) -> Option<V> {
        self.inner.lock().entries.get(key).map(|(v, _)| v.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().entries.contains(key)
    }

    pub fn remove(&self, key: &str) -> bool {
        self.inner.lock().remove(key)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.size = 0;
    }

    /// Total weight of the stored values
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    pub fn max_size(&self) -> u64 {
        self.inner.lock().max_size
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    impl Weighted for Vec<u8> {
        fn weight(&self) -> u64 {
            self.len() as u64
        }
    }

    #[test]
    fn test_put_and_get() {
        let store = MemoryStore::new(100);
        assert!(store.put("a", vec![1, 2, 3]));
        assert_eq!(store.get("a"), Some(vec![1, 2, 3]));
        assert_eq!(store.size(), 3);
        assert_eq!(store.len(), 1);
        assert!(store.get("b").is_none());
    }

    #[test]
    fn test_replace_updates_size() {
        let store = MemoryStore::new(100);
        store.put("a", vec![0; 40]);
        store.put("a", vec![0; 10]);
        assert_eq!(store.size(), 10);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let store = MemoryStore::new(100);
        store.put("a", vec![0; 40]);
        store.put("b", vec![0; 40]);
        // touching a leaves b as the eviction candidate
        assert!(store.get("a").is_some());
        store.put("c", vec![0; 40]);

        assert!(store.contains("a"));
        assert!(!store.contains("b"));
        assert!(store.contains("c"));
        assert_eq!(store.size(), 80);
    }

    #[test]
    fn test_contains_does_not_promote() {
        let store = MemoryStore::new(100);
        store.put("a", vec![0; 40]);
        store.put("b", vec![0; 40]);
        assert!(store.contains("a"));
        store.put("c", vec![0; 40]);

        assert!(!store.contains("a"));
        assert!(store.contains("b"));
    }

    #[test]
    fn test_oversized_value_is_refused() {
        let store = MemoryStore::new(10);
        store.put("a", vec![0; 5]);
        assert!(!store.put("a", vec![0; 11]));
        // the stale value is gone too
        assert!(store.get("a").is_none());
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn test_remove_and_clear() {
        let store = MemoryStore::new(100);
        store.put("a", vec![0; 5]);
        store.put("b", vec![0; 5]);

        assert!(store.remove("a"));
        assert!(!store.remove("a"));
        assert_eq!(store.size(), 5);

        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.size(), 0);
        assert_eq!(store.max_size(), 100);
    }
}

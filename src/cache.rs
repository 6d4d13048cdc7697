//! Keyed Build Caches
//!
//! Deduplication layer in front of the build pipelines: one key, at most one
//! build, any number of holders of the shared result.

use std::hash::Hash;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// Thread-safe map from a deduplication key to a shared build product.
///
/// [`KeyedCache::get_or_add`] runs its factory under the map lock, so two
/// racing callers with the same key observe exactly one factory run and the
/// loser receives the winner's value. Factories must therefore stay cheap:
/// allocate and record, never block or build.
pub struct KeyedCache<K, V> {
    entries: Mutex<FxHashMap<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> KeyedCache<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(FxHashMap::default()),
        }
    }

    /// Value for `key`, if a build was already requested.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.lock().get(key).cloned()
    }

    /// Returns the cached value for `key`, running `make` to produce one on
    /// a miss. The boolean is `true` when this call inserted the value.
    pub fn get_or_add(&self, key: &K, make: impl FnOnce() -> V) -> (V, bool) {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(key) {
            return (existing.clone(), false);
        }
        let value = make();
        entries.insert(key.clone(), value.clone());
        (value, true)
    }

    /// Inserts or replaces outright.
    pub fn add_or_set(&self, key: K, value: V) {
        self.entries.lock().insert(key, value);
    }

    /// Removes a single entry, returning it if present.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.lock().remove(key)
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Default for KeyedCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_hit_returns_shared_value() {
        let cache: KeyedCache<String, Arc<u32>> = KeyedCache::new();
        let (first, inserted) = cache.get_or_add(&"k".to_string(), || Arc::new(1));
        assert!(inserted);

        let (second, inserted) = cache.get_or_add(&"k".to_string(), || Arc::new(2));
        assert!(!inserted);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_exactly_one_factory_run_under_contention() {
        let cache: Arc<KeyedCache<u32, Arc<u32>>> = Arc::new(KeyedCache::new());
        let runs = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let cache = Arc::clone(&cache);
                let runs = Arc::clone(&runs);
                scope.spawn(move || {
                    cache.get_or_add(&7, || {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Arc::new(7)
                    })
                });
            }
        });

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remove_and_clear() {
        let cache: KeyedCache<u32, u32> = KeyedCache::new();
        cache.add_or_set(1, 10);
        cache.add_or_set(2, 20);

        assert_eq!(cache.remove(&1), Some(10));
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }
}

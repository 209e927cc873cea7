//! In-memory cache for storing key-value pairs.
//!
//! Uses moka's concurrent cache implementation.

use moka::sync::Cache;

/// Thread-safe in-memory cache with bounded capacity.
///
/// Used for storing:
/// - Compiled flows (`MemCache<String, Arc<Flow>>`, keyed by `id@version`)
/// - In-flight execution signals (`MemCache<ExecutionId, Arc<ExecutionSignal>>`)
#[derive(Clone)]
pub struct MemCache<K, V> {
    entries: Cache<K, V>,
}

impl<K, V> MemCache<K, V>
where
    K: std::hash::Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Allocate a new [`MemCache`].
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Cache::new(capacity as u64),
        }
    }

    pub fn set(
        &self,
        key: K,
        value: V,
    ) {
        self.entries.insert(key, value);
    }

    pub fn get(
        &self,
        key: &K,
    ) -> Option<V> {
        self.entries.get(key)
    }

    pub fn remove(
        &self,
        key: &K,
    ) {
        self.entries.invalidate(key);
    }

    /// Drops every entry whose key satisfies `f`.
    pub fn remove_if(
        &self,
        f: impl Fn(&K) -> bool,
    ) {
        let keys: Vec<_> = self.entries.iter().filter(|(k, _)| f(k)).map(|(k, _)| k).collect();
        for key in keys {
            self.entries.invalidate(&*key);
        }
    }
}

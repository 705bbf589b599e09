//! Keyed pool with optimistic creation outside the lock.
//!
//! Lookups take the read lock. On a miss the resource is created with no
//! pool lock held, then reconciled under the write lock: if another caller
//! inserted first, the fresh resource is dropped and the pooled one returned.

use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;

pub struct Pool<K, V> {
    entries: RwLock<FxHashMap<K, Arc<V>>>,
}

impl<K, V> Pool<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(key).cloned()
    }

    /// Return the pooled value for `key`, creating it with `create` on a miss.
    ///
    /// Creation errors are returned and nothing is inserted. Exactly one
    /// value per key wins; losers are dropped before this returns.
    pub async fn get_or_create<F, Fut, E>(&self, key: &K, create: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(existing) = self.get(key) {
            return Ok(existing);
        }

        let fresh = Arc::new(create().await?);

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = entries.get(key) {
            let existing = existing.clone();
            drop(entries);
            tracing::trace!("discarding duplicate pooled resource");
            drop(fresh);
            return Ok(existing);
        }
        entries.insert(key.clone(), fresh.clone());
        Ok(fresh)
    }

    /// Remove `key` only if it still maps to `value`.
    ///
    /// Other holders of `value` keep using it; later lookups create a new one.
    pub fn invalidate(&self, key: &K, value: &Arc<V>) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some(current) if Arc::ptr_eq(current, value) => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Drop entries matching `evict` that no caller currently holds.
    ///
    /// Returns the number of entries removed.
    pub fn evict_unused<P>(&self, mut evict: P) -> usize
    where
        P: FnMut(&K, &V) -> bool,
    {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|k, v| Arc::strong_count(v) > 1 || !evict(k, v));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .map(|e| e.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Default for Pool<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

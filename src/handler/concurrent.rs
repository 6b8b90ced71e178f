//! Sharded concurrent map used by the Pass 2 handler.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use parking_lot::RwLock;
use twox_hash::XxHash64;

const DEFAULT_SHARDS: usize = 32;

pub(crate) fn hash_key<K: Hash>(key: &K) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    key.hash(&mut hasher);
    hasher.finish()
}

/// A hash map split into independently locked shards.
///
/// Inserts are "insert if absent": the first value stored for a key wins and every caller
/// gets that value back, which keeps concurrent synthesis of the same entry idempotent.
#[derive(Debug)]
pub struct ConcurrentMap<K, V> {
    shards: Box<[RwLock<HashMap<K, V>>]>,
}

impl<K: Hash + Eq, V: Clone> ConcurrentMap<K, V> {
    /// Creates a map with the default shard count.
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    /// Creates a map with `shards` shards (at least one).
    pub fn with_shards(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1))
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
        }
    }

    fn shard(&self, key: &K) -> &RwLock<HashMap<K, V>> {
        let idx = (hash_key(key) % self.shards.len() as u64) as usize;
        &self.shards[idx]
    }

    /// Looks a key up.
    pub fn get(&self, key: &K) -> Option<V> {
        self.shard(key).read().get(key).cloned()
    }

    /// Returns the value for `key`, computing and storing it first if absent.
    ///
    /// `make` may run on several threads for the same key; only one result is kept.
    pub fn get_or_insert_with<E>(
        &self,
        key: K,
        make: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        let shard = self.shard(&key);
        if let Some(v) = shard.read().get(&key) {
            return Ok(v.clone());
        }
        let value = make()?;
        let mut guard = shard.write();
        Ok(guard.entry(key).or_insert(value).clone())
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.read().is_empty())
    }

    /// Consumes the map into its entries, in no particular order.
    pub fn into_entries(self) -> Vec<(K, V)> {
        self.shards
            .into_vec()
            .into_iter()
            .flat_map(|s| s.into_inner())
            .collect()
    }
}

impl<K: Hash + Eq, V: Clone> Default for ConcurrentMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

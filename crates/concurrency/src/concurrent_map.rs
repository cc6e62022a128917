//! Sharded concurrent map
//!
//! A fixed array of independently locked `HashMap`s. A key always lives in
//! the shard picked by its hash, so single-key operations lock exactly one
//! shard and operations on different shards never contend.

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};

use parking_lot::RwLock;

/// Default number of shards
pub const DEFAULT_SHARD_COUNT: usize = 32;

/// Upper bound for the shard count (a power of two)
pub const MAX_SHARD_COUNT: usize = 1 << 12;

/// Concurrent map partitioned into `shard_count` locked shards
///
/// # Consistency
///
/// Single-key operations are atomic. `update`, `compare_and_swap`,
/// `remove_if`, `get_or_set` and `get_or_compute` hold the key's shard
/// write lock for the whole check-and-set.
///
/// Whole-map operations (`size`, `keys`, `values`, `items`, `for_each`,
/// `clear`) visit shards one after another, each under its own lock. They
/// are **not** a snapshot: a concurrent writer may be observed in shards
/// visited later and missed in shards visited earlier.
///
/// # Example
///
/// ```
/// use everruns_concurrency::ConcurrentMap;
///
/// let sessions: ConcurrentMap<String, u32> = ConcurrentMap::new();
/// sessions.set("alice".to_string(), 1);
/// let hits = sessions.update("alice".to_string(), |v| v.copied().unwrap_or(0) + 1);
/// assert_eq!(hits, 2);
/// assert_eq!(sessions.get("alice"), Some(2));
/// ```
pub struct ConcurrentMap<K, V> {
    shards: Box<[RwLock<HashMap<K, V>>]>,
    hasher: RandomState,
}

impl<K, V> std::fmt::Debug for ConcurrentMap<K, V>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentMap")
            .field("shards", &self.shards.len())
            .field("size", &self.size())
            .finish()
    }
}

impl<K, V> Default for ConcurrentMap<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> ConcurrentMap<K, V>
where
    K: Eq + Hash,
{
    /// Map with [`DEFAULT_SHARD_COUNT`] shards
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARD_COUNT)
    }

    /// Map with `shard_count` rounded up to a power of two, between 1 and
    /// [`MAX_SHARD_COUNT`]
    pub fn with_shards(shard_count: usize) -> Self {
        let shard_count = shard_count.clamp(1, MAX_SHARD_COUNT).next_power_of_two();
        let shards = (0..shard_count)
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            hasher: RandomState::new(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard<Q>(&self, key: &Q) -> &RwLock<HashMap<K, V>>
    where
        K: Borrow<Q>,
        Q: Hash + ?Sized,
    {
        // shard count is a power of two
        let index = self.hasher.hash_one(key) as usize & (self.shards.len() - 1);
        &self.shards[index]
    }

    /// Clone of the value for `key`
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.shard(key).read().get(key).cloned()
    }

    /// Insert `value`, returning the previous value
    pub fn set(&self, key: K, value: V) -> Option<V> {
        self.shard(&key).write().insert(key, value)
    }

    /// Remove `key`, returning its value
    pub fn delete<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shard(key).write().remove(key)
    }

    pub fn has<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shard(key).read().contains_key(key)
    }

    /// Value for `key`, inserting `default` if absent
    pub fn get_or_set(&self, key: K, default: V) -> V
    where
        V: Clone,
    {
        let shard = self.shard(&key);
        if let Some(value) = shard.read().get(&key) {
            return value.clone();
        }
        shard.write().entry(key).or_insert(default).clone()
    }

    /// Value for `key`, computing and inserting it if absent
    ///
    /// `compute` runs under the shard's write lock and at most once per
    /// missing key, even when several callers race on the same key. It must
    /// not access this map.
    pub fn get_or_compute<F>(&self, key: K, compute: F) -> V
    where
        F: FnOnce() -> V,
        V: Clone,
    {
        let shard = self.shard(&key);
        if let Some(value) = shard.read().get(&key) {
            return value.clone();
        }
        shard.write().entry(key).or_insert_with(compute).clone()
    }

    /// Replace the value for `key` with `f(current)`, returning the new value
    pub fn update<F>(&self, key: K, f: F) -> V
    where
        F: FnOnce(Option<&V>) -> V,
        V: Clone,
    {
        let mut shard = self.shard(&key).write();
        let value = f(shard.get(&key));
        shard.insert(key, value.clone());
        value
    }

    /// Set `key` to `new` only if it currently holds `expected`
    pub fn compare_and_swap<Q>(&self, key: &Q, expected: &V, new: V) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: PartialEq,
    {
        match self.shard(key).write().get_mut(key) {
            Some(current) if *current == *expected => {
                *current = new;
                true
            }
            _ => false,
        }
    }

    /// Remove `key` if `predicate` holds for its value
    pub fn remove_if<Q, F>(&self, key: &Q, predicate: F) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&V) -> bool,
    {
        let mut shard = self.shard(key).write();
        if shard.get(key).is_some_and(predicate) {
            shard.remove(key)
        } else {
            None
        }
    }

    /// Number of entries (weakly consistent)
    pub fn size(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| shard.read().is_empty())
    }

    /// All keys (weakly consistent)
    pub fn keys(&self) -> Vec<K>
    where
        K: Clone,
    {
        let mut keys = Vec::new();
        for shard in self.shards.iter() {
            keys.extend(shard.read().keys().cloned());
        }
        keys
    }

    /// All values (weakly consistent)
    pub fn values(&self) -> Vec<V>
    where
        V: Clone,
    {
        let mut values = Vec::new();
        for shard in self.shards.iter() {
            values.extend(shard.read().values().cloned());
        }
        values
    }

    /// All entries (weakly consistent)
    pub fn items(&self) -> Vec<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        let mut items = Vec::new();
        for shard in self.shards.iter() {
            items.extend(shard.read().iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        items
    }

    /// Visit every entry, one shard at a time under its read lock
    ///
    /// `f` must not write to this map.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V),
    {
        for shard in self.shards.iter() {
            for (key, value) in shard.read().iter() {
                f(key, value);
            }
        }
    }

    /// Remove every entry (weakly consistent)
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.write().clear();
        }
    }
}

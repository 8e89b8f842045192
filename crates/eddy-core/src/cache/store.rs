//! The diff core — a keyed map that turns mutations into change-sets.
//!
//! [`KeyedCache`] is the synchronous, single-owner half of the engine: it
//! owns the `key → Entry` mapping, preserves insertion order, and computes
//! the minimal [`ChangeSet`] for every mutation. Fan-out, locking, and
//! lifecycle live one layer up in [`SourceCache`](super::SourceCache).
//!
//! # Key equality
//!
//! The pluggable key-equality strategy is the `K: Hash + Eq` bound itself:
//! composite key types get deep structural equality by deriving, which is
//! the seam callers use to customize identity.

use fxhash::FxHashMap;
use tokio::time::Instant;

use crate::change::{Change, ChangeSet};

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

/// One live cache entry: `(key, value, inserted_at)`.
///
/// `inserted_at` records the last write (insert or replace) and is what the
/// expiry scheduler measures age against.
#[derive(Debug, Clone)]
pub struct Entry<K, V> {
    key: K,
    value: V,
    inserted_at: Instant,
}

impl<K, V> Entry<K, V> {
    fn new(key: K, value: V) -> Self {
        Self {
            key,
            value,
            inserted_at: Instant::now(),
        }
    }

    /// Returns the entry's key.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Returns the entry's value.
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Returns the instant of the last write to this entry.
    #[must_use]
    pub fn inserted_at(&self) -> Instant {
        self.inserted_at
    }

    /// Returns the time elapsed since the last write.
    #[must_use]
    pub fn age(&self) -> std::time::Duration {
        self.inserted_at.elapsed()
    }

    /// Consumes the entry, returning its value.
    pub fn into_value(self) -> V {
        self.value
    }
}

// ---------------------------------------------------------------------------
// KeyedCache
// ---------------------------------------------------------------------------

/// The authoritative keyed store with diff emission.
///
/// Every mutation returns the [`ChangeSet`] describing exactly what changed;
/// an empty change-set means the mutation was a no-op (value-equal update,
/// remove of an absent key). Iteration and `clear` follow insertion order.
#[derive(Debug)]
pub struct KeyedCache<K, V> {
    entries: FxHashMap<K, Entry<K, V>>,
    /// Keys in insertion order. Kept in sync with `entries`.
    order: Vec<K>,
}

impl<K, V> KeyedCache<K, V>
where
    K: Clone + Eq + std::hash::Hash,
    V: Clone + PartialEq,
{
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: FxHashMap::default(),
            order: Vec::new(),
        }
    }

    /// Inserts or replaces the value for `key`.
    ///
    /// - Absent key → one `Add`.
    /// - Present with a different value (`PartialEq`) → one `Update`
    ///   carrying the previous value.
    /// - Present with an equal value → empty change-set (redundant writes
    ///   emit nothing).
    pub fn add_or_update(&mut self, key: K, value: V) -> ChangeSet<K, V> {
        let mut out = ChangeSet::new();
        self.add_or_update_into(key, value, &mut out);
        out
    }

    /// Inserts or replaces a batch of `(key, value)` pairs as one change-set.
    pub fn add_or_update_many<I>(&mut self, pairs: I) -> ChangeSet<K, V>
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let mut out = ChangeSet::new();
        for (key, value) in pairs {
            self.add_or_update_into(key, value, &mut out);
        }
        out
    }

    fn add_or_update_into(&mut self, key: K, value: V, out: &mut ChangeSet<K, V>) {
        if let Some(entry) = self.entries.get_mut(&key) {
            if entry.value == value {
                return;
            }
            let previous = std::mem::replace(&mut entry.value, value.clone());
            entry.inserted_at = Instant::now();
            out.push(Change::update(key, value, previous));
        } else {
            self.order.push(key.clone());
            self.entries
                .insert(key.clone(), Entry::new(key.clone(), value.clone()));
            out.push(Change::add(key, value));
        }
    }

    /// Removes `key` if present.
    ///
    /// Present → one `Remove` carrying the previous value; absent → empty
    /// change-set, no error.
    pub fn remove(&mut self, key: &K) -> ChangeSet<K, V> {
        match self.entries.remove(key) {
            Some(entry) => {
                self.order.retain(|k| k != key);
                ChangeSet::single(Change::remove(entry.key, entry.value))
            }
            None => ChangeSet::new(),
        }
    }

    /// Removes a batch of keys as one change-set. Absent keys are skipped.
    pub fn remove_many<'a, I>(&mut self, keys: I) -> ChangeSet<K, V>
    where
        I: IntoIterator<Item = &'a K>,
        K: 'a,
    {
        let mut out = ChangeSet::new();
        for key in keys {
            if let Some(entry) = self.entries.remove(key) {
                self.order.retain(|k| k != key);
                out.push(Change::remove(entry.key, entry.value));
            }
        }
        out
    }

    /// Removes every entry, emitting one `Remove` per key in insertion
    /// order, as a single change-set.
    pub fn clear(&mut self) -> ChangeSet<K, V> {
        let order = std::mem::take(&mut self.order);
        let mut out = ChangeSet::with_capacity(order.len());
        for key in order {
            if let Some(entry) = self.entries.remove(&key) {
                out.push(Change::remove(entry.key, entry.value));
            }
        }
        out
    }

    /// Forces a `Refresh` change for an unchanged value.
    ///
    /// Used when a contained object mutated in place without a
    /// value-equality change — the cache cannot detect interior mutation on
    /// its own. Absent keys emit nothing.
    pub fn refresh(&mut self, key: &K) -> ChangeSet<K, V> {
        match self.entries.get(key) {
            Some(entry) => {
                ChangeSet::single(Change::refresh(entry.key.clone(), entry.value.clone()))
            }
            None => ChangeSet::new(),
        }
    }

    /// Returns the value for `key`, if present.
    pub fn lookup(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|e| &e.value)
    }

    /// Returns `true` if `key` is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Returns the number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the store holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the current entries in insertion order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Entry<K, V>> {
        self.order
            .iter()
            .filter_map(|k| self.entries.get(k).cloned())
            .collect()
    }

    /// Iterates over entries in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = &Entry<K, V>> {
        self.order.iter().filter_map(|k| self.entries.get(k))
    }

    /// Returns the keys in insertion order.
    #[must_use]
    pub fn keys(&self) -> Vec<K> {
        self.order.clone()
    }
}

impl<K, V> Default for KeyedCache<K, V>
where
    K: Clone + Eq + std::hash::Hash,
    V: Clone + PartialEq,
{
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeReason;

    #[test]
    fn test_store_add_then_update() {
        let mut store = KeyedCache::new();

        let cs = store.add_or_update("a", 1);
        assert_eq!(cs.len(), 1);
        assert_eq!(cs.adds(), 1);

        let cs = store.add_or_update("a", 2);
        assert_eq!(cs.len(), 1);
        assert_eq!(cs.updates(), 1);
        let change = cs.iter().next().unwrap();
        assert_eq!(change.current, Some(2));
        assert_eq!(change.previous, Some(1));

        assert_eq!(store.lookup(&"a"), Some(&2));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_store_value_equal_update_is_noop() {
        let mut store = KeyedCache::new();
        store.add_or_update("a", 1);

        let cs = store.add_or_update("a", 1);
        assert!(cs.is_empty());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_store_remove_absent_is_noop() {
        let mut store: KeyedCache<&str, i32> = KeyedCache::new();
        let cs = store.remove(&"missing");
        assert!(cs.is_empty());
    }

    #[test]
    fn test_store_remove_carries_previous() {
        let mut store = KeyedCache::new();
        store.add_or_update("a", 7);

        let cs = store.remove(&"a");
        assert_eq!(cs.removes(), 1);
        let change = cs.iter().next().unwrap();
        assert_eq!(change.reason, ChangeReason::Remove);
        assert_eq!(change.current, None);
        assert_eq!(change.previous, Some(7));
        assert!(store.is_empty());
    }

    #[test]
    fn test_store_clear_emits_insertion_order() {
        let mut store = KeyedCache::new();
        store.add_or_update("b", 2);
        store.add_or_update("a", 1);
        store.add_or_update("c", 3);

        let cs = store.clear();
        assert_eq!(cs.len(), 3);
        assert_eq!(cs.removes(), 3);
        let keys: Vec<&str> = cs.iter().map(|c| c.key).collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
        assert!(store.is_empty());
        assert!(store.keys().is_empty());
    }

    #[test]
    fn test_store_refresh() {
        let mut store = KeyedCache::new();
        store.add_or_update("a", 1);

        let cs = store.refresh(&"a");
        assert_eq!(cs.refreshes(), 1);
        let change = cs.iter().next().unwrap();
        assert_eq!(change.current, Some(1));

        // Refresh of an absent key emits nothing.
        assert!(store.refresh(&"missing").is_empty());
    }

    #[test]
    fn test_store_batch_add_or_update() {
        let mut store = KeyedCache::new();
        store.add_or_update("a", 1);

        let cs = store.add_or_update_many([("a", 10), ("b", 2), ("c", 3)]);
        assert_eq!(cs.len(), 3);
        assert_eq!(cs.adds(), 2);
        assert_eq!(cs.updates(), 1);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_store_remove_many_skips_absent() {
        let mut store = KeyedCache::new();
        store.add_or_update("a", 1);
        store.add_or_update("b", 2);

        let cs = store.remove_many([&"a", &"missing", &"b"]);
        assert_eq!(cs.removes(), 2);
        assert!(store.is_empty());
    }

    #[test]
    fn test_store_snapshot_order_and_content() {
        let mut store = KeyedCache::new();
        store.add_or_update("x", 1);
        store.add_or_update("y", 2);
        store.add_or_update("x", 3);

        let snap = store.snapshot();
        assert_eq!(snap.len(), 2);
        // Updates do not change insertion order.
        assert_eq!(*snap[0].key(), "x");
        assert_eq!(*snap[0].value(), 3);
        assert_eq!(*snap[1].key(), "y");
    }

    #[test]
    fn test_store_composite_keys_deep_equality() {
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        struct Composite {
            tenant: String,
            id: u64,
        }

        let mut store = KeyedCache::new();
        let k1 = Composite {
            tenant: "t".into(),
            id: 1,
        };
        store.add_or_update(k1.clone(), "v1");

        // A structurally-equal key addresses the same entry.
        let k1_again = Composite {
            tenant: "t".into(),
            id: 1,
        };
        let cs = store.add_or_update(k1_again.clone(), "v2");
        assert_eq!(cs.updates(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.lookup(&k1_again), Some(&"v2"));
    }

    #[test]
    fn test_entry_age_tracks_last_write() {
        let mut store = KeyedCache::new();
        store.add_or_update("a", 1);
        let first = store.snapshot()[0].inserted_at();

        store.add_or_update("a", 2);
        let second = store.snapshot()[0].inserted_at();
        assert!(second >= first);
    }
}

//! The authoritative cache handle — [`SourceCache`].
//!
//! A `SourceCache` owns the diffing store and the subscriber fan-out. It is
//! an explicit, cloneable handle with a creation/teardown lifecycle; share
//! it by cloning (cheap, `Arc`-backed) and inject it where it is needed
//! rather than through a process-wide accessor.
//!
//! # Atomicity
//!
//! Every mutation locks the state, applies the diff, and fans the resulting
//! [`ChangeSet`] out while still holding the lock. Batches from two
//! mutations are therefore never interleaved, and `connect` registers its
//! subscriber under the same lock that snapshots the catch-up batch — a new
//! subscriber sees exactly the entries present at connect time plus every
//! later batch, with no gaps and no duplicates.
//!
//! Mutations are expected to originate from a single logical writer;
//! delivery to subscribers is asynchronous and independently paced.

use std::hash::Hash;
use std::sync::{Arc, Mutex};

use crate::cache::registry::SubscriberRegistry;
use crate::cache::store::{Entry, KeyedCache};
use crate::cache::stream::ChangeSetStream;
use crate::cache::SubscriptionMetrics;
use crate::change::{Change, ChangeSet};

// ---------------------------------------------------------------------------
// CacheClosed
// ---------------------------------------------------------------------------

/// Error returned when connecting to a cache that has been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("source cache is closed")]
pub struct CacheClosed;

// ---------------------------------------------------------------------------
// SourceCache
// ---------------------------------------------------------------------------

pub(crate) struct CacheState<K, V> {
    pub(crate) store: KeyedCache<K, V>,
    pub(crate) closed: bool,
}

pub(crate) struct Inner<K, V> {
    pub(crate) state: Mutex<CacheState<K, V>>,
    pub(crate) registry: Arc<SubscriberRegistry<K, V>>,
}

/// The authoritative mutable keyed cache with change-set fan-out.
///
/// Cloning the handle shares the same underlying cache.
pub struct SourceCache<K, V> {
    pub(crate) inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for SourceCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> std::fmt::Debug for SourceCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceCache")
            .field("subscribers", &self.inner.registry.subscriber_count())
            .finish_non_exhaustive()
    }
}

#[allow(clippy::missing_panics_doc)] // Methods panic only on a poisoned Mutex
impl<K, V> SourceCache<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone + PartialEq,
{
    /// Creates a new, empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(CacheState {
                    store: KeyedCache::new(),
                    closed: false,
                }),
                registry: Arc::new(SubscriberRegistry::new()),
            }),
        }
    }

    // -- Mutation API -------------------------------------------------------

    /// Inserts or replaces the value for `key`.
    ///
    /// Emits one `Add` (absent key) or one `Update` (changed value); a
    /// value-equal write emits nothing.
    pub fn add_or_update(&self, key: K, value: V) {
        self.inner.mutate(|store| store.add_or_update(key, value));
    }

    /// Inserts or replaces a batch of pairs, emitted as one change-set.
    pub fn add_or_update_many<I>(&self, pairs: I)
    where
        I: IntoIterator<Item = (K, V)>,
    {
        self.inner.mutate(|store| store.add_or_update_many(pairs));
    }

    /// Removes `key` if present; absent keys are a silent no-op.
    pub fn remove(&self, key: &K) {
        self.inner.mutate(|store| store.remove(key));
    }

    /// Removes a batch of keys as one change-set.
    pub fn remove_many<'a, I>(&self, keys: I)
    where
        I: IntoIterator<Item = &'a K>,
        K: 'a,
    {
        self.inner.mutate(|store| store.remove_many(keys));
    }

    /// Removes every entry, emitting one `Remove` per key as a single
    /// change-set in insertion order.
    pub fn clear(&self) {
        self.inner.mutate(KeyedCache::clear);
    }

    /// Forces a `Refresh` change for `key` without altering its value.
    pub fn refresh(&self, key: &K) {
        self.inner.mutate(|store| store.refresh(key));
    }

    // -- Query API ----------------------------------------------------------

    /// Returns the current entries in insertion order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Entry<K, V>> {
        self.inner.state.lock().unwrap().store.snapshot()
    }

    /// Returns the current entries sorted by the given comparator.
    #[must_use]
    pub fn snapshot_sorted<F>(&self, mut ordering: F) -> Vec<Entry<K, V>>
    where
        F: FnMut(&Entry<K, V>, &Entry<K, V>) -> std::cmp::Ordering,
    {
        let mut snap = self.snapshot();
        snap.sort_by(&mut ordering);
        snap
    }

    /// Returns the value for `key`, if present.
    #[must_use]
    pub fn lookup(&self, key: &K) -> Option<V> {
        self.inner.state.lock().unwrap().store.lookup(key).cloned()
    }

    /// Returns `true` if `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.state.lock().unwrap().store.contains_key(key)
    }

    /// Returns the number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().store.len()
    }

    /// Returns `true` if the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().unwrap().store.is_empty()
    }

    /// Returns the keys in insertion order.
    #[must_use]
    pub fn keys(&self) -> Vec<K> {
        self.inner.state.lock().unwrap().store.keys()
    }

    /// Returns the number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.registry.subscriber_count()
    }

    /// Returns metrics for one subscription, if it is still live.
    #[must_use]
    pub fn subscription_metrics(
        &self,
        id: crate::cache::SubscriptionId,
    ) -> Option<SubscriptionMetrics> {
        self.inner.registry.metrics(id)
    }

    // -- Subscription API ---------------------------------------------------

    /// Connects a new subscriber.
    ///
    /// The returned stream's first item is a catch-up batch containing one
    /// `Add` per entry present right now, in the cache's current order
    /// (possibly empty); every subsequent item is a live mutation batch.
    ///
    /// # Errors
    ///
    /// Returns [`CacheClosed`] if the cache has been closed.
    pub fn connect(&self) -> Result<ChangeSetStream<K, V>, CacheClosed> {
        let state = self.inner.state.lock().unwrap();
        if state.closed {
            return Err(CacheClosed);
        }

        // Snapshot and register under the same lock: no mutation can land
        // between the catch-up batch and the first live batch.
        let initial: ChangeSet<K, V> = state
            .store
            .entries()
            .map(|e| Change::add(e.key().clone(), e.value().clone()))
            .collect();

        let (id, rx) = self.inner.registry.create();
        self.inner.registry.deliver_initial(id, initial);
        drop(state);

        Ok(ChangeSetStream::new(
            id,
            Arc::clone(&self.inner.registry),
            rx,
        ))
    }

    // -- Lifecycle ----------------------------------------------------------

    /// Closes the cache.
    ///
    /// Ends every subscriber stream, detaches any expiry scheduler, and
    /// turns further mutations into warn-and-ignore no-ops. Idempotent.
    /// Entries are retained for queries.
    pub fn close(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.closed = true;
        self.inner.registry.close_all();
    }

    /// Returns `true` if the cache has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().unwrap().closed
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<Inner<K, V>> {
        Arc::downgrade(&self.inner)
    }
}

impl<K, V> Inner<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone + PartialEq,
{
    /// Applies one mutation and fans its change-set out atomically.
    ///
    /// The state lock is held across both the store update and the
    /// broadcast, so subscribers observe whole batches in mutation order.
    pub(crate) fn mutate<F>(&self, f: F)
    where
        F: FnOnce(&mut KeyedCache<K, V>) -> ChangeSet<K, V>,
    {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            tracing::warn!("mutation ignored: cache is closed");
            return;
        }
        let changes = f(&mut state.store);
        if !changes.is_empty() {
            self.registry.broadcast(&changes);
        }
    }
}

impl<K, V> Default for SourceCache<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone + PartialEq,
{
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

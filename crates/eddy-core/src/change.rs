//! Change and change-set value types.
//!
//! A [`Change`] describes one mutation observed on a keyed cache; a
//! [`ChangeSet`] is the ordered batch of changes produced by one atomic
//! mutation (or one expiry tick). Change-sets are the only currency between
//! the store, the operator pipeline, and the transport bridge.
//!
//! All types derive `serde` so the (external) transport layer can encode
//! them; no wire format is mandated here. `ChangeReason` serializes in
//! camelCase.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

// ---------------------------------------------------------------------------
// ChangeReason
// ---------------------------------------------------------------------------

/// Discriminant for change kinds.
///
/// Stored as `#[repr(u8)]` for compact embedding; serialized in camelCase
/// for transport payloads.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeReason {
    /// A new entry was inserted.
    Add = 0,
    /// An existing entry's value was replaced.
    Update = 1,
    /// An entry was removed.
    Remove = 2,
    /// An entry's value mutated in place; the cache cannot diff it, the
    /// change only signals "re-read this key".
    Refresh = 3,
    /// An entry changed position in a sorted projection.
    Move = 4,
}

impl ChangeReason {
    /// Returns `true` if this reason carries a `current` value.
    #[inline]
    #[must_use]
    pub fn has_current(self) -> bool {
        !matches!(self, Self::Remove)
    }

    /// Returns `true` if this reason carries a `previous` value.
    #[inline]
    #[must_use]
    pub fn has_previous(self) -> bool {
        matches!(self, Self::Update | Self::Remove | Self::Move)
    }
}

// ---------------------------------------------------------------------------
// Change
// ---------------------------------------------------------------------------

/// One mutation on a keyed cache.
///
/// `previous` is populated for `Update`, `Remove`, and `Move`; `current` is
/// absent only for `Remove`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change<K, V> {
    /// The kind of change.
    pub reason: ChangeReason,
    /// The key the change applies to.
    pub key: K,
    /// The value after the change, if any.
    pub current: Option<V>,
    /// The value before the change, if any.
    pub previous: Option<V>,
}

impl<K, V> Change<K, V> {
    /// Creates an `Add` change.
    #[must_use]
    pub fn add(key: K, current: V) -> Self {
        Self {
            reason: ChangeReason::Add,
            key,
            current: Some(current),
            previous: None,
        }
    }

    /// Creates an `Update` change carrying the replaced value.
    #[must_use]
    pub fn update(key: K, current: V, previous: V) -> Self {
        Self {
            reason: ChangeReason::Update,
            key,
            current: Some(current),
            previous: Some(previous),
        }
    }

    /// Creates a `Remove` change carrying the removed value.
    #[must_use]
    pub fn remove(key: K, previous: V) -> Self {
        Self {
            reason: ChangeReason::Remove,
            key,
            current: None,
            previous: Some(previous),
        }
    }

    /// Creates a `Refresh` change for an in-place mutated value.
    #[must_use]
    pub fn refresh(key: K, current: V) -> Self {
        Self {
            reason: ChangeReason::Refresh,
            key,
            current: Some(current),
            previous: None,
        }
    }

    /// Creates a `Move` change for a reposition in a sorted projection.
    #[must_use]
    pub fn moved(key: K, current: V, previous: V) -> Self {
        Self {
            reason: ChangeReason::Move,
            key,
            current: Some(current),
            previous: Some(previous),
        }
    }
}

// ---------------------------------------------------------------------------
// ChangeSet
// ---------------------------------------------------------------------------

/// An ordered batch of changes produced by one atomic mutation.
///
/// Backed by a `SmallVec` — most mutations produce a single change, so the
/// common case stays off the heap. An empty change-set carries no
/// information and may be suppressed (see the `not_empty` operator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeSet<K, V> {
    changes: SmallVec<[Change<K, V>; 4]>,
}

impl<K, V> ChangeSet<K, V> {
    /// Creates an empty change-set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            changes: SmallVec::new(),
        }
    }

    /// Creates an empty change-set with room for `capacity` changes.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            changes: SmallVec::with_capacity(capacity),
        }
    }

    /// Creates a change-set holding a single change.
    #[must_use]
    pub fn single(change: Change<K, V>) -> Self {
        let mut changes = SmallVec::new();
        changes.push(change);
        Self { changes }
    }

    /// Appends a change to the batch.
    pub fn push(&mut self, change: Change<K, V>) {
        self.changes.push(change);
    }

    /// Returns the number of changes in this batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Returns `true` if this batch contains no changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Iterates over the changes in batch order.
    pub fn iter(&self) -> std::slice::Iter<'_, Change<K, V>> {
        self.changes.iter()
    }

    /// Returns the number of changes with the given reason.
    #[must_use]
    pub fn count_of(&self, reason: ChangeReason) -> usize {
        self.changes.iter().filter(|c| c.reason == reason).count()
    }

    /// Returns the number of `Add` changes.
    #[must_use]
    pub fn adds(&self) -> usize {
        self.count_of(ChangeReason::Add)
    }

    /// Returns the number of `Update` changes.
    #[must_use]
    pub fn updates(&self) -> usize {
        self.count_of(ChangeReason::Update)
    }

    /// Returns the number of `Remove` changes.
    #[must_use]
    pub fn removes(&self) -> usize {
        self.count_of(ChangeReason::Remove)
    }

    /// Returns the number of `Refresh` changes.
    #[must_use]
    pub fn refreshes(&self) -> usize {
        self.count_of(ChangeReason::Refresh)
    }
}

impl<K, V> Default for ChangeSet<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> FromIterator<Change<K, V>> for ChangeSet<K, V> {
    fn from_iter<I: IntoIterator<Item = Change<K, V>>>(iter: I) -> Self {
        Self {
            changes: iter.into_iter().collect(),
        }
    }
}

impl<K, V> IntoIterator for ChangeSet<K, V> {
    type Item = Change<K, V>;
    type IntoIter = smallvec::IntoIter<[Change<K, V>; 4]>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.into_iter()
    }
}

impl<'a, K, V> IntoIterator for &'a ChangeSet<K, V> {
    type Item = &'a Change<K, V>;
    type IntoIter = std::slice::Iter<'a, Change<K, V>>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

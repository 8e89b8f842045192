//! Composable orderings for sorted snapshots.
//!
//! Sorted projections of a cache need a deterministic total order even when
//! the value comparator reports ties. The combinators here produce entry
//! comparators for [`SourceCache::snapshot_sorted`]: values are compared
//! first and the key breaks ties, so equal-valued entries still sort
//! stably and reproducibly.
//!
//! [`SourceCache::snapshot_sorted`]: crate::cache::SourceCache::snapshot_sorted

use std::cmp::Ordering;

use crate::cache::Entry;

/// Orders entries by key alone.
#[must_use]
pub fn key_ordering<K, V>() -> impl FnMut(&Entry<K, V>, &Entry<K, V>) -> Ordering
where
    K: Ord,
{
    |a, b| a.key().cmp(b.key())
}

/// Orders entries by value first, breaking ties by key.
///
/// The key tiebreak guarantees a total order whenever `K` has distinct
/// keys (which a keyed cache always does), regardless of how coarse the
/// value comparator is.
#[must_use]
pub fn key_value_ordering<K, V, KC, VC>(
    mut key_cmp: KC,
    mut value_cmp: VC,
) -> impl FnMut(&Entry<K, V>, &Entry<K, V>) -> Ordering
where
    KC: FnMut(&K, &K) -> Ordering,
    VC: FnMut(&V, &V) -> Ordering,
{
    move |a, b| {
        value_cmp(a.value(), b.value()).then_with(|| key_cmp(a.key(), b.key()))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

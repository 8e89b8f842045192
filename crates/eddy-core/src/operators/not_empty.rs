//! The `not_empty` operator — suppresses empty change-set batches.
//!
//! A subscriber connected to an empty cache receives an empty catch-up
//! batch; downstream consumers that only care about data can strip it (and
//! any other empty batch) with this adapter. Pass-through is otherwise
//! exact: batches are never reordered, merged, or split.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio_stream::Stream;

use crate::change::ChangeSet;

/// Stream adapter yielding only non-empty change-sets.
///
/// Created by [`ChangeSetStreamExt::not_empty`](super::ChangeSetStreamExt::not_empty).
#[derive(Debug)]
pub struct NotEmpty<S> {
    upstream: S,
}

impl<S> NotEmpty<S> {
    pub(crate) fn new(upstream: S) -> Self {
        Self { upstream }
    }
}

impl<S, K, V> Stream for NotEmpty<S>
where
    S: Stream<Item = ChangeSet<K, V>> + Unpin,
{
    type Item = ChangeSet<K, V>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match Pin::new(&mut this.upstream).poll_next(cx) {
                Poll::Ready(Some(batch)) if batch.is_empty() => {}
                other => return other,
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

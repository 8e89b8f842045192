//! Async change-set subscription — [`ChangeSetStream`].
//!
//! Wraps the per-subscriber channel registered in the cache's fan-out in a
//! `tokio_stream`-compatible async `Stream`, enabling idiomatic consumption
//! with combinators and with the operator pipeline
//! ([`ChangeSetStreamExt`](crate::operators::ChangeSetStreamExt)).
//!
//! The first item is always the catch-up batch synthesized at connect time
//! (one `Add` per entry present then, possibly empty); every later item is a
//! live mutation batch, in order, with no gaps and no duplicates.
//!
//! # Lifecycle
//!
//! Each stream is an explicit state machine:
//! `Connecting → Streaming → Cancelling → Closed`. Cancellation unlinks the
//! subscription from fan-out immediately and the terminal signal is observed
//! at the next poll, exactly once. Dropping the stream cancels it.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::Stream;

use crate::cache::registry::{StreamState, SubscriberRegistry, SubscriptionId, SubscriptionMetrics};
use crate::change::ChangeSet;

// ---------------------------------------------------------------------------
// ChangeSetStream
// ---------------------------------------------------------------------------

/// A live, independently-progressing subscription to a cache.
///
/// Implements `Stream<Item = ChangeSet<K, V>>`. All fields are `Unpin`, so
/// the stream works directly with `tokio::select!` without explicit pinning.
///
/// Dropping the stream cancels the subscription in the cache's fan-out.
pub struct ChangeSetStream<K, V> {
    /// Subscription ID for lifecycle management.
    id: SubscriptionId,
    /// Registry reference for cancel/metrics.
    registry: Arc<SubscriberRegistry<K, V>>,
    /// Inner receiver stream carrying the catch-up batch and live batches.
    inner: UnboundedReceiverStream<ChangeSet<K, V>>,
    /// Current lifecycle state.
    state: StreamState,
}

impl<K, V> ChangeSetStream<K, V> {
    pub(crate) fn new(
        id: SubscriptionId,
        registry: Arc<SubscriberRegistry<K, V>>,
        receiver: tokio::sync::mpsc::UnboundedReceiver<ChangeSet<K, V>>,
    ) -> Self {
        Self {
            id,
            registry,
            inner: UnboundedReceiverStream::new(receiver),
            state: StreamState::Connecting,
        }
    }

    /// Returns the subscription ID.
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Cancels the subscription.
    ///
    /// Unlinks from the cache's fan-out immediately; the stream yields its
    /// terminal `None` on the next poll. Idempotent.
    pub fn cancel(&mut self) {
        match self.state {
            StreamState::Cancelling | StreamState::Closed => {}
            StreamState::Connecting | StreamState::Streaming => {
                self.state = StreamState::Cancelling;
                self.registry.cancel(self.id);
            }
        }
    }

    /// Returns subscription metrics, or `None` once cancelled/closed.
    #[must_use]
    pub fn metrics(&self) -> Option<SubscriptionMetrics> {
        self.registry.metrics(self.id)
    }
}

impl<K, V> Stream for ChangeSetStream<K, V> {
    type Item = ChangeSet<K, V>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        match this.state {
            StreamState::Closed => return Poll::Ready(None),
            StreamState::Cancelling => {
                this.state = StreamState::Closed;
                return Poll::Ready(None);
            }
            StreamState::Connecting | StreamState::Streaming => {}
        }

        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(batch)) => {
                if this.state == StreamState::Connecting {
                    this.state = StreamState::Streaming;
                    this.registry.set_state(this.id, StreamState::Streaming);
                }
                Poll::Ready(Some(batch))
            }
            Poll::Ready(None) => {
                // Cache closed or this subscription was cancelled from the
                // registry side.
                this.state = StreamState::Closed;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<K, V> Drop for ChangeSetStream<K, V> {
    fn drop(&mut self) {
        if !matches!(self.state, StreamState::Closed | StreamState::Cancelling) {
            self.registry.cancel(self.id);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

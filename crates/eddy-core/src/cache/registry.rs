//! Subscriber bookkeeping — fan-out lifecycle management.
//!
//! Manages every live subscription on a [`SourceCache`](super::SourceCache):
//! creation, state transitions, delivery accounting, and cancellation.
//! Delivery uses one unbounded `mpsc` channel per subscriber, so a slow
//! subscriber buffers without blocking the writer or losing batches; the
//! registry unlinks a subscriber the moment its receiver goes away.
//!
//! # Thread Safety
//!
//! All operations take the internal lock; broadcast is already serialized by
//! the cache's state lock (one mutation at a time), so the registry lock is
//! never contended on the delivery path. Create/cancel are rare lifecycle
//! operations with no latency requirements.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use fxhash::FxHashMap;
use tokio::sync::mpsc;

use crate::change::ChangeSet;

// ---------------------------------------------------------------------------
// SubscriptionId
// ---------------------------------------------------------------------------

/// Unique subscription identifier.
///
/// Monotonically assigned by [`SubscriberRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// StreamState
// ---------------------------------------------------------------------------

/// Lifecycle state of a subscription.
///
/// `Connecting → Streaming → Cancelling → Closed`, driven by the
/// subscription's stream; cancellation is a flag observed at the next poll,
/// with the terminal transition taken exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created; the catch-up batch has not been consumed yet.
    Connecting,
    /// Live; forwarding mutation batches.
    Streaming,
    /// Cancel requested; the terminal signal is still pending.
    Cancelling,
    /// Terminated; no further items will be delivered.
    Closed,
}

// ---------------------------------------------------------------------------
// SubscriptionMetrics
// ---------------------------------------------------------------------------

/// Point-in-time metrics snapshot for a subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionMetrics {
    /// Subscription ID.
    pub id: SubscriptionId,
    /// Current state.
    pub state: StreamState,
    /// Total change-set batches delivered into the channel.
    pub batches_delivered: u64,
    /// Total individual changes delivered into the channel.
    pub changes_delivered: u64,
    /// Time since creation.
    pub age: Duration,
}

// ---------------------------------------------------------------------------
// SubscriberEntry
// ---------------------------------------------------------------------------

struct SubscriberEntry<K, V> {
    id: SubscriptionId,
    sender: mpsc::UnboundedSender<ChangeSet<K, V>>,
    state: StreamState,
    created_at: Instant,
    batches_delivered: u64,
    changes_delivered: u64,
}

// ---------------------------------------------------------------------------
// SubscriberRegistry
// ---------------------------------------------------------------------------

/// Registry managing all live subscribers of one cache.
///
/// Thread-safe via an internal [`RwLock`].
///
/// # Panics
///
/// Methods panic if the internal `RwLock` is poisoned (a thread panicked
/// while holding it). This should not occur under normal operation.
pub(crate) struct SubscriberRegistry<K, V> {
    subscribers: RwLock<FxHashMap<SubscriptionId, SubscriberEntry<K, V>>>,
    next_id: AtomicU64,
}

#[allow(clippy::missing_panics_doc)] // Methods panic only on a poisoned RwLock
impl<K, V> SubscriberRegistry<K, V> {
    /// Creates a new empty registry.
    pub(crate) fn new() -> Self {
        Self {
            subscribers: RwLock::new(FxHashMap::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a new subscriber and returns its ID and receiving channel.
    pub(crate) fn create(
        &self,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<ChangeSet<K, V>>) {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();

        let entry = SubscriberEntry {
            id,
            sender: tx,
            state: StreamState::Connecting,
            created_at: Instant::now(),
            batches_delivered: 0,
            changes_delivered: 0,
        };
        self.subscribers.write().unwrap().insert(id, entry);

        (id, rx)
    }

    /// Delivers the catch-up batch to a single, just-created subscriber.
    ///
    /// Called under the cache's state lock so no mutation can interleave
    /// between the snapshot and this delivery.
    pub(crate) fn deliver_initial(&self, id: SubscriptionId, batch: ChangeSet<K, V>) {
        let mut subs = self.subscribers.write().unwrap();
        if let Some(entry) = subs.get_mut(&id) {
            entry.batches_delivered += 1;
            entry.changes_delivered += batch.len() as u64;
            // A freshly created receiver cannot be gone yet; if it is, the
            // subscriber was dropped before connect returned.
            if entry.sender.send(batch).is_err() {
                subs.remove(&id);
            }
        }
    }

    /// Cancels a subscription and removes it from fan-out.
    ///
    /// Returns `true` if the subscription existed and was removed. Removal
    /// drops the entry's sender, which closes the subscriber's channel.
    pub(crate) fn cancel(&self, id: SubscriptionId) -> bool {
        self.subscribers.write().unwrap().remove(&id).is_some()
    }

    /// Records a stream-side state transition.
    pub(crate) fn set_state(&self, id: SubscriptionId, state: StreamState) {
        if let Some(entry) = self.subscribers.write().unwrap().get_mut(&id) {
            entry.state = state;
        }
    }

    /// Returns the current state, or `None` if the subscription is gone.
    pub(crate) fn state(&self, id: SubscriptionId) -> Option<StreamState> {
        self.subscribers.read().unwrap().get(&id).map(|e| e.state)
    }

    /// Returns the number of live subscribers.
    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap().len()
    }

    /// Returns a metrics snapshot for the given subscription.
    pub(crate) fn metrics(&self, id: SubscriptionId) -> Option<SubscriptionMetrics> {
        let subs = self.subscribers.read().unwrap();
        subs.get(&id).map(|entry| SubscriptionMetrics {
            id: entry.id,
            state: entry.state,
            batches_delivered: entry.batches_delivered,
            changes_delivered: entry.changes_delivered,
            age: entry.created_at.elapsed(),
        })
    }

    /// Removes every subscriber, closing all their channels.
    ///
    /// Used by cache teardown; each stream observes end-of-stream on its
    /// next poll.
    pub(crate) fn close_all(&self) {
        self.subscribers.write().unwrap().clear();
    }
}

#[allow(clippy::missing_panics_doc)] // Methods panic only on a poisoned RwLock
impl<K, V> SubscriberRegistry<K, V>
where
    K: Clone,
    V: Clone,
{
    /// Fans a change-set out to every live subscriber.
    ///
    /// Each subscriber receives its own clone. Subscribers whose receiver
    /// has been dropped are unlinked as a side effect.
    pub(crate) fn broadcast(&self, batch: &ChangeSet<K, V>) {
        let mut dead: Vec<SubscriptionId> = Vec::new();
        {
            let mut subs = self.subscribers.write().unwrap();
            for entry in subs.values_mut() {
                if entry.sender.send(batch.clone()).is_ok() {
                    entry.batches_delivered += 1;
                    entry.changes_delivered += batch.len() as u64;
                } else {
                    dead.push(entry.id);
                }
            }
            for id in &dead {
                subs.remove(id);
            }
        }
        if !dead.is_empty() {
            tracing::debug!(count = dead.len(), "unlinked dropped subscribers");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

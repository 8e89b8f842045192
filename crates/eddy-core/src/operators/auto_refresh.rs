//! The `auto_refresh` operator — synthesizes `Refresh` changes from
//! in-place property mutations.
//!
//! For every value flowing through the upstream that exposes a property
//! feed (see [`TrackChanges`]), the adapter subscribes to that feed and
//! merges all feeds with a `StreamMap`. A notification enqueues the key for
//! a synthesized `Refresh` batch; [`AutoRefreshConfig`] controls which
//! properties qualify and how notifications are coalesced in time.
//!
//! Upstream batches pass through unchanged and keep their relative order;
//! only the synthesized refresh batches are new.

use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use fxhash::{FxHashMap, FxHashSet};
use tokio::time::{sleep, Instant, Sleep};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamMap};

use crate::change::{Change, ChangeReason, ChangeSet};
use crate::notify::{PropertyChange, TrackChanges};

// ---------------------------------------------------------------------------
// AutoRefreshConfig
// ---------------------------------------------------------------------------

/// Configuration for the `auto_refresh` operator.
///
/// The default reacts to every property, immediately, with no rate limit.
#[derive(Debug, Clone, Default)]
pub struct AutoRefreshConfig {
    /// Properties that trigger a refresh; `None` means all of them.
    pub properties: Option<FxHashSet<String>>,
    /// Collect notifications for this long and emit them as one batch.
    pub buffer_window: Option<Duration>,
    /// Drop per-key notifications arriving within this window of the key's
    /// previous accepted one.
    pub throttle_window: Option<Duration>,
}

impl AutoRefreshConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reacts only to the named properties.
    #[must_use]
    pub fn properties<I, P>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.properties = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Coalesces notifications over `window` into one refresh batch.
    #[must_use]
    pub fn buffer(mut self, window: Duration) -> Self {
        self.buffer_window = Some(window);
        self
    }

    /// Rate-limits refreshes to one per key per `window`.
    #[must_use]
    pub fn throttle(mut self, window: Duration) -> Self {
        self.throttle_window = Some(window);
        self
    }

    fn accepts(&self, change: &PropertyChange) -> bool {
        self.properties
            .as_ref()
            .is_none_or(|names| names.contains(&change.property))
    }
}

// ---------------------------------------------------------------------------
// AutoRefresh
// ---------------------------------------------------------------------------

/// Stream adapter merging upstream batches with synthesized refreshes.
///
/// Created by [`ChangeSetStreamExt::auto_refresh`](super::ChangeSetStreamExt::auto_refresh).
pub struct AutoRefresh<S, K, V> {
    upstream: S,
    config: AutoRefreshConfig,
    /// Property feeds of the values currently alive upstream.
    watchers: StreamMap<K, BroadcastStream<PropertyChange>>,
    /// Latest known value per key, cloned into synthesized refreshes.
    values: FxHashMap<K, V>,
    /// Keys queued for the next refresh batch, in notification order.
    pending: Vec<K>,
    pending_keys: FxHashSet<K>,
    /// Last accepted notification per key, for throttling.
    last_accepted: FxHashMap<K, Instant>,
    /// Open buffer-window deadline, if a batch is being collected.
    deadline: Option<Pin<Box<Sleep>>>,
    upstream_done: bool,
}

impl<S, K, V> AutoRefresh<S, K, V>
where
    K: Clone + Eq + Hash + Unpin,
    V: Clone + TrackChanges,
{
    pub(crate) fn new(upstream: S, config: AutoRefreshConfig) -> Self {
        Self {
            upstream,
            config,
            watchers: StreamMap::new(),
            values: FxHashMap::default(),
            pending: Vec::new(),
            pending_keys: FxHashSet::default(),
            last_accepted: FxHashMap::default(),
            deadline: None,
            upstream_done: false,
        }
    }

    /// Tracks the keys and values of an upstream batch.
    fn absorb(&mut self, batch: &ChangeSet<K, V>) {
        for change in batch {
            match change.reason {
                ChangeReason::Add | ChangeReason::Update => {
                    let Some(value) = change.current.clone() else {
                        continue;
                    };
                    // A replaced value is a new object; rewire its feed.
                    // An untracked replacement unwires the old one, so a
                    // dead object's feed can no longer refresh the key.
                    if let Some(rx) = value.property_changes() {
                        self.watchers
                            .insert(change.key.clone(), BroadcastStream::new(rx));
                    } else {
                        self.watchers.remove(&change.key);
                    }
                    self.values.insert(change.key.clone(), value);
                }
                ChangeReason::Refresh => {
                    if let Some(value) = change.current.clone() {
                        self.values.insert(change.key.clone(), value);
                    }
                }
                ChangeReason::Remove => {
                    self.values.remove(&change.key);
                    self.watchers.remove(&change.key);
                    self.last_accepted.remove(&change.key);
                }
                ChangeReason::Move => {}
            }
        }
    }

    /// Drains the pending queue into one synthesized refresh batch.
    ///
    /// Values are read at flush time, so a key notified several times in
    /// one window contributes a single refresh with its latest value.
    fn flush(&mut self) -> ChangeSet<K, V> {
        let mut batch = ChangeSet::with_capacity(self.pending.len());
        for key in self.pending.drain(..) {
            // A key removed since it was enqueued no longer exists
            // downstream; skip it.
            if let Some(value) = self.values.get(&key) {
                batch.push(Change::refresh(key, value.clone()));
            }
        }
        self.pending_keys.clear();
        batch
    }

    /// Applies throttle and dedup rules to one accepted notification.
    fn enqueue(&mut self, key: K) {
        if !self.values.contains_key(&key) || self.pending_keys.contains(&key) {
            return;
        }
        if let Some(window) = self.config.throttle_window {
            let now = Instant::now();
            if let Some(last) = self.last_accepted.get(&key) {
                if now.duration_since(*last) < window {
                    return;
                }
            }
            self.last_accepted.insert(key.clone(), now);
        }
        self.pending_keys.insert(key.clone());
        self.pending.push(key);
    }
}

impl<S, K, V> Stream for AutoRefresh<S, K, V>
where
    S: Stream<Item = ChangeSet<K, V>> + Unpin,
    K: Clone + Eq + Hash + Unpin,
    V: Clone + TrackChanges + Unpin,
{
    type Item = ChangeSet<K, V>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        // An open buffer window that has elapsed flushes first, so a
        // collected batch is never starved by a busy upstream.
        if let Some(deadline) = this.deadline.as_mut() {
            if deadline.as_mut().poll(cx).is_ready() {
                this.deadline = None;
                let batch = this.flush();
                if !batch.is_empty() {
                    return Poll::Ready(Some(batch));
                }
            }
        }

        // Upstream batches pass through unchanged.
        if !this.upstream_done {
            match Pin::new(&mut this.upstream).poll_next(cx) {
                Poll::Ready(Some(batch)) => {
                    this.absorb(&batch);
                    return Poll::Ready(Some(batch));
                }
                Poll::Ready(None) => {
                    // No more upstream batches: unwire the feeds so live
                    // notifiers cannot keep the stream open forever.
                    this.upstream_done = true;
                    this.watchers.clear();
                }
                Poll::Pending => {}
            }
        }

        // Drain property notifications into the pending queue.
        loop {
            match Pin::new(&mut this.watchers).poll_next(cx) {
                Poll::Ready(Some((key, Ok(change)))) => {
                    if this.config.accepts(&change) {
                        this.enqueue(key);
                    }
                }
                Poll::Ready(Some((_, Err(BroadcastStreamRecvError::Lagged(missed))))) => {
                    // A lagged feed only means some notifications were
                    // coalesced away; the next one still refreshes the key.
                    tracing::debug!(missed, "property feed lagged");
                }
                // An empty StreamMap reports end-of-stream; feeds may still
                // be added by later upstream batches.
                Poll::Ready(None) | Poll::Pending => break,
            }
        }

        if this.upstream_done {
            // Final flush, then terminate.
            let batch = this.flush();
            return if batch.is_empty() {
                Poll::Ready(None)
            } else {
                Poll::Ready(Some(batch))
            };
        }

        if !this.pending.is_empty() {
            match this.config.buffer_window {
                None => {
                    let batch = this.flush();
                    return Poll::Ready(Some(batch));
                }
                Some(window) => {
                    if this.deadline.is_none() {
                        let mut deadline = Box::pin(sleep(window));
                        // Arm the timer; an already-elapsed zero window
                        // flushes on the spot.
                        if deadline.as_mut().poll(cx).is_ready() {
                            return Poll::Ready(Some(this.flush()));
                        }
                        this.deadline = Some(deadline);
                    }
                }
            }
        }

        Poll::Pending
    }
}

// ===========================================================================
// Tests
// ===========================================================================

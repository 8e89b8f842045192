//! Time-to-live expiry for [`SourceCache`] entries.
//!
//! [`SourceCache::expire_after`] spawns a polling scheduler that removes
//! over-age entries through the normal mutation path, so expiry is
//! indistinguishable from an explicit `remove_many`: one `Remove`-only
//! change-set per tick, fanned out to every subscriber.
//!
//! The scheduler holds only a weak reference to the cache. When the last
//! strong handle drops, the next tick observes the dead reference and the
//! task exits on its own.

use std::hash::Hash;
use std::time::Duration;

use tokio::sync::watch;

use crate::cache::source::{Inner, SourceCache};
use crate::cache::store::Entry;
use crate::serial::{SerialSlot, TaskGuard};

// ---------------------------------------------------------------------------
// ExpiryGuard
// ---------------------------------------------------------------------------

/// Handle to a running expiry scheduler.
///
/// Cancel explicitly with [`cancel`](Self::cancel) or implicitly by
/// dropping the guard; either aborts the polling task.
#[derive(Debug)]
pub struct ExpiryGuard {
    shutdown: watch::Sender<bool>,
    task: SerialSlot<TaskGuard>,
}

impl ExpiryGuard {
    /// Stops the scheduler. Idempotent.
    pub fn cancel(&self) {
        let _ = self.shutdown.send(true);
        self.task.dispose();
    }

    /// Returns `true` once the scheduler has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.task.is_disposed()
    }
}

// ---------------------------------------------------------------------------
// expire_after
// ---------------------------------------------------------------------------

impl<K, V> SourceCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
{
    /// Starts a TTL scheduler that removes over-age entries.
    ///
    /// `ttl_of` is consulted per entry on every tick; returning `None`
    /// exempts the entry from expiry. An entry's age is measured from its
    /// insertion (or last value replacement), so updating a value restarts
    /// its clock. Ticks fire every `poll_interval`; entries can therefore
    /// outlive their TTL by up to one interval.
    ///
    /// The scheduler stops when the guard is cancelled or dropped, when the
    /// cache is closed, or when the last cache handle is dropped.
    pub fn expire_after<F>(&self, ttl_of: F, poll_interval: Duration) -> ExpiryGuard
    where
        F: Fn(&Entry<K, V>) -> Option<Duration> + Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let weak = self.downgrade();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            // The first tick of a tokio interval fires immediately; skip it
            // so entries get at least one full interval of life.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }

                let Some(inner) = weak.upgrade() else {
                    tracing::trace!("cache dropped, expiry scheduler exiting");
                    break;
                };
                if !sweep(&inner, &ttl_of) {
                    break;
                }
            }
        });

        ExpiryGuard {
            shutdown: shutdown_tx,
            task: SerialSlot::holding(TaskGuard::new(handle)),
        }
    }
}

/// Runs one expiry sweep. Returns `false` once the cache is closed.
fn sweep<K, V, F>(inner: &Inner<K, V>, ttl_of: &F) -> bool
where
    K: Clone + Eq + Hash,
    V: Clone + PartialEq,
    F: Fn(&Entry<K, V>) -> Option<Duration>,
{
    let expired: Vec<K> = {
        let state = inner.state.lock().unwrap();
        if state.closed {
            return false;
        }
        state
            .store
            .entries()
            .filter(|entry| ttl_of(entry).is_some_and(|ttl| entry.age() >= ttl))
            .map(|entry| entry.key().clone())
            .collect()
    };

    if !expired.is_empty() {
        tracing::debug!(count = expired.len(), "expiring over-age entries");
        inner.mutate(|store| store.remove_many(expired.iter()));
    }
    true
}

// ===========================================================================
// Tests
// ===========================================================================

//! Property-change notification capability.
//!
//! Values that mutate in place can expose a notification feed through
//! [`TrackChanges`]; the `auto_refresh` operator subscribes to that feed and
//! synthesizes `Refresh` changes when properties fire. The capability is
//! opt-in — the default implementation reports no feed, and such values
//! simply pass through auto-refresh untouched.

use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// PropertyChange
// ---------------------------------------------------------------------------

/// One in-place property mutation, identified by property name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyChange {
    /// Name of the property that changed.
    pub property: String,
}

impl PropertyChange {
    /// Creates a notification for the named property.
    #[must_use]
    pub fn new(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// TrackChanges
// ---------------------------------------------------------------------------

/// Capability trait for values whose in-place mutations can be observed.
///
/// A value that mutates internally (behind `Arc`, interior mutability, or
/// an external synchronization source) implements this to hand the cache
/// pipeline a receiver for its property notifications. Values without the
/// capability keep the default `None` and are ignored by `auto_refresh`.
pub trait TrackChanges {
    /// Returns a fresh receiver for this value's property notifications,
    /// or `None` if the value does not emit any.
    fn property_changes(&self) -> Option<broadcast::Receiver<PropertyChange>> {
        None
    }
}

// ---------------------------------------------------------------------------
// PropertyChangeSource
// ---------------------------------------------------------------------------

/// Shareable notification publisher backing a [`TrackChanges`] value.
///
/// Embed one (typically behind `Arc`) in a mutable value and call
/// [`notify`](Self::notify) after each in-place mutation. Notifications use
/// a broadcast channel; receivers that fall more than `capacity` behind
/// observe a lag and skip, which auto-refresh treats as droppable (a later
/// refresh re-reads the whole value anyway).
#[derive(Debug, Clone)]
pub struct PropertyChangeSource {
    sender: broadcast::Sender<PropertyChange>,
}

impl PropertyChangeSource {
    /// Creates a source buffering up to `capacity` pending notifications
    /// per receiver.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes a notification for the named property.
    ///
    /// A send with no live receivers is a no-op.
    pub fn notify(&self, property: impl Into<String>) {
        let _ = self.sender.send(PropertyChange::new(property));
    }

    /// Returns a fresh receiver for this source's notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PropertyChange> {
        self.sender.subscribe()
    }
}

impl Default for PropertyChangeSource {
    fn default() -> Self {
        Self::new(16)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct Inert;
    impl TrackChanges for Inert {}

    struct Noisy {
        source: PropertyChangeSource,
    }

    impl TrackChanges for Noisy {
        fn property_changes(&self) -> Option<broadcast::Receiver<PropertyChange>> {
            Some(self.source.subscribe())
        }
    }

    #[test]
    fn test_default_capability_is_none() {
        assert!(Inert.property_changes().is_none());
    }

    #[tokio::test]
    async fn test_source_delivers_to_subscriber() {
        let noisy = Noisy {
            source: PropertyChangeSource::new(4),
        };
        let mut rx = noisy.property_changes().unwrap();

        noisy.source.notify("age");
        assert_eq!(rx.recv().await.unwrap(), PropertyChange::new("age"));
    }

    #[test]
    fn test_notify_without_receivers_is_noop() {
        let source = PropertyChangeSource::new(4);
        source.notify("anything");
    }

    #[tokio::test]
    async fn test_lagged_receiver_skips() {
        let source = PropertyChangeSource::new(1);
        let mut rx = source.subscribe();

        source.notify("a");
        source.notify("b");

        // Capacity 1 → the first notification was overwritten.
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        assert_eq!(rx.recv().await.unwrap(), PropertyChange::new("b"));
    }
}

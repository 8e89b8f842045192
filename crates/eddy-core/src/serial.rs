//! Serially-replaceable resource slot — [`SerialSlot`] — and the
//! abort-on-drop task guard — [`TaskGuard`].
//!
//! A `SerialSlot` holds at most one owned resource at a time. Installing a
//! replacement drops the previous occupant exactly once; disposing the slot
//! drops the occupant and causes any later install to drop its argument
//! immediately. This is the primitive behind "swap the active subscription"
//! patterns where at most one background resource may be live.

use std::sync::Mutex;

use tokio::task::JoinHandle;

// ---------------------------------------------------------------------------
// SerialSlot
// ---------------------------------------------------------------------------

enum SlotState<T> {
    Live(Option<T>),
    Disposed,
}

/// A slot holding at most one owned resource, replaceable and disposable.
///
/// Thread-safe. The occupant is dropped outside the internal lock so a
/// `Drop` impl that re-enters the slot cannot deadlock.
pub struct SerialSlot<T> {
    inner: Mutex<SlotState<T>>,
}

#[allow(clippy::missing_panics_doc)] // Methods panic only on a poisoned Mutex
impl<T> SerialSlot<T> {
    /// Creates an empty, live slot.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SlotState::Live(None)),
        }
    }

    /// Creates a live slot already holding `value`.
    #[must_use]
    pub fn holding(value: T) -> Self {
        Self {
            inner: Mutex::new(SlotState::Live(Some(value))),
        }
    }

    /// Installs a replacement occupant, dropping the previous one.
    ///
    /// Returns `true` if the slot accepted the value. On a disposed slot
    /// the argument is dropped immediately and `false` is returned.
    pub fn replace(&self, value: Option<T>) -> bool {
        let previous;
        let accepted;
        {
            let mut state = self.inner.lock().unwrap();
            match &mut *state {
                SlotState::Live(slot) => {
                    previous = std::mem::replace(slot, value);
                    accepted = true;
                }
                SlotState::Disposed => {
                    previous = value;
                    accepted = false;
                }
            }
        }
        drop(previous);
        accepted
    }

    /// Disposes the slot, dropping the current occupant.
    ///
    /// Idempotent; after disposal every `replace` drops its argument.
    pub fn dispose(&self) {
        let occupant;
        {
            let mut state = self.inner.lock().unwrap();
            occupant = match std::mem::replace(&mut *state, SlotState::Disposed) {
                SlotState::Live(slot) => slot,
                SlotState::Disposed => None,
            };
        }
        drop(occupant);
    }

    /// Returns `true` once the slot has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        matches!(&*self.inner.lock().unwrap(), SlotState::Disposed)
    }
}

impl<T> Default for SerialSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for SerialSlot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialSlot")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// TaskGuard
// ---------------------------------------------------------------------------

/// Owns a spawned task and aborts it on drop.
///
/// Pairs with [`SerialSlot`]: a `SerialSlot<TaskGuard>` is a slot whose
/// occupant is a background task, aborted whenever it is replaced or the
/// slot is disposed.
#[derive(Debug)]
pub struct TaskGuard {
    handle: JoinHandle<()>,
}

impl TaskGuard {
    /// Wraps a join handle so the task is aborted when the guard drops.
    #[must_use]
    pub fn new(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }

    /// Returns `true` if the task has already finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_replace_drops_previous_exactly_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let slot = SerialSlot::new();

        assert!(slot.replace(Some(DropCounter(Arc::clone(&drops)))));
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        assert!(slot.replace(Some(DropCounter(Arc::clone(&drops)))));
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        assert!(slot.replace(None));
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let drops = Arc::new(AtomicUsize::new(0));
        let slot = SerialSlot::holding(DropCounter(Arc::clone(&drops)));

        slot.dispose();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(slot.is_disposed());

        slot.dispose();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_replace_after_dispose_drops_argument() {
        let drops = Arc::new(AtomicUsize::new(0));
        let slot = SerialSlot::new();
        slot.dispose();

        assert!(!slot.replace(Some(DropCounter(Arc::clone(&drops)))));
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_empty_slot_replace_none_is_noop() {
        let slot: SerialSlot<String> = SerialSlot::new();
        assert!(slot.replace(None));
        assert!(!slot.is_disposed());
    }

    #[tokio::test]
    async fn test_task_guard_aborts_on_drop() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let guard = TaskGuard::new(tokio::spawn(async move {
            // Runs until aborted; the sender is dropped when the task dies.
            let _tx = tx;
            std::future::pending::<()>().await;
        }));
        assert!(!guard.is_finished());

        drop(guard);
        // Abort propagates: the receiver observes the sender going away.
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_slot_of_guards_aborts_replaced_task() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let slot = SerialSlot::new();
        slot.replace(Some(TaskGuard::new(tokio::spawn(async move {
            let _tx = tx;
            std::future::pending::<()>().await;
        }))));

        slot.replace(None);
        assert!(rx.await.is_err());
    }
}

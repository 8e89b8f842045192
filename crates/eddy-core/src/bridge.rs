//! Transport bridge — pumps a change-set stream into a channel a transport
//! layer can drain.
//!
//! The bridge decouples the cache pipeline from whatever carries batches
//! off-process (a websocket writer, an IPC pipe, a test harness). A spawned
//! pump forwards every batch, in order and without loss, into a bounded or
//! unbounded channel; a [`BridgeHandle`] cancels the pump and a
//! [`BridgeReader`] drains it and reports how the feed ended.
//!
//! Backpressure with a bounded channel is blocking, not lossy: when the
//! reader falls behind, the pump waits (still responsive to cancellation)
//! rather than dropping a batch.

use tokio::sync::{mpsc, watch};
use tokio_stream::{Stream, StreamExt};

use crate::change::ChangeSet;

// ---------------------------------------------------------------------------
// BridgeConfig
// ---------------------------------------------------------------------------

/// Configuration for a transport bridge.
#[derive(Debug, Clone, Default)]
pub struct BridgeConfig {
    /// Channel capacity; `None` (the default) is unbounded.
    pub capacity: Option<usize>,
}

impl BridgeConfig {
    /// Creates the default (unbounded) configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounds the channel at `capacity` batches.
    #[must_use]
    pub fn bounded(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
        }
    }
}

// ---------------------------------------------------------------------------
// BridgeTerminal
// ---------------------------------------------------------------------------

/// How a bridge feed ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeTerminal {
    /// The upstream completed normally.
    Completed,
    /// The bridge was cancelled (handle or reader side).
    Cancelled,
    /// The upstream produced an error, rendered for transport.
    Failed(String),
}

// ---------------------------------------------------------------------------
// BridgeReader
// ---------------------------------------------------------------------------

enum ReaderChannel<K, V> {
    Bounded(mpsc::Receiver<ChangeSet<K, V>>),
    Unbounded(mpsc::UnboundedReceiver<ChangeSet<K, V>>),
}

/// Draining side of a bridge.
///
/// Dropping the reader cancels the pump: a transport that went away has no
/// use for further batches.
pub struct BridgeReader<K, V> {
    channel: ReaderChannel<K, V>,
    terminal: watch::Receiver<Option<BridgeTerminal>>,
}

impl<K, V> BridgeReader<K, V> {
    /// Receives the next batch; `None` once the feed has ended.
    pub async fn recv(&mut self) -> Option<ChangeSet<K, V>> {
        match &mut self.channel {
            ReaderChannel::Bounded(rx) => rx.recv().await,
            ReaderChannel::Unbounded(rx) => rx.recv().await,
        }
    }

    /// Receives without waiting.
    ///
    /// # Errors
    ///
    /// Returns the channel's `TryRecvError` when no batch is ready or the
    /// feed has ended.
    pub fn try_recv(&mut self) -> Result<ChangeSet<K, V>, mpsc::error::TryRecvError> {
        match &mut self.channel {
            ReaderChannel::Bounded(rx) => rx.try_recv(),
            ReaderChannel::Unbounded(rx) => rx.try_recv(),
        }
    }

    /// Returns how the feed ended, or `None` while it is still live.
    ///
    /// Batches already in the channel remain receivable after the terminal
    /// is set; drain until [`recv`](Self::recv) returns `None` for a
    /// complete picture.
    #[must_use]
    pub fn terminal(&self) -> Option<BridgeTerminal> {
        self.terminal.borrow().clone()
    }
}

// ---------------------------------------------------------------------------
// BridgeHandle
// ---------------------------------------------------------------------------

/// Controlling side of a bridge.
///
/// Dropping the handle cancels the pump, as does dropping the reader; a
/// transport that went away has no use for further batches either way.
pub struct BridgeHandle {
    cancel: watch::Sender<bool>,
}

impl BridgeHandle {
    /// Cancels the pump. Idempotent; already-queued batches stay readable.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Returns `true` once the handle has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

// ---------------------------------------------------------------------------
// TransportBridge
// ---------------------------------------------------------------------------

enum SenderChannel<K, V> {
    Bounded(mpsc::Sender<ChangeSet<K, V>>),
    Unbounded(mpsc::UnboundedSender<ChangeSet<K, V>>),
}

/// Factory for bridge pumps.
pub struct TransportBridge;

impl TransportBridge {
    /// Spawns a pump forwarding `upstream` into a fresh channel.
    ///
    /// The upstream is fallible: an `Err` item stops the pump and surfaces
    /// as [`BridgeTerminal::Failed`] with the error rendered via `Display`.
    /// For infallible pipelines use
    /// [`ChangeSetStreamExt::bridge`](crate::operators::ChangeSetStreamExt::bridge).
    pub fn spawn<S, K, V, E>(
        upstream: S,
        config: &BridgeConfig,
    ) -> (BridgeReader<K, V>, BridgeHandle)
    where
        S: Stream<Item = Result<ChangeSet<K, V>, E>> + Send + Unpin + 'static,
        K: Send + 'static,
        V: Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let (sender, channel) = match config.capacity {
            Some(capacity) => {
                let (tx, rx) = mpsc::channel(capacity);
                (SenderChannel::Bounded(tx), ReaderChannel::Bounded(rx))
            }
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (SenderChannel::Unbounded(tx), ReaderChannel::Unbounded(rx))
            }
        };
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (terminal_tx, terminal_rx) = watch::channel(None);

        tokio::spawn(pump(upstream, sender, cancel_rx, terminal_tx));

        (
            BridgeReader {
                channel,
                terminal: terminal_rx,
            },
            BridgeHandle { cancel: cancel_tx },
        )
    }
}

/// Resolves once the bridge has been cancelled (flag set, or the handle
/// dropped without completing).
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

async fn pump<S, K, V, E>(
    mut upstream: S,
    sender: SenderChannel<K, V>,
    mut cancel: watch::Receiver<bool>,
    terminal: watch::Sender<Option<BridgeTerminal>>,
) where
    S: Stream<Item = Result<ChangeSet<K, V>, E>> + Send + Unpin + 'static,
    E: std::fmt::Display,
{
    let outcome = loop {
        let item = tokio::select! {
            biased;
            () = cancelled(&mut cancel) => break BridgeTerminal::Cancelled,
            item = upstream.next() => item,
        };

        match item {
            Some(Ok(batch)) => match &sender {
                SenderChannel::Unbounded(tx) => {
                    if tx.send(batch).is_err() {
                        break BridgeTerminal::Cancelled;
                    }
                }
                SenderChannel::Bounded(tx) => {
                    // Backpressure: wait for the reader, but stay
                    // cancellable while waiting. Reserving first means a
                    // cancellation never loses the batch mid-send.
                    let permit = tokio::select! {
                        biased;
                        () = cancelled(&mut cancel) => break BridgeTerminal::Cancelled,
                        permit = tx.reserve() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break BridgeTerminal::Cancelled,
                        },
                    };
                    permit.send(batch);
                }
            },
            Some(Err(error)) => {
                let rendered = error.to_string();
                tracing::warn!(error = %rendered, "bridge upstream failed");
                break BridgeTerminal::Failed(rendered);
            }
            None => break BridgeTerminal::Completed,
        }
    };

    tracing::debug!(?outcome, "bridge pump ended");
    let _ = terminal.send(Some(outcome));
}

// ===========================================================================
// Tests
// ===========================================================================

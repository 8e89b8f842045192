//! Composable change-set stream operators.
//!
//! Operators attach to any `Stream<Item = ChangeSet<K, V>>` through the
//! [`ChangeSetStreamExt`] extension trait, so a pipeline reads left to
//! right from the cache connection to the transport:
//!
//! ```ignore
//! let (reader, handle) = cache
//!     .connect()?
//!     .not_empty()
//!     .auto_refresh(AutoRefreshConfig::new())
//!     .bridge(&BridgeConfig::new());
//! ```

use std::convert::Infallible;
use std::hash::Hash;

use tokio_stream::{Stream, StreamExt};

use crate::bridge::{BridgeConfig, BridgeHandle, BridgeReader, TransportBridge};
use crate::change::ChangeSet;
use crate::notify::TrackChanges;

mod auto_refresh;
mod not_empty;
mod tree;

pub use auto_refresh::{AutoRefresh, AutoRefreshConfig};
pub use not_empty::NotEmpty;
pub use tree::{transform_to_tree, TreeCache, TreeKey, TreeNode};

/// Operator entry points for change-set streams.
///
/// Blanket-implemented for every `Stream<Item = ChangeSet<K, V>>`.
pub trait ChangeSetStreamExt<K, V>: Stream<Item = ChangeSet<K, V>> + Sized {
    /// Suppresses empty batches (notably the empty catch-up batch a
    /// subscriber receives from an empty cache).
    fn not_empty(self) -> NotEmpty<Self>
    where
        Self: Unpin,
    {
        NotEmpty::new(self)
    }

    /// Synthesizes `Refresh` changes from in-place property mutations of
    /// values implementing [`TrackChanges`].
    fn auto_refresh(self, config: AutoRefreshConfig) -> AutoRefresh<Self, K, V>
    where
        Self: Unpin,
        K: Clone + Eq + Hash + Unpin,
        V: Clone + TrackChanges + Unpin,
    {
        AutoRefresh::new(self, config)
    }

    /// Projects the flat stream into a self-maintaining hierarchy keyed by
    /// the `parent_of` pivot.
    fn transform_to_tree<F>(self, parent_of: F) -> TreeCache<K, V>
    where
        Self: Send + Unpin + 'static,
        K: Clone + Eq + Hash + Send + Sync + 'static,
        V: Clone + PartialEq + Send + Sync + 'static,
        F: Fn(&V) -> TreeKey<K> + Send + 'static,
    {
        transform_to_tree(self, parent_of)
    }

    /// Pumps the stream into a transport channel.
    ///
    /// Infallible counterpart of [`TransportBridge::spawn`].
    fn bridge(self, config: &BridgeConfig) -> (BridgeReader<K, V>, BridgeHandle)
    where
        Self: Send + Unpin + 'static,
        K: Send + 'static,
        V: Send + 'static,
    {
        TransportBridge::spawn(self.map(Ok::<_, Infallible>), config)
    }
}

impl<S, K, V> ChangeSetStreamExt<K, V> for S where S: Stream<Item = ChangeSet<K, V>> {}

//! # Eddy Core
//!
//! A reactive, keyed, in-memory cache engine. A [`SourceCache`] holds a
//! mutable keyed collection, computes minimal deltas whenever it is mutated,
//! and pushes those deltas as [`ChangeSet`] batches to any number of
//! independently-progressing subscribers.
//!
//! This crate provides:
//! - **Keyed store**: [`SourceCache`] with diff emission on every mutation
//! - **Subscriptions**: [`ChangeSetStream`] with a catch-up batch on connect
//! - **Operators**: composable change-set transforms (`not_empty`,
//!   `auto_refresh`, `transform_to_tree`) via [`ChangeSetStreamExt`]
//! - **Expiry**: per-entry TTL eviction on a shared polling interval
//! - **Transport bridge**: backpressured FIFO hand-off for a transport layer
//!
//! ## Design Principles
//!
//! 1. **Atomic batches** — one mutation produces one `ChangeSet`, committed
//!    to the store before any subscriber observes it, never interleaved
//! 2. **Lossless fan-out** — a slow subscriber buffers; it never blocks or
//!    corrupts delivery to faster subscribers
//! 3. **Explicit lifecycles** — caches, subscriptions, and pipeline stages
//!    are handles with deterministic teardown; no process-wide singletons
//!
//! ## Example
//!
//! ```rust,ignore
//! use eddy_core::{SourceCache, ChangeSetStreamExt};
//!
//! let cache = SourceCache::new();
//! let mut stream = cache.connect()?.not_empty();
//!
//! cache.add_or_update("p1", person);
//! while let Some(batch) = stream.next().await {
//!     apply(batch);
//! }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bridge;
pub mod cache;
pub mod change;
pub mod comparer;
pub mod notify;
pub mod operators;
pub mod serial;

// Re-export key types
pub use bridge::{BridgeConfig, BridgeHandle, BridgeReader, BridgeTerminal, TransportBridge};
pub use cache::{
    CacheClosed, ChangeSetStream, Entry, ExpiryGuard, SourceCache, StreamState, SubscriptionId,
    SubscriptionMetrics,
};
pub use change::{Change, ChangeReason, ChangeSet};
pub use notify::{PropertyChange, PropertyChangeSource, TrackChanges};
pub use operators::{
    AutoRefreshConfig, ChangeSetStreamExt, TreeCache, TreeKey, TreeNode,
};
pub use serial::{SerialSlot, TaskGuard};

/// Result type for eddy-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for eddy-core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The source cache has been closed.
    #[error(transparent)]
    Cache(#[from] cache::CacheClosed),
}

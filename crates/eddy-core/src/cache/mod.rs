//! Keyed reactive cache: store, fan-out, subscriptions, and expiry.
//!
//! The cache layer is built from these pieces:
//!
//! - [`store`] — the synchronous diffing map ([`KeyedCache`]) that turns
//!   mutations into [`ChangeSet`](crate::change::ChangeSet) batches
//! - [`registry`] — per-subscriber channels and delivery accounting
//! - [`source`] — the shared handle ([`SourceCache`]) gluing store and
//!   registry together under one lock
//! - [`stream`] — the async subscription ([`ChangeSetStream`]) with its
//!   explicit lifecycle state machine
//! - [`expire`] — the TTL scheduler that removes over-age entries through
//!   the normal mutation path
//!
//! Most callers only touch [`SourceCache`] and [`ChangeSetStream`].

pub(crate) mod registry;
pub(crate) mod source;
pub(crate) mod store;
pub(crate) mod stream;

mod expire;

pub use expire::ExpiryGuard;
pub use registry::{StreamState, SubscriptionId, SubscriptionMetrics};
pub use source::{CacheClosed, SourceCache};
pub use store::{Entry, KeyedCache};
pub use stream::ChangeSetStream;

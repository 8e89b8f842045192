//! The `transform_to_tree` operator — projects a flat keyed stream into a
//! self-maintaining hierarchy.
//!
//! Each value designates its parent through a pivot function returning a
//! [`TreeKey`]. The projection materializes as a cache of root
//! [`TreeNode`]s, where every node owns a nested cache of its children;
//! connecting to any node's children observes that subtree level reactively,
//! with the same catch-up-then-live contract as any cache.
//!
//! # Orphans
//!
//! A node whose parent has not arrived yet (or was removed) surfaces at the
//! root level and is re-adopted the moment its parent shows up. Moving a
//! node moves its whole subtree with it, because children buckets are
//! shared handles keyed by the node's own key.

use std::hash::Hash;

use fxhash::{FxHashMap, FxHashSet};
use tokio_stream::{Stream, StreamExt};

use crate::cache::SourceCache;
use crate::change::{Change, ChangeReason, ChangeSet};
use crate::serial::{SerialSlot, TaskGuard};

// ---------------------------------------------------------------------------
// TreeKey
// ---------------------------------------------------------------------------

/// Parent designation for a tree node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TreeKey<K> {
    /// The node sits at the top level.
    Root,
    /// The node is a child of the entry with this key.
    Key(K),
}

// ---------------------------------------------------------------------------
// TreeNode
// ---------------------------------------------------------------------------

/// One node of the projected hierarchy.
///
/// Equality ignores `children`: two nodes are equal when key, value, and
/// parent agree, so replacing a node with a structurally identical one does
/// not churn subscribers.
pub struct TreeNode<K, V> {
    key: K,
    value: V,
    parent: TreeKey<K>,
    children: SourceCache<K, TreeNode<K, V>>,
}

impl<K, V> TreeNode<K, V> {
    /// Returns the node's key.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Returns the node's value.
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Returns the node's parent designation.
    pub fn parent(&self) -> &TreeKey<K> {
        &self.parent
    }

    /// Returns the reactive cache of this node's children.
    ///
    /// The handle is shared with the projection: connect to it to observe
    /// this subtree level live.
    pub fn children(&self) -> &SourceCache<K, TreeNode<K, V>> {
        &self.children
    }
}

impl<K: Clone, V: Clone> Clone for TreeNode<K, V> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            value: self.value.clone(),
            parent: self.parent.clone(),
            children: self.children.clone(),
        }
    }
}

impl<K: PartialEq, V: PartialEq> PartialEq for TreeNode<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.value == other.value && self.parent == other.parent
    }
}

impl<K: std::fmt::Debug, V: std::fmt::Debug> std::fmt::Debug for TreeNode<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeNode")
            .field("key", &self.key)
            .field("value", &self.value)
            .field("parent", &self.parent)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// TreeCache
// ---------------------------------------------------------------------------

/// Handle to a running tree projection.
///
/// Dropping the handle (or calling [`cancel`](Self::cancel)) stops the
/// builder task; the materialized tree remains queryable afterwards but no
/// longer follows the upstream.
pub struct TreeCache<K, V> {
    roots: SourceCache<K, TreeNode<K, V>>,
    guard: SerialSlot<TaskGuard>,
}

impl<K, V> TreeCache<K, V> {
    /// Returns the reactive cache of root nodes.
    pub fn roots(&self) -> &SourceCache<K, TreeNode<K, V>> {
        &self.roots
    }

    /// Stops following the upstream. Idempotent.
    pub fn cancel(&self) {
        self.guard.dispose();
    }

    /// Returns `true` once the projection has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.guard.is_disposed()
    }
}

// ---------------------------------------------------------------------------
// transform_to_tree
// ---------------------------------------------------------------------------

/// Spawns a tree projection over `upstream`.
///
/// `parent_of` is the pivot: it reads a value and names its parent. It is
/// re-evaluated on every `Add`, `Update`, and `Refresh`, so reparenting is
/// just an upstream mutation.
pub fn transform_to_tree<S, K, V, F>(upstream: S, parent_of: F) -> TreeCache<K, V>
where
    S: Stream<Item = ChangeSet<K, V>> + Send + Unpin + 'static,
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
    F: Fn(&V) -> TreeKey<K> + Send + 'static,
{
    let roots: SourceCache<K, TreeNode<K, V>> = SourceCache::new();
    let task_roots = roots.clone();

    let handle = tokio::spawn(async move {
        let mut upstream = upstream;
        let mut builder = TreeBuilder::new(task_roots, parent_of);
        while let Some(batch) = upstream.next().await {
            for change in batch {
                builder.apply(change);
            }
        }
        tracing::trace!("tree projection upstream ended");
    });

    TreeCache {
        roots,
        guard: SerialSlot::holding(TaskGuard::new(handle)),
    }
}

// ---------------------------------------------------------------------------
// TreeBuilder
// ---------------------------------------------------------------------------

struct NodeSlot<K, V> {
    value: V,
    /// Parent the value designates.
    parent: TreeKey<K>,
    /// Bucket the node actually sits in; `Root` for orphans whose parent
    /// is absent.
    placed_under: TreeKey<K>,
}

struct TreeBuilder<K, V, F> {
    parent_of: F,
    roots: SourceCache<K, TreeNode<K, V>>,
    slots: FxHashMap<K, NodeSlot<K, V>>,
    /// Children bucket per key, created lazily and kept for the key's
    /// lifetime so every clone of a node shares the same subtree.
    children: FxHashMap<K, SourceCache<K, TreeNode<K, V>>>,
    /// Orphans waiting for a parent key to arrive.
    waiting: FxHashMap<K, FxHashSet<K>>,
}

impl<K, V, F> TreeBuilder<K, V, F>
where
    K: Clone + Eq + Hash,
    V: Clone + PartialEq,
    F: Fn(&V) -> TreeKey<K>,
{
    fn new(roots: SourceCache<K, TreeNode<K, V>>, parent_of: F) -> Self {
        Self {
            parent_of,
            roots,
            slots: FxHashMap::default(),
            children: FxHashMap::default(),
            waiting: FxHashMap::default(),
        }
    }

    fn apply(&mut self, change: Change<K, V>) {
        match change.reason {
            ChangeReason::Add => {
                if let Some(value) = change.current {
                    self.add(change.key, value);
                }
            }
            ChangeReason::Update => {
                if let Some(value) = change.current {
                    let parent = (self.parent_of)(&value);
                    self.relocate(&change.key, value, parent);
                }
            }
            ChangeReason::Refresh => {
                if let Some(value) = change.current {
                    self.refresh(&change.key, value);
                }
            }
            ChangeReason::Remove => self.remove(&change.key),
            ChangeReason::Move => {}
        }
    }

    fn add(&mut self, key: K, value: V) {
        let parent = (self.parent_of)(&value);
        let placed = self.placement_for(&key, &parent);
        if self.should_wait(&key, &parent) {
            if let TreeKey::Key(p) = &parent {
                self.waiting
                    .entry(p.clone())
                    .or_default()
                    .insert(key.clone());
            }
        }
        self.slots.insert(
            key.clone(),
            NodeSlot {
                value,
                parent,
                placed_under: placed.clone(),
            },
        );

        let node = self.make_node(&key);
        self.bucket(&placed).add_or_update(key.clone(), node);
        self.adopt_waiters(&key);
    }

    /// Re-evaluates value and placement for an existing node.
    fn relocate(&mut self, key: &K, value: V, new_parent: TreeKey<K>) {
        let Some(slot) = self.slots.get(key) else {
            return;
        };
        let old_parent = slot.parent.clone();
        let old_place = slot.placed_under.clone();
        let new_place = self.placement_for(key, &new_parent);

        self.stop_waiting(&old_parent, key);
        if self.should_wait(key, &new_parent) {
            if let TreeKey::Key(p) = &new_parent {
                self.waiting.entry(p.clone()).or_default().insert(key.clone());
            }
        }

        if let Some(slot) = self.slots.get_mut(key) {
            slot.value = value;
            slot.parent = new_parent;
            slot.placed_under = new_place.clone();
        }

        let node = self.make_node(key);
        if old_place == new_place {
            self.bucket(&new_place).add_or_update(key.clone(), node);
        } else {
            // The subtree travels with the node; children buckets are
            // keyed by the node itself, not by its position.
            self.bucket(&old_place).remove(key);
            self.bucket(&new_place).add_or_update(key.clone(), node);
        }
    }

    fn refresh(&mut self, key: &K, value: V) {
        let Some(slot) = self.slots.get(key) else {
            return;
        };
        let new_parent = (self.parent_of)(&value);
        if new_parent == slot.parent {
            // In-place mutation without a reparent: forward the refresh
            // signal through the containing bucket.
            let place = slot.placed_under.clone();
            if let Some(slot) = self.slots.get_mut(key) {
                slot.value = value;
            }
            self.bucket(&place).refresh(key);
        } else {
            self.relocate(key, value, new_parent);
        }
    }

    fn remove(&mut self, key: &K) {
        let Some(slot) = self.slots.remove(key) else {
            return;
        };
        self.stop_waiting(&slot.parent, key);
        self.bucket(&slot.placed_under).remove(key);

        // Children lose their parent: resurface them at the roots and
        // queue them for re-adoption should the key come back.
        if let Some(bucket) = self.children.get(key).cloned() {
            for child in bucket.keys() {
                bucket.remove(&child);
                if let Some(child_slot) = self.slots.get_mut(&child) {
                    child_slot.placed_under = TreeKey::Root;
                }
                self.waiting
                    .entry(key.clone())
                    .or_default()
                    .insert(child.clone());
                let node = self.make_node(&child);
                self.roots.add_or_update(child, node);
            }
        }
    }

    /// Moves every orphan waiting on `key` under it.
    fn adopt_waiters(&mut self, key: &K) {
        let Some(waiters) = self.waiting.remove(key) else {
            return;
        };
        let place = TreeKey::Key(key.clone());
        for waiter in waiters {
            if &waiter == key {
                continue;
            }
            let Some(slot) = self.slots.get(&waiter) else {
                continue;
            };
            if slot.parent != place {
                continue;
            }
            // Re-check placement: adopting must not close a cycle either.
            if self.placement_for(&waiter, &place) != place {
                continue;
            }
            if let Some(slot) = self.slots.get_mut(&waiter) {
                slot.placed_under = place.clone();
            }
            self.roots.remove(&waiter);
            let node = self.make_node(&waiter);
            self.bucket(&place).add_or_update(waiter, node);
        }
    }

    /// Where a node with this parent designation actually goes right now.
    ///
    /// A parent that is absent, is the node itself, or sits anywhere below
    /// the node resolves to the root level: placing a node inside its own
    /// subtree would detach that subtree from every connectable level and
    /// leave the children cache owning a handle to itself.
    fn placement_for(&self, key: &K, parent: &TreeKey<K>) -> TreeKey<K> {
        let TreeKey::Key(parent_key) = parent else {
            return TreeKey::Root;
        };
        if parent_key == key || !self.slots.contains_key(parent_key) {
            return TreeKey::Root;
        }
        // Walk the prospective ancestor chain; finding `key` on it means
        // the placement would close a cycle. Placements are acyclic by
        // this very check, so the walk terminates.
        let mut cursor = parent_key;
        while let Some(TreeKey::Key(next)) =
            self.slots.get(cursor).map(|slot| &slot.placed_under)
        {
            if next == key {
                return TreeKey::Root;
            }
            cursor = next;
        }
        parent.clone()
    }

    /// Whether this parent designation should queue the node for adoption.
    ///
    /// Only a genuinely absent parent can still arrive; a present one
    /// (including the node itself) never fires an adoption later.
    fn should_wait(&self, key: &K, parent: &TreeKey<K>) -> bool {
        matches!(parent, TreeKey::Key(p) if p != key && !self.slots.contains_key(p))
    }

    fn bucket(&mut self, place: &TreeKey<K>) -> SourceCache<K, TreeNode<K, V>> {
        match place {
            TreeKey::Root => self.roots.clone(),
            TreeKey::Key(k) => self.children.entry(k.clone()).or_default().clone(),
        }
    }

    fn make_node(&mut self, key: &K) -> TreeNode<K, V> {
        let children = self.children.entry(key.clone()).or_default().clone();
        let slot = &self.slots[key];
        TreeNode {
            key: key.clone(),
            value: slot.value.clone(),
            parent: slot.parent.clone(),
            children,
        }
    }

    fn stop_waiting(&mut self, parent: &TreeKey<K>, key: &K) {
        if let TreeKey::Key(p) = parent {
            if let Some(set) = self.waiting.get_mut(p) {
                set.remove(key);
                if set.is_empty() {
                    self.waiting.remove(p);
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    use crate::operators::ChangeSetStreamExt;

    #[derive(Debug, Clone, PartialEq)]
    struct Person {
        name: &'static str,
        parent: Option<&'static str>,
    }

    fn person(name: &'static str, parent: Option<&'static str>) -> Person {
        Person { name, parent }
    }

    fn pivot(p: &Person) -> TreeKey<&'static str> {
        match p.parent {
            Some(parent) => TreeKey::Key(parent),
            None => TreeKey::Root,
        }
    }

    #[tokio::test]
    async fn test_child_lands_under_parent() {
        let cache = SourceCache::new();
        let tree = cache.connect().unwrap().transform_to_tree(pivot);
        let mut roots = tree.roots().connect().unwrap();
        roots.next().await.unwrap(); // empty catch-up

        cache.add_or_update("p1", person("alice", None));
        let batch = roots.next().await.unwrap();
        assert_eq!(batch.adds(), 1);

        let p1 = tree.roots().lookup(&"p1").unwrap();
        assert_eq!(p1.parent(), &TreeKey::Root);
        let mut p1_children = p1.children().connect().unwrap();
        p1_children.next().await.unwrap(); // empty catch-up

        cache.add_or_update("p2", person("bob", Some("p1")));
        let batch = p1_children.next().await.unwrap();
        assert_eq!(batch.adds(), 1);

        let p2 = p1.children().lookup(&"p2").unwrap();
        assert_eq!(p2.value().name, "bob");
        assert_eq!(p2.parent(), &TreeKey::Key("p1"));
        assert_eq!(tree.roots().len(), 1);
    }

    #[tokio::test]
    async fn test_reparent_to_root_moves_subtree_entry() {
        let cache = SourceCache::new();
        let tree = cache.connect().unwrap().transform_to_tree(pivot);
        let mut roots = tree.roots().connect().unwrap();
        roots.next().await.unwrap();

        cache.add_or_update("p1", person("alice", None));
        roots.next().await.unwrap();
        let p1 = tree.roots().lookup(&"p1").unwrap();
        let mut p1_children = p1.children().connect().unwrap();
        p1_children.next().await.unwrap();

        cache.add_or_update("p2", person("bob", Some("p1")));
        p1_children.next().await.unwrap();

        // Reparent p2 to the top level: removed from p1's children, added
        // at the roots.
        cache.add_or_update("p2", person("bob", None));
        let removed = p1_children.next().await.unwrap();
        assert_eq!(removed.removes(), 1);
        let added = roots.next().await.unwrap();
        assert_eq!(added.adds(), 1);
        assert!(tree.roots().contains_key(&"p2"));
        assert!(p1.children().is_empty());
    }

    #[tokio::test]
    async fn test_orphan_surfaces_then_gets_adopted() {
        let cache = SourceCache::new();
        let tree = cache.connect().unwrap().transform_to_tree(pivot);
        let mut roots = tree.roots().connect().unwrap();
        roots.next().await.unwrap();

        // Child arrives before its parent: visible at the roots.
        cache.add_or_update("p2", person("bob", Some("p1")));
        let batch = roots.next().await.unwrap();
        assert_eq!(batch.adds(), 1);
        assert!(tree.roots().contains_key(&"p2"));

        // Parent arrives: p1 added at roots, p2 re-homed under it.
        cache.add_or_update("p1", person("alice", None));
        let batch = roots.next().await.unwrap();
        assert_eq!(batch.adds(), 1); // p1
        let batch = roots.next().await.unwrap();
        assert_eq!(batch.removes(), 1); // p2 leaves the top level

        let p1 = tree.roots().lookup(&"p1").unwrap();
        assert!(p1.children().contains_key(&"p2"));
    }

    #[tokio::test]
    async fn test_removing_parent_orphans_children() {
        let cache = SourceCache::new();
        let tree = cache.connect().unwrap().transform_to_tree(pivot);
        let mut roots = tree.roots().connect().unwrap();
        roots.next().await.unwrap();

        cache.add_or_update("p1", person("alice", None));
        cache.add_or_update("p2", person("bob", Some("p1")));
        roots.next().await.unwrap();

        cache.remove(&"p1");
        let batch = roots.next().await.unwrap();
        assert_eq!(batch.removes(), 1); // p1 gone
        let batch = roots.next().await.unwrap();
        assert_eq!(batch.adds(), 1); // p2 resurfaces

        let p2 = tree.roots().lookup(&"p2").unwrap();
        assert_eq!(p2.parent(), &TreeKey::Key("p1"));

        // Parent returns: the orphan is adopted back.
        cache.add_or_update("p1", person("alice", None));
        roots.next().await.unwrap(); // p1 added
        roots.next().await.unwrap(); // p2 leaves
        let p1 = tree.roots().lookup(&"p1").unwrap();
        assert!(p1.children().contains_key(&"p2"));
    }

    #[tokio::test]
    async fn test_refresh_without_reparent_forwards_refresh() {
        let cache = SourceCache::new();
        let tree = cache.connect().unwrap().transform_to_tree(pivot);
        let mut roots = tree.roots().connect().unwrap();
        roots.next().await.unwrap();

        cache.add_or_update("p1", person("alice", None));
        roots.next().await.unwrap();

        cache.refresh(&"p1");
        let batch = roots.next().await.unwrap();
        assert_eq!(batch.refreshes(), 1);
    }

    #[tokio::test]
    async fn test_cancel_freezes_projection() {
        let cache = SourceCache::new();
        let tree = cache.connect().unwrap().transform_to_tree(pivot);
        let mut roots = tree.roots().connect().unwrap();
        roots.next().await.unwrap();

        cache.add_or_update("p1", person("alice", None));
        roots.next().await.unwrap();

        tree.cancel();
        assert!(tree.is_cancelled());
        tree.cancel(); // idempotent

        cache.add_or_update("p2", person("bob", None));
        tokio::task::yield_now().await;
        assert_eq!(tree.roots().len(), 1);
    }

    #[tokio::test]
    async fn test_self_parent_add_lands_at_roots() {
        let cache = SourceCache::new();
        let tree = cache.connect().unwrap().transform_to_tree(pivot);
        let mut roots = tree.roots().connect().unwrap();
        roots.next().await.unwrap();

        // A value naming its own key as parent stays at the top level
        // instead of disappearing into its own children bucket.
        cache.add_or_update("loop", person("ouro", Some("loop")));
        let batch = roots.next().await.unwrap();
        assert_eq!(batch.adds(), 1);

        cache.add_or_update("other", person("bob", None));
        let batch = roots.next().await.unwrap();
        assert_eq!(batch.adds(), 1);

        let node = tree.roots().lookup(&"loop").unwrap();
        assert!(node.children().is_empty());
        assert_eq!(tree.roots().len(), 2);
    }

    #[tokio::test]
    async fn test_self_parent_update_stays_visible() {
        let cache = SourceCache::new();
        let tree = cache.connect().unwrap().transform_to_tree(pivot);
        let mut roots = tree.roots().connect().unwrap();
        roots.next().await.unwrap();

        cache.add_or_update("p1", person("alice", None));
        roots.next().await.unwrap();

        // Reparenting a node onto itself must not bury it inside its own
        // children bucket; it stays put and the parent field updates.
        cache.add_or_update("p1", person("alice", Some("p1")));
        let batch = roots.next().await.unwrap();
        assert_eq!(batch.updates(), 1);

        let node = tree.roots().lookup(&"p1").unwrap();
        assert_eq!(node.parent(), &TreeKey::Key("p1"));
        assert!(node.children().is_empty());
        assert_eq!(tree.roots().len(), 1);
    }

    #[tokio::test]
    async fn test_mutual_parents_keep_the_forest_connected() {
        let cache = SourceCache::new();
        let tree = cache.connect().unwrap().transform_to_tree(pivot);
        let mut roots = tree.roots().connect().unwrap();
        roots.next().await.unwrap();

        cache.add_or_update("a", person("alice", None));
        roots.next().await.unwrap();
        cache.add_or_update("b", person("bob", None));
        roots.next().await.unwrap();

        // a under b: fine, b is live at the roots.
        cache.add_or_update("a", person("alice", Some("b")));
        let batch = roots.next().await.unwrap();
        assert_eq!(batch.removes(), 1);

        // b under a would close the cycle and detach both nodes from
        // every connectable level; b stays at the roots instead.
        cache.add_or_update("b", person("bob", Some("a")));
        let batch = roots.next().await.unwrap();
        assert_eq!(batch.updates(), 1);

        assert!(tree.roots().contains_key(&"b"));
        assert_eq!(tree.roots().len(), 1);
        let b = tree.roots().lookup(&"b").unwrap();
        assert!(b.children().contains_key(&"a"));
    }

    #[tokio::test]
    async fn test_node_equality_ignores_children() {
        let cache = SourceCache::new();
        let tree = cache.connect().unwrap().transform_to_tree(pivot);
        let mut roots = tree.roots().connect().unwrap();
        roots.next().await.unwrap();

        cache.add_or_update("p1", person("alice", None));
        roots.next().await.unwrap();

        let a = tree.roots().lookup(&"p1").unwrap();
        let b = a.clone();
        assert_eq!(a, b);
    }
}

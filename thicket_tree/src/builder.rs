// Copyright 2025 the Thicket Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Bulk construction of balanced trees.

use alloc::vec::Vec;
use kurbo::Rect;

use crate::error::Error;
use crate::partition::{PartitionPolicy, PartitionScheme};
use crate::tree::Tree;
use crate::types::{EntityFlags, EntityKey, NodeId};
use crate::util::is_valid_bounds;

/// Bulk-constructs a tree from a batch of entities.
///
/// Incremental insertion places cuts from whatever entity happens to force a
/// split, which skews the tree when input arrives in spatial order. The
/// builder sees the whole batch: each branch picks its cut from the union of
/// the entities it distributes, retrying alternate cuts before parking an
/// inseparable group, so the result does not depend on input order for its
/// shape. Returned keys are in input order.
///
/// ```rust
/// use kurbo::Rect;
/// use thicket_tree::{EntityFlags, PartitionScheme, TreeBuilder};
///
/// let mut builder = TreeBuilder::new(PartitionScheme::IcosepQuad).with_split_count(2);
/// builder.insert("a", Rect::new(0.0, 0.0, 1.0, 1.0), EntityFlags::empty())?;
/// builder.insert("b", Rect::new(5.0, 5.0, 6.0, 6.0), EntityFlags::empty())?;
/// let (tree, keys) = builder.build();
/// assert_eq!(tree.len(), 2);
/// assert_eq!(tree.get(keys[0]), Some(&"a"));
/// # Ok::<(), thicket_tree::Error>(())
/// ```
pub struct TreeBuilder<P> {
    scheme: PartitionScheme,
    policy: PartitionPolicy,
    split_count: usize,
    world: Option<Rect>,
    items: Vec<(Rect, EntityFlags, P)>,
}

impl<P> core::fmt::Debug for TreeBuilder<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TreeBuilder")
            .field("scheme", &self.scheme)
            .field("policy", &self.policy)
            .field("split_count", &self.split_count)
            .field("world", &self.world)
            .field("items", &self.items.len())
            .finish()
    }
}

impl<P> TreeBuilder<P> {
    /// Create a builder with the default cut policy and a splitting count
    /// of 4.
    pub fn new(scheme: PartitionScheme) -> Self {
        Self {
            scheme,
            policy: PartitionPolicy::default(),
            split_count: 4,
            world: None,
            items: Vec::new(),
        }
    }

    /// Set the cut-placement policy.
    pub fn with_policy(mut self, policy: PartitionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the number of entities a node holds before subdividing
    /// (clamped to at least 1).
    pub fn with_split_count(mut self, split_count: usize) -> Self {
        self.split_count = split_count.max(1);
        self
    }

    /// Anchor the root region to known world bounds instead of the union of
    /// the batch.
    pub fn with_world(mut self, world: Rect) -> Self {
        self.world = Some(world);
        self
    }

    /// Queue an entity for the build.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidBounds`] for non-finite or inverted bounds.
    pub fn insert(&mut self, payload: P, bounds: Rect, flags: EntityFlags) -> Result<(), Error> {
        if !is_valid_bounds(bounds) {
            return Err(Error::InvalidBounds);
        }
        self.items.push((bounds, flags, payload));
        Ok(())
    }

    /// Number of queued entities.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True if no entities are queued.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Build the tree. Returns the tree plus the entity keys in input order.
    ///
    /// The build runs top-down over an open list of (node, group) pairs: a
    /// group at or below the splitting count (or parked in a straddler
    /// bucket) becomes that node's entity list; otherwise the node takes the
    /// first candidate cut separating the group and the sub-groups are pushed
    /// back. Bounds caches are computed in one bottom-up pass at the end.
    pub fn build(self) -> (Tree<P>, Vec<EntityKey>) {
        let mut tree = Tree::configured(self.scheme, self.policy, self.split_count, self.world);
        if self.items.is_empty() {
            return (tree, Vec::new());
        }
        tree.set_refreshing(true);
        let mut batch_union = self.items[0].0;
        for (b, _, _) in &self.items[1..] {
            batch_union = batch_union.union(*b);
        }
        let region = tree.world().unwrap_or(batch_union);
        let root = tree.alloc_node(region, false, None);
        tree.set_root(root);
        let mut keys = Vec::with_capacity(self.items.len());
        for (bounds, flags, payload) in self.items {
            keys.push(tree.alloc_entry(payload, bounds, flags, root));
        }
        tree.set_len(keys.len());

        let mut open: Vec<(NodeId, Vec<EntityKey>)> = Vec::new();
        open.push((root, keys.clone()));
        while let Some((node, group)) = open.pop() {
            if group.len() <= tree.split_count() || tree.node_is_icosep(node) {
                tree.set_entities(node, group);
                continue;
            }
            let mut boxes: Vec<Rect> = Vec::with_capacity(group.len());
            for &k in &group {
                boxes.push(tree.bounds_of(k).expect("builder key is live"));
            }
            let mut group_union = boxes[0];
            for &b in &boxes[1..] {
                group_union = group_union.union(b);
            }
            let region = tree.node_region(node);
            let Some(field) = tree.select_split_field(region, group_union.center(), &boxes)
            else {
                // Nothing separates this group; park it here.
                tree.set_entities(node, group);
                continue;
            };
            tree.set_field(node, field);
            let mut slots: Vec<Vec<EntityKey>> =
                (0..tree.scheme().arity()).map(|_| Vec::new()).collect();
            for (&k, &b) in group.iter().zip(&boxes) {
                slots[field.classify(tree.scheme(), b)].push(k);
            }
            for (slot, sub) in slots.into_iter().enumerate() {
                if sub.is_empty() {
                    continue;
                }
                let child = tree.ensure_child(node, slot);
                open.push((child, sub));
            }
        }
        tree.set_refreshing(false);
        tree.invalidate_bounds();
        tree.flush_inner();
        (tree, keys)
    }
}

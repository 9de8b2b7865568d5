// Copyright 2025 the Thicket Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use alloc::vec::Vec;
use kurbo::Rect;
use thicket_tree::{EntityKey, NodeId, Tree};

use crate::util::overlaps;

/// Lazy range-query iterator returned by
/// [`SpatialSet::query`][crate::SpatialSet::query].
///
/// Walks the tree depth-first, skipping subtrees whose bounds miss the query
/// rect, and yields each intersecting entity exactly once. Node bounds are
/// read through [`Tree::bounds`], so iteration is sound even when caches are
/// dirty.
pub struct Query<'a, P> {
    tree: &'a Tree<P>,
    rect: Rect,
    /// Nodes still to visit.
    stack: Vec<NodeId>,
    /// Node currently being scanned and the next entity index within it.
    cursor: Option<(NodeId, usize)>,
}

impl<P> core::fmt::Debug for Query<'_, P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Query")
            .field("rect", &self.rect)
            .field("stack", &self.stack.len())
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

impl<'a, P> Query<'a, P> {
    pub(crate) fn new(tree: &'a Tree<P>, rect: Rect) -> Self {
        Self {
            tree,
            rect,
            stack: tree.root().into_iter().collect(),
            cursor: None,
        }
    }
}

impl<'a, P> Iterator for Query<'a, P> {
    type Item = (EntityKey, &'a P);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((id, i)) = self.cursor {
                let entities = self.tree.node_entities(id);
                if let Some(&k) = entities.get(i) {
                    self.cursor = Some((id, i + 1));
                    let b = self.tree.bounds_of(k).expect("owned key is live");
                    if overlaps(b, self.rect) {
                        return Some((k, self.tree.get(k).expect("owned key is live")));
                    }
                    continue;
                }
                self.cursor = None;
            }
            let id = self.stack.pop()?;
            if let Some(nb) = self.tree.bounds(id)
                && overlaps(nb, self.rect)
            {
                self.stack.extend(self.tree.children_of(id));
                self.cursor = Some((id, 0));
            }
        }
    }
}

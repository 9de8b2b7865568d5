// Copyright 2025 the Thicket Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Public handle and flag types for the partition tree.

/// Identifier for an indexed entity (generational).
///
/// A key names an arena slot plus the generation that was current when the
/// entity was inserted. Keys held across a removal become *stale*: every
/// accessor treats them as absent rather than resolving to whatever entity
/// later reuses the slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct EntityKey(pub(crate) u32, pub(crate) u32);

impl EntityKey {
    pub(crate) const fn new(idx: u32, generation: u32) -> Self {
        Self(idx, generation)
    }

    pub(crate) const fn idx(self) -> usize {
        self.0 as usize
    }
}

/// Identifier for a node in the tree (generational).
///
/// Node identifiers surface through bound-change listeners and the node
/// accessors used by query layers. Like [`EntityKey`], a `NodeId` goes stale
/// when its node is pruned; stale identifiers are answered with empty results.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct NodeId(pub(crate) u32, pub(crate) u32);

impl NodeId {
    pub(crate) const fn new(idx: u32, generation: u32) -> Self {
        Self(idx, generation)
    }

    pub(crate) const fn idx(self) -> usize {
        self.0 as usize
    }
}

bitflags::bitflags! {
    /// Entity flags controlling mobility.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct EntityFlags: u8 {
        /// The entity's bounds may change over time. Mobile entities keep
        /// their owner back-reference usable for O(1) relocation via
        /// [`Tree::relocate`][crate::Tree::relocate]; entities inserted
        /// without this flag are static and refuse relocation.
        const MOBILE = 0b0000_0001;
    }
}

impl Default for EntityFlags {
    fn default() -> Self {
        Self::empty()
    }
}

// Copyright 2025 the Thicket Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Thicket Tree: 2D spatial-partition trees with deferred bound refresh.
//!
//! A family of partition trees indexing entities by axis-aligned bounding box
//! ([`kurbo::Rect`]) with an opaque payload per entity. Four branching shapes
//! share one implementation, selected by [`PartitionScheme`]:
//!
//! - BSP: one cut line per level, two children.
//! - Quad: two cut lines per level, four quadrant children.
//! - The *icosep* variants of both add a straddler bucket per node, so boxes
//!   crossing a cut line stay in a dedicated child instead of being forced to
//!   one side.
//!
//! Classification is total: every finite box maps to exactly one child slot,
//! so placement never fails on awkward geometry. Nodes split once they hold
//! more than a configurable number of entities, except when no axis-aligned
//! cut separates them (identical boxes pile up in one node rather than
//! splitting forever).
//!
//! ## Deferred bound refresh
//!
//! Each node caches the union of its subtree's entity bounds for query
//! pruning. Mutations do not eagerly recompute ancestor caches; they mark the
//! affected path dirty in a pending set, and [`Tree::flush`] recomputes all
//! dirty nodes bottom-up in one pass, returning a [`FlushReport`] and
//! notifying bound-change listeners. Reads through [`Tree::bounds`] are sound
//! at any time: a dirty node is recomputed transiently instead of trusting
//! its cache.
//!
//! ## API overview
//!
//! - [`Tree`]: arena-backed container; [`Tree::insert`], [`Tree::remove`],
//!   [`Tree::relocate`] (mobile entities), [`Tree::flush`].
//! - [`TreeBuilder`]: bulk construction of a balanced tree from a batch.
//! - [`EntityKey`] / [`NodeId`]: generational handles; stale handles read as
//!   absent, never as a reused slot.
//! - [`PartitionScheme`] / [`PartitionPolicy`] / [`PartitionField`]: branching
//!   shape, cut placement, and frozen cut geometry.
//!
//! The query surface (range iteration, nearest neighbor, membership) lives in
//! the `thicket_set` crate.
//!
//! This crate is `no_std` and uses `alloc`.

#![no_std]

extern crate alloc;

mod builder;
mod error;
mod partition;
mod refresh;
mod tree;
mod types;
mod util;

pub use builder::TreeBuilder;
pub use error::Error;
pub use partition::{Axis, PartitionField, PartitionPolicy, PartitionScheme};
pub use refresh::FlushReport;
pub use tree::{BoundsListener, ListenerKey, Tree};
pub use types::{EntityFlags, EntityKey, NodeId};

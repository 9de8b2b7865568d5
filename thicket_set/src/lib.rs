// Copyright 2025 the Thicket Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Thicket Set: a set-like spatial index over `thicket_tree`.
//!
//! [`SpatialSet`] wraps a [`Tree`] with the query surface:
//!
//! - [`SpatialSet::query`]: lazy range iteration over entities intersecting a
//!   rect, pruning subtrees by cached node bounds.
//! - [`SpatialSet::nearest`]: branch-and-bound nearest-neighbor search with a
//!   deterministic tie-break (earliest insert wins within
//!   [`DISTANCE_EPSILON`]).
//! - [`SpatialSet::contains`] / [`SpatialSet::slow_contains`]: tree-guided
//!   membership versus the exhaustive ground truth.
//! - Aggregates: [`SpatialSet::len`], [`SpatialSet::bounds`],
//!   [`SpatialSet::iter`], [`SpatialSet::clear`].
//!
//! Mutations and the deferred bound-refresh contract pass through to the
//! wrapped tree; see the `thicket_tree` crate docs. Core types are
//! re-exported here so most callers need only this crate.
//!
//! This crate is `no_std` and uses `alloc`.

#![no_std]

extern crate alloc;

mod query;
mod set;
mod util;

pub use query::Query;
pub use set::{DISTANCE_EPSILON, SpatialSet};
pub use thicket_tree::{
    Axis, EntityFlags, EntityKey, Error, FlushReport, ListenerKey, NodeId, PartitionField,
    PartitionPolicy, PartitionScheme, Tree, TreeBuilder,
};

// Copyright 2025 the Thicket Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Partition schemes, cut-placement policies, and box classification.
//!
//! A [`PartitionField`] is the frozen cut geometry of a subdivided node. It is
//! built once from the node's coverage region and a reference point, and from
//! then on classification against it is a pure function of an entity's box:
//! every finite box maps to exactly one child slot.

use kurbo::{Point, Rect};
use smallvec::SmallVec;

/// The branching shape of a tree.
///
/// The icosep variants add one extra child slot (always the last one) that
/// receives boxes straddling a cut line instead of forcing them to a side.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PartitionScheme {
    /// Binary partition along one axis per level. Arity 2.
    Bsp,
    /// Binary partition plus a straddler bucket. Arity 3.
    IcosepBsp,
    /// Four quadrants per level. Arity 4.
    Quad,
    /// Four quadrants plus a straddler bucket. Arity 5.
    IcosepQuad,
}

impl PartitionScheme {
    /// Number of child slots per node.
    pub const fn arity(self) -> usize {
        match self {
            Self::Bsp => 2,
            Self::IcosepBsp => 3,
            Self::Quad => 4,
            Self::IcosepQuad => 5,
        }
    }

    /// Slot index of the straddler bucket, if this scheme has one.
    pub const fn icosep_slot(self) -> Option<usize> {
        match self {
            Self::Bsp | Self::Quad => None,
            Self::IcosepBsp => Some(2),
            Self::IcosepQuad => Some(4),
        }
    }
}

/// How a node places its cut lines when it subdivides.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum PartitionPolicy {
    /// Anchor the cut at a reference point (typically the bound of the entity
    /// forcing the split), on the widest axis for BSP schemes. Adapts to the
    /// actual data distribution.
    #[default]
    LongestAxis,
    /// Cut at the midpoint of the coverage region. Data-independent, so
    /// identical trees result from any insertion order.
    Center,
}

/// Axis of a BSP cut line.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Axis {
    /// Vertical cut line at `x = cut`.
    X,
    /// Horizontal cut line at `y = cut`.
    Y,
}

/// Frozen cut geometry of a subdivided node.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum PartitionField {
    /// One cut line, splitting the region into a low and a high side.
    Bsp {
        /// Axis perpendicular to the cut line.
        axis: Axis,
        /// Coordinate of the cut line on that axis.
        cut: f64,
    },
    /// Two cut lines, splitting the region into four quadrants.
    Quad {
        /// Vertical cut line coordinate.
        cut_x: f64,
        /// Horizontal cut line coordinate.
        cut_y: f64,
    },
}

impl PartitionField {
    /// Builds the cut geometry for a node covering `region`, anchored at
    /// `reference` when the policy calls for it.
    ///
    /// The cut is clamped into the region so child regions never invert, even
    /// when the reference point lies outside the region.
    pub fn new(
        scheme: PartitionScheme,
        policy: PartitionPolicy,
        region: Rect,
        reference: Point,
    ) -> Self {
        match scheme {
            PartitionScheme::Bsp | PartitionScheme::IcosepBsp => {
                let axis = if region.width() >= region.height() {
                    Axis::X
                } else {
                    Axis::Y
                };
                Self::bsp(axis, policy, region, reference)
            }
            PartitionScheme::Quad | PartitionScheme::IcosepQuad => {
                Self::quad(policy, region, reference)
            }
        }
    }

    fn bsp(axis: Axis, policy: PartitionPolicy, region: Rect, reference: Point) -> Self {
        let cut = match (axis, policy) {
            (Axis::X, PartitionPolicy::LongestAxis) => reference.x.clamp(region.x0, region.x1),
            (Axis::Y, PartitionPolicy::LongestAxis) => reference.y.clamp(region.y0, region.y1),
            (Axis::X, PartitionPolicy::Center) => region.center().x,
            (Axis::Y, PartitionPolicy::Center) => region.center().y,
        };
        Self::Bsp { axis, cut }
    }

    fn quad(policy: PartitionPolicy, region: Rect, reference: Point) -> Self {
        let (cut_x, cut_y) = match policy {
            PartitionPolicy::LongestAxis => (
                reference.x.clamp(region.x0, region.x1),
                reference.y.clamp(region.y0, region.y1),
            ),
            PartitionPolicy::Center => (region.center().x, region.center().y),
        };
        Self::Quad { cut_x, cut_y }
    }

    /// Classifies a box into a child slot. Total: every finite box (including
    /// degenerate points and segments) maps to exactly one slot.
    ///
    /// A box lying entirely at or below a cut goes to the low side; the low
    /// side is checked first, so a box touching the cut line from below stays
    /// low. Straddling boxes go to the icosep slot when the scheme has one,
    /// otherwise to the lower-indexed side.
    ///
    /// Quadrant slot order is SW = 0, SE = 1, NW = 2, NE = 3 (x varies
    /// fastest), with the icosep bucket last.
    pub fn classify(&self, scheme: PartitionScheme, rect: Rect) -> usize {
        match *self {
            Self::Bsp { axis, cut } => {
                let (lo, hi) = match axis {
                    Axis::X => (rect.x0, rect.x1),
                    Axis::Y => (rect.y0, rect.y1),
                };
                if hi <= cut {
                    0
                } else if lo >= cut {
                    1
                } else {
                    scheme.icosep_slot().unwrap_or(0)
                }
            }
            Self::Quad { cut_x, cut_y } => {
                let xs = Self::side(rect.x0, rect.x1, cut_x);
                let ys = Self::side(rect.y0, rect.y1, cut_y);
                match (xs, ys) {
                    (Some(xs), Some(ys)) => ys * 2 + xs,
                    _ => match scheme.icosep_slot() {
                        Some(slot) => slot,
                        // No straddler bucket: resolve each straddling axis
                        // to its low side.
                        None => ys.unwrap_or(0) * 2 + xs.unwrap_or(0),
                    },
                }
            }
        }
    }

    /// Which side of a cut an interval falls on, `None` if it straddles.
    fn side(lo: f64, hi: f64, cut: f64) -> Option<usize> {
        if hi <= cut {
            Some(0)
        } else if lo >= cut {
            Some(1)
        } else {
            None
        }
    }

    /// Coverage region of a child slot. The icosep slot covers the whole
    /// parent region; straddlers are not confined to a sub-region.
    pub fn child_region(&self, scheme: PartitionScheme, region: Rect, slot: usize) -> Rect {
        if scheme.icosep_slot() == Some(slot) {
            return region;
        }
        match *self {
            Self::Bsp { axis: Axis::X, cut } => {
                if slot == 0 {
                    Rect::new(region.x0, region.y0, cut, region.y1)
                } else {
                    Rect::new(cut, region.y0, region.x1, region.y1)
                }
            }
            Self::Bsp { axis: Axis::Y, cut } => {
                if slot == 0 {
                    Rect::new(region.x0, region.y0, region.x1, cut)
                } else {
                    Rect::new(region.x0, cut, region.x1, region.y1)
                }
            }
            Self::Quad { cut_x, cut_y } => {
                let (x0, x1) = if slot % 2 == 0 {
                    (region.x0, cut_x)
                } else {
                    (cut_x, region.x1)
                };
                let (y0, y1) = if slot / 2 == 0 {
                    (region.y0, cut_y)
                } else {
                    (cut_y, region.y1)
                };
                Rect::new(x0, y0, x1, y1)
            }
        }
    }

    /// Candidate cut geometries for subdividing a node, in preference order.
    ///
    /// The first candidate follows the configured policy; the fallbacks give
    /// the split-selection loop a second chance when the primary cut would
    /// put every entity in a single slot (the alternate BSP axis, or the
    /// midpoint cut for quads under the reference-anchored policy).
    pub(crate) fn candidates(
        scheme: PartitionScheme,
        policy: PartitionPolicy,
        region: Rect,
        reference: Point,
    ) -> SmallVec<[Self; 2]> {
        let mut out = SmallVec::new();
        match scheme {
            PartitionScheme::Bsp | PartitionScheme::IcosepBsp => {
                let primary = if region.width() >= region.height() {
                    Axis::X
                } else {
                    Axis::Y
                };
                let alternate = match primary {
                    Axis::X => Axis::Y,
                    Axis::Y => Axis::X,
                };
                out.push(Self::bsp(primary, policy, region, reference));
                out.push(Self::bsp(alternate, policy, region, reference));
            }
            PartitionScheme::Quad | PartitionScheme::IcosepQuad => {
                out.push(Self::quad(policy, region, reference));
                let center = Self::quad(PartitionPolicy::Center, region, reference);
                if out[0] != center {
                    out.push(center);
                }
            }
        }
        out
    }
}

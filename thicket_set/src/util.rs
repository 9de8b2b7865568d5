// Copyright 2025 the Thicket Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use kurbo::{Point, Rect};

/// Edge-inclusive overlap test, matching the tree's union semantics: a query
/// touching a box's edge selects it.
pub(crate) fn overlaps(a: Rect, b: Rect) -> bool {
    a.x0 <= b.x1 && b.x0 <= a.x1 && a.y0 <= b.y1 && b.y0 <= a.y1
}

/// Squared distance from a point to the nearest point of a rect
/// (zero when inside or on the boundary).
pub(crate) fn min_dist_sq(p: Point, r: Rect) -> f64 {
    let dx = if p.x < r.x0 {
        r.x0 - p.x
    } else if p.x > r.x1 {
        p.x - r.x1
    } else {
        0.0
    };
    let dy = if p.y < r.y0 {
        r.y0 - p.y
    } else if p.y > r.y1 {
        p.y - r.y1
    } else {
        0.0
    };
    dx * dx + dy * dy
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_is_edge_inclusive() {
        let a = Rect::new(0.0, 0.0, 1.0, 1.0);
        assert!(overlaps(a, Rect::new(1.0, 0.0, 2.0, 1.0)));
        assert!(overlaps(a, Rect::new(0.5, 0.5, 0.5, 0.5)));
        assert!(!overlaps(a, Rect::new(1.1, 0.0, 2.0, 1.0)));
    }

    #[test]
    fn min_dist_sq_zero_inside() {
        let r = Rect::new(0.0, 0.0, 2.0, 2.0);
        assert_eq!(min_dist_sq(Point::new(1.0, 1.0), r), 0.0);
        assert_eq!(min_dist_sq(Point::new(2.0, 2.0), r), 0.0);
        assert_eq!(min_dist_sq(Point::new(5.0, 2.0), r), 9.0);
        assert_eq!(min_dist_sq(Point::new(5.0, 6.0), r), 9.0 + 16.0);
    }
}

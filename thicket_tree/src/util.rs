// Copyright 2025 the Thicket Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use kurbo::Rect;

/// Whether a rect is usable as an entity bound: finite coordinates and
/// non-inverted extents. Zero-width or zero-height rects are fine.
pub(crate) fn is_valid_bounds(r: Rect) -> bool {
    r.x0.is_finite()
        && r.y0.is_finite()
        && r.x1.is_finite()
        && r.y1.is_finite()
        && r.x0 <= r.x1
        && r.y0 <= r.y1
}

/// Union of an optional accumulator with a rect.
pub(crate) fn union_opt(acc: Option<Rect>, r: Rect) -> Option<Rect> {
    Some(match acc {
        Some(a) => a.union(r),
        None => r,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_bounds_rejects_nan_and_inverted() {
        assert!(is_valid_bounds(Rect::new(0.0, 0.0, 1.0, 1.0)));
        assert!(is_valid_bounds(Rect::new(2.0, 3.0, 2.0, 3.0)));
        assert!(!is_valid_bounds(Rect::new(f64::NAN, 0.0, 1.0, 1.0)));
        assert!(!is_valid_bounds(Rect::new(0.0, 0.0, f64::INFINITY, 1.0)));
        assert!(!is_valid_bounds(Rect::new(1.0, 0.0, 0.0, 1.0)));
    }

    #[test]
    fn union_opt_accumulates() {
        let a = union_opt(None, Rect::new(0.0, 0.0, 1.0, 1.0));
        assert_eq!(a, Some(Rect::new(0.0, 0.0, 1.0, 1.0)));
        let b = union_opt(a, Rect::new(4.0, 4.0, 5.0, 5.0));
        assert_eq!(b, Some(Rect::new(0.0, 0.0, 5.0, 5.0)));
    }
}

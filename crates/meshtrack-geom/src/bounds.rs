//! Axis-aligned bounding boxes.

use std::fmt;

use approx::{AbsDiffEq, RelativeEq};
use itertools::{Itertools, MinMaxResult};
use serde::{Deserialize, Serialize};

/// An axis-aligned box spanning from `start` (top left) to `end` (bottom right).
///
/// `start <= end` is expected componentwise, but not enforced: degenerate boxes are accepted and
/// simply report a zero (or nonsensical) area. Operations that would divide by such an area
/// ([`BoundingBox::iou`]) treat them as not overlapping anything.
#[derive(Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub start: [f32; 2],
    pub end: [f32; 2],
}

impl BoundingBox {
    /// The factor by which [`BoundingBox::enlarge`] is usually called.
    pub const DEFAULT_ENLARGE_FACTOR: f32 = 1.5;

    #[inline]
    pub const fn new(start: [f32; 2], end: [f32; 2]) -> Self {
        Self { start, end }
    }

    /// Creates a box of the given size extending outwards from `center`.
    pub fn from_center(center: [f32; 2], size: [f32; 2]) -> Self {
        let [cx, cy] = center;
        let [hw, hh] = [size[0] / 2.0, size[1] / 2.0];
        Self::new([cx - hw, cy - hh], [cx + hw, cy + hh])
    }

    /// Computes the bounding box that encompasses all `points`.
    ///
    /// Only the first 2 coordinates of every point are considered, so this works for 3D
    /// landmarks as well. Returns [`None`] if `points` is empty.
    pub fn bounding<I, P>(points: I) -> Option<Self>
    where
        I: IntoIterator<Item = P>,
        I::IntoIter: Clone,
        P: AsRef<[f32]>,
    {
        let points = points.into_iter();
        let xs = points.clone().map(|p| p.as_ref()[0]).minmax_by(f32::total_cmp);
        let ys = points.map(|p| p.as_ref()[1]).minmax_by(f32::total_cmp);
        let ([x0, x1], [y0, y1]) = match (xs, ys) {
            (MinMaxResult::NoElements, _) | (_, MinMaxResult::NoElements) => return None,
            (xs, ys) => (minmax_pair(xs), minmax_pair(ys)),
        };
        Some(Self::new([x0, y0], [x1, y1]))
    }

    /// Returns the absolute `[width, height]` of the box.
    #[inline]
    pub fn size(&self) -> [f32; 2] {
        [
            (self.end[0] - self.start[0]).abs(),
            (self.end[1] - self.start[1]).abs(),
        ]
    }

    #[inline]
    pub fn width(&self) -> f32 {
        self.size()[0]
    }

    #[inline]
    pub fn height(&self) -> f32 {
        self.size()[1]
    }

    #[inline]
    pub fn area(&self) -> f32 {
        let [w, h] = self.size();
        w * h
    }

    #[inline]
    pub fn center(&self) -> [f32; 2] {
        [
            self.start[0] + (self.end[0] - self.start[0]) / 2.0,
            self.start[1] + (self.end[1] - self.start[1]) / 2.0,
        ]
    }

    /// Multiplies both corners by the per-axis `factors`.
    ///
    /// This maps a box between coordinate spaces of differently sized images.
    #[must_use]
    pub fn scale(&self, factors: [f32; 2]) -> Self {
        Self::new(
            [self.start[0] * factors[0], self.start[1] * factors[1]],
            [self.end[0] * factors[0], self.end[1] * factors[1]],
        )
    }

    /// Grows (or shrinks) the box around its center by `factor`, preserving its aspect ratio.
    #[must_use]
    pub fn enlarge(&self, factor: f32) -> Self {
        let [w, h] = self.size();
        Self::from_center(self.center(), [w * factor, h * factor])
    }

    /// Turns the box into a square whose edge is the larger of its width and height.
    ///
    /// The center stays in place.
    #[must_use]
    pub fn squarify(&self) -> Self {
        let [w, h] = self.size();
        let edge = w.max(h);
        Self::from_center(self.center(), [edge, edge])
    }

    /// Moves both corners by `offset`.
    #[must_use]
    pub fn move_by(&self, offset: [f32; 2]) -> Self {
        Self::new(
            [self.start[0] + offset[0], self.start[1] + offset[1]],
            [self.end[0] + offset[0], self.end[1] + offset[1]],
        )
    }

    /// Computes the area of the overlap between `self` and `other`.
    pub fn intersection_area(&self, other: &Self) -> f32 {
        let x0 = self.start[0].max(other.start[0]);
        let y0 = self.start[1].max(other.start[1]);
        let x1 = self.end[0].min(other.end[0]);
        let y1 = self.end[1].min(other.end[1]);
        (x1 - x0).max(0.0) * (y1 - y0).max(0.0)
    }

    /// Computes the intersection-over-union of `self` and `other`.
    ///
    /// Returns 0.0 if the boxes don't overlap, or if their union is empty.
    pub fn iou(&self, other: &Self) -> f32 {
        let intersection = self.intersection_area(other);
        if intersection <= 0.0 {
            return 0.0;
        }

        let union = self.area() + other.area() - intersection;
        if union <= 0.0 || !union.is_finite() {
            return 0.0;
        }

        intersection / union
    }

    /// Divides the coordinates by the per-axis `dims`, yielding coordinates in `0.0..=1.0` for
    /// boxes inside an image of size `dims`.
    #[must_use]
    pub fn normalize(&self, dims: [f32; 2]) -> Self {
        self.scale([1.0 / dims[0], 1.0 / dims[1]])
    }
}

fn minmax_pair(res: MinMaxResult<f32>) -> [f32; 2] {
    match res {
        MinMaxResult::NoElements => [0.0, 0.0],
        MinMaxResult::OneElement(v) => [v, v],
        MinMaxResult::MinMax(min, max) => [min, max],
    }
}

impl fmt::Debug for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BoundingBox({:?} -> {:?}, {}x{})",
            self.start,
            self.end,
            self.width(),
            self.height()
        )
    }
}

fn corners(b: &BoundingBox) -> impl Iterator<Item = f32> {
    b.start.into_iter().chain(b.end)
}

impl AbsDiffEq for BoundingBox {
    type Epsilon = f32;

    fn default_epsilon() -> f32 {
        f32::default_epsilon()
    }

    fn abs_diff_eq(&self, other: &Self, epsilon: f32) -> bool {
        corners(self)
            .zip(corners(other))
            .all(|(a, b)| a.abs_diff_eq(&b, epsilon))
    }
}

impl RelativeEq for BoundingBox {
    fn default_max_relative() -> f32 {
        f32::default_max_relative()
    }

    fn relative_eq(&self, other: &Self, epsilon: f32, max_relative: f32) -> bool {
        corners(self)
            .zip(corners(other))
            .all(|(a, b)| a.relative_eq(&b, epsilon, max_relative))
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn random_box() -> BoundingBox {
        let x = fastrand::f32() * 1000.0 - 500.0;
        let y = fastrand::f32() * 1000.0 - 500.0;
        let w = fastrand::f32() * 300.0 + 0.5;
        let h = fastrand::f32() * 300.0 + 0.5;
        BoundingBox::new([x, y], [x + w, y + h])
    }

    #[test]
    fn size_and_center() {
        let b = BoundingBox::new([10.0, 20.0], [30.0, 60.0]);
        assert_eq!(b.size(), [20.0, 40.0]);
        assert_eq!(b.center(), [20.0, 40.0]);

        // Flipped corners still report a positive size.
        let flipped = BoundingBox::new([30.0, 60.0], [10.0, 20.0]);
        assert_eq!(flipped.size(), [20.0, 40.0]);
    }

    #[test]
    fn scale_multiplies_both_corners() {
        let b = BoundingBox::new([1.0, 2.0], [3.0, 4.0]).scale([2.0, 0.5]);
        assert_eq!(b, BoundingBox::new([2.0, 1.0], [6.0, 2.0]));
    }

    #[test]
    fn enlarge_preserves_aspect() {
        let b = BoundingBox::new([0.0, 0.0], [10.0, 20.0]).enlarge(1.5);
        assert_relative_eq!(b, BoundingBox::new([-2.5, -5.0], [12.5, 25.0]));
    }

    #[test]
    fn squarify_uses_longest_edge() {
        let b = BoundingBox::new([0.0, 0.0], [10.0, 20.0]).squarify();
        assert_relative_eq!(b, BoundingBox::new([-5.0, 0.0], [15.0, 20.0]));
    }

    #[test]
    fn squarify_enlarge_keeps_center() {
        for _ in 0..200 {
            let b = random_box();
            let factor = fastrand::f32() * 3.0 + 0.1;
            let out = b.enlarge(factor).squarify();

            let [cx, cy] = b.center();
            let [ox, oy] = out.center();
            assert_relative_eq!(cx, ox, epsilon = 1e-3);
            assert_relative_eq!(cy, oy, epsilon = 1e-3);
            assert_relative_eq!(out.width(), out.height(), epsilon = 1e-3);
        }
    }

    #[test]
    fn iou() {
        let a = BoundingBox::new([0.0, 0.0], [2.0, 2.0]);
        let b = BoundingBox::new([1.0, 0.0], [3.0, 2.0]);
        assert_eq!(a.iou(&a), 1.0);
        assert_relative_eq!(a.iou(&b), 2.0 / 6.0);
        assert_eq!(a.iou(&b), b.iou(&a));

        // Touching edges, no overlap.
        let c = BoundingBox::new([2.0, 0.0], [4.0, 2.0]);
        assert_eq!(a.iou(&c), 0.0);

        let far = BoundingBox::new([100.0, 100.0], [101.0, 101.0]);
        assert_eq!(a.iou(&far), 0.0);
    }

    #[test]
    fn iou_degenerate() {
        let zero = BoundingBox::new([1.0, 1.0], [1.0, 1.0]);
        assert_eq!(zero.iou(&zero), 0.0);
        let line = BoundingBox::new([0.0, 1.0], [5.0, 1.0]);
        let a = BoundingBox::new([0.0, 0.0], [2.0, 2.0]);
        assert_eq!(line.iou(&a), 0.0);
        assert!(!a.iou(&zero).is_nan());
    }

    #[test]
    fn iou_random_identical_and_disjoint() {
        for _ in 0..100 {
            let b = random_box();
            assert_relative_eq!(b.iou(&b), 1.0, epsilon = 1e-5);

            let disjoint = b.move_by([b.width() + 1.0, 0.0]);
            assert_eq!(b.iou(&disjoint), 0.0);
        }
    }

    #[test]
    fn bounding() {
        assert_eq!(BoundingBox::bounding(Vec::<[f32; 2]>::new()), None);

        let points: [[f32; 3]; 3] = [[1.0, 5.0, -3.0], [-2.0, 0.5, 7.0], [4.0, 2.0, 0.0]];
        let b = BoundingBox::bounding(&points).unwrap();
        assert_eq!(b, BoundingBox::new([-2.0, 0.5], [4.0, 5.0]));

        let single = BoundingBox::bounding([[3.0f32, 4.0]]).unwrap();
        assert_eq!(single, BoundingBox::new([3.0, 4.0], [3.0, 4.0]));
    }
}

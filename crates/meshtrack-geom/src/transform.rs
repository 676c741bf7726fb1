//! Rigid 2D transforms in homogeneous coordinates.

use std::f32::consts::{FRAC_PI_2, PI, TAU};
use std::ops::Mul;

use approx::{AbsDiffEq, RelativeEq};
use nalgebra::{Matrix2, Matrix3, Vector2, Vector3};

/// Wraps an angle in radians into the range `(-π, π]`.
pub fn normalize_radians(angle: f32) -> f32 {
    let wrapped = angle - TAU * ((angle + PI) / TAU).floor();
    // The formula above yields `[-π, π)`; fold the lower bound over to the upper one.
    if wrapped <= -PI {
        wrapped + TAU
    } else {
        wrapped
    }
}

/// Computes the angle by which the line from `p1` to `p2` has to be rotated to point straight
/// up (towards negative Y).
///
/// This is used with a pair of landmarks on the vertical axis of symmetry of a face (eg. mouth
/// and nose) to cancel out in-plane head tilt. An upright face yields an angle of 0.
pub fn compute_rotation(p1: [f32; 2], p2: [f32; 2]) -> f32 {
    let radians = FRAC_PI_2 - f32::atan2(-(p2[1] - p1[1]), p2[0] - p1[0]);
    normalize_radians(radians)
}

/// A 3x3 homogeneous transform consisting of a rotation and a translation.
///
/// Transforms are only ever constructed from rotations and translations, so the upper-left 2x2
/// block is always orthonormal and [`Transform::invert`] never fails.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    matrix: Matrix3<f32>,
}

impl Transform {
    #[inline]
    pub fn identity() -> Self {
        Self {
            matrix: Matrix3::identity(),
        }
    }

    /// Creates a transform that moves points by `[x, y]`.
    pub fn translation([x, y]: [f32; 2]) -> Self {
        Self {
            matrix: Matrix3::new(
                1.0, 0.0, x, //
                0.0, 1.0, y, //
                0.0, 0.0, 1.0,
            ),
        }
    }

    /// Creates a transform that rotates points around the origin by `radians`.
    pub fn rotation(radians: f32) -> Self {
        let (sin, cos) = radians.sin_cos();
        Self {
            matrix: Matrix3::new(
                cos, -sin, 0.0, //
                sin, cos, 0.0, //
                0.0, 0.0, 1.0,
            ),
        }
    }

    /// Creates a transform that rotates points by `radians` around `center`.
    ///
    /// This is `translation(center) * rotation(radians) * translation(-center)`: the point is
    /// moved so that `center` lies at the origin, rotated, and moved back.
    pub fn rotation_about(radians: f32, center: [f32; 2]) -> Self {
        let [cx, cy] = center;
        Self::translation(center) * Self::rotation(radians) * Self::translation([-cx, -cy])
    }

    /// Returns the underlying 3x3 matrix.
    #[inline]
    pub fn matrix(&self) -> &Matrix3<f32> {
        &self.matrix
    }

    /// Computes the inverse transform.
    ///
    /// Relies on the rotation block being orthonormal: its inverse is its transpose, and the
    /// inverse translation is `-Rᵀ·t`.
    #[must_use]
    pub fn invert(&self) -> Self {
        let rotation: Matrix2<f32> = self.matrix.fixed_view::<2, 2>(0, 0).transpose();
        let translation: Vector2<f32> = self.matrix.fixed_view::<2, 1>(0, 2).into_owned();
        let inv_translation = -(rotation * translation);

        let mut matrix = Matrix3::identity();
        matrix.fixed_view_mut::<2, 2>(0, 0).copy_from(&rotation);
        matrix.fixed_view_mut::<2, 1>(0, 2).copy_from(&inv_translation);
        Self { matrix }
    }

    /// Maps a point through this transform.
    pub fn apply(&self, [x, y]: [f32; 2]) -> [f32; 2] {
        let out = self.matrix * Vector3::new(x, y, 1.0);
        [out.x, out.y]
    }

    /// Rotates a vector, ignoring the translation part of this transform.
    pub fn rotate_vector(&self, [x, y]: [f32; 2]) -> [f32; 2] {
        let out = self.matrix.fixed_view::<2, 2>(0, 0) * Vector2::new(x, y);
        [out.x, out.y]
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::identity()
    }
}

/// Composes two transforms. `a * b` applies `b` first, then `a`.
impl Mul for Transform {
    type Output = Transform;

    fn mul(self, rhs: Transform) -> Transform {
        Transform {
            matrix: self.matrix * rhs.matrix,
        }
    }
}

impl AbsDiffEq for Transform {
    type Epsilon = f32;

    fn default_epsilon() -> f32 {
        f32::default_epsilon()
    }

    fn abs_diff_eq(&self, other: &Self, epsilon: f32) -> bool {
        self.matrix.abs_diff_eq(&other.matrix, epsilon)
    }
}

impl RelativeEq for Transform {
    fn default_max_relative() -> f32 {
        f32::default_max_relative()
    }

    fn relative_eq(&self, other: &Self, epsilon: f32, max_relative: f32) -> bool {
        self.matrix.relative_eq(&other.matrix, epsilon, max_relative)
    }
}

#[cfg(test)]
mod tests {
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    use super::*;

    fn random_angle() -> f32 {
        (fastrand::f32() - 0.5) * 40.0
    }

    #[test]
    fn normalize_range() {
        assert_eq!(normalize_radians(0.0), 0.0);
        assert_eq!(normalize_radians(PI), PI);
        assert_eq!(normalize_radians(-PI), PI);
        assert_relative_eq!(normalize_radians(3.0 * PI / 2.0), -PI / 2.0, epsilon = 1e-5);
        assert_relative_eq!(normalize_radians(-3.0 * PI / 2.0), PI / 2.0, epsilon = 1e-5);

        for _ in 0..500 {
            let a = random_angle();
            let n = normalize_radians(a);
            assert!(n > -PI && n <= PI, "{a} normalized to {n}");
            assert_eq!(normalize_radians(n), n, "not idempotent for {a}");
            assert_abs_diff_eq!(normalize_radians(a + TAU), n, epsilon = 1e-4);
        }
    }

    #[test]
    fn rotation_of_upright_line_is_zero() {
        // Mouth below the nose (Y points down).
        assert_abs_diff_eq!(compute_rotation([50.0, 80.0], [50.0, 40.0]), 0.0);
        // Line tilted to the right needs a positive rotation to become vertical.
        assert_relative_eq!(compute_rotation([0.0, 0.0], [1.0, -1.0]), PI / 4.0, epsilon = 1e-6);
        assert_relative_eq!(compute_rotation([0.0, 0.0], [-1.0, 0.0]), -PI / 2.0, epsilon = 1e-6);
    }

    #[test]
    fn rotation_about_keeps_center() {
        let t = Transform::rotation_about(1.234, [10.0, -3.0]);
        let [x, y] = t.apply([10.0, -3.0]);
        assert_relative_eq!(x, 10.0, epsilon = 1e-5);
        assert_relative_eq!(y, -3.0, epsilon = 1e-5);

        let [x, y] = Transform::rotation(PI / 2.0).apply([1.0, 0.0]);
        assert_abs_diff_eq!(x, 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(y, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn composition_order() {
        let t = Transform::translation([5.0, 0.0]) * Transform::rotation(PI / 2.0);
        // Rotated first, then moved.
        let [x, y] = t.apply([1.0, 0.0]);
        assert_abs_diff_eq!(x, 5.0, epsilon = 1e-6);
        assert_abs_diff_eq!(y, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn invert_yields_identity() {
        for _ in 0..200 {
            let angle = random_angle();
            let center = [fastrand::f32() * 2000.0 - 1000.0, fastrand::f32() * 2000.0];
            let t = Transform::rotation_about(angle, center);
            let inv = t.invert();
            assert_abs_diff_eq!(inv * t, Transform::identity(), epsilon = 1e-3);
            assert_abs_diff_eq!(t * inv, Transform::identity(), epsilon = 1e-3);
        }
    }

    #[test]
    fn rotate_vector_ignores_translation() {
        let t = Transform::rotation_about(PI, [100.0, 100.0]);
        let [x, y] = t.rotate_vector([1.0, 2.0]);
        assert_abs_diff_eq!(x, -1.0, epsilon = 1e-5);
        assert_abs_diff_eq!(y, -2.0, epsilon = 1e-5);
    }
}

//! Iterator helpers.

use std::iter::Zip;

/// Like [`Iterator::zip`], but panics if the iterators have different lengths.
///
/// Used when merging landmark lists that must line up one-to-one, where a silently truncated
/// `zip` would leave stale coordinates behind.
#[track_caller]
pub fn zip_exact<A, B>(a: A, b: B) -> Zip<A::IntoIter, B::IntoIter>
where
    A: IntoIterator,
    B: IntoIterator,
    A::IntoIter: ExactSizeIterator,
    B::IntoIter: ExactSizeIterator,
{
    let a = a.into_iter();
    let b = b.into_iter();
    assert_eq!(
        a.len(),
        b.len(),
        "`zip_exact` called on iterators with different lengths"
    );

    a.zip(b)
}

/// Splits a flat `[x0, y0, z0, x1, y1, z1, ...]` buffer into `[x, y, z]` points.
///
/// Trailing values that don't form a complete point are ignored.
pub fn points3(flat: &[f32]) -> impl ExactSizeIterator<Item = [f32; 3]> + '_ {
    flat.chunks_exact(3).map(|c| [c[0], c[1], c[2]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic]
    fn zip_exact_length_mismatch() {
        zip_exact([1, 2, 3], [1, 2]).for_each(drop);
    }

    #[test]
    fn points3_groups() {
        let flat = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0];
        let points: Vec<_> = points3(&flat).collect();
        assert_eq!(points, [[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        assert_eq!(points3(&flat).len(), 2);
    }
}

//! Dense face mesh landmark estimation.
//!
//! A [`MeshNetwork`] is given an upright, cropped image of a single face and estimates the
//! positions of [`LANDMARK_COUNT`] landmarks in pixels of that crop, plus a "face flag" indicating
//! how likely it is that the crop actually contains a face.

pub mod annotations;

use anyhow::bail;
use meshtrack_geom::Resolution;
use ndarray::{Array2, ArrayView4};

use crate::iter::points3;

/// Number of landmarks estimated by the face mesh network.
pub const LANDMARK_COUNT: usize = 468;

/// Number of landmarks after the iris landmarks (5 per eye) have been appended.
pub const LANDMARK_COUNT_WITH_IRISES: usize = LANDMARK_COUNT + 2 * 5;

/// Mesh landmark at the center of the lips.
pub const MOUTH_CENTER: usize = 13;

/// Mesh landmark between the eyes, at the top of the nose bridge.
pub const MIDWAY_BETWEEN_EYES: usize = annotations::MIDWAY_BETWEEN_EYES[0];

/// Trait implemented by neural networks that estimate a dense face mesh.
pub trait MeshNetwork: Send + Sync + 'static {
    /// Returns the size of the face crops the network expects.
    fn input_resolution(&self) -> Resolution;

    /// Runs the network.
    ///
    /// `input` has shape `[1, height, width, 3]` with color values in `0.0..=1.0`.
    fn infer(&self, input: ArrayView4<'_, f32>) -> anyhow::Result<MeshEstimate>;
}

/// Raw output of a [`MeshNetwork`].
#[derive(Debug, Clone)]
pub struct MeshEstimate {
    /// Probability that the input depicts a face.
    pub face_flag: f32,
    /// `N x 3` landmark coordinates, in pixels of the network input.
    pub coords: Array2<f32>,
}

impl MeshEstimate {
    /// Returns the landmark positions, checking that exactly `expected` 3D landmarks are present.
    pub fn points(&self, expected: usize) -> anyhow::Result<Vec<[f32; 3]>> {
        let (rows, cols) = self.coords.dim();
        if cols != 3 || rows != expected {
            bail!("face mesh output has shape {rows}x{cols}, expected {expected}x3");
        }

        Ok(match self.coords.as_slice() {
            Some(flat) => points3(flat).collect(),
            None => self
                .coords
                .rows()
                .into_iter()
                .map(|row| [row[0], row[1], row[2]])
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn points_checks_shape() {
        let est = MeshEstimate {
            face_flag: 1.0,
            coords: Array2::zeros((LANDMARK_COUNT, 3)),
        };
        assert_eq!(est.points(LANDMARK_COUNT).unwrap().len(), LANDMARK_COUNT);
        assert!(est.points(10).is_err());

        let est = MeshEstimate {
            face_flag: 1.0,
            coords: Array2::zeros((LANDMARK_COUNT, 2)),
        };
        assert!(est.points(LANDMARK_COUNT).is_err());
    }

    #[test]
    fn points_of_strided_array() {
        let coords = Array2::from_shape_fn((3, 4), |(r, c)| (r * 10 + c) as f32);
        let est = MeshEstimate {
            face_flag: 0.5,
            coords: coords.slice_move(ndarray::s![.., 1..]),
        };
        assert_eq!(
            est.points(3).unwrap(),
            [[1.0, 2.0, 3.0], [11.0, 12.0, 13.0], [21.0, 22.0, 23.0]]
        );
    }
}

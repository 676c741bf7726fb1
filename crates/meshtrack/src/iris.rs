//! Iris landmark refinement.
//!
//! The face mesh network is not very precise around the eyes. MediaPipe's iris network is run on
//! a small crop around each eye and estimates [`EYE_LANDMARK_COUNT`] landmarks per eye: 71
//! landmarks on the eyelids and eyebrows, followed by 5 iris landmarks (center, then the right,
//! top, left and bottom edge of the iris).
//!
//! The iris network only knows a single eye orientation, so the crop of the left eye is mirrored
//! before inference and the resulting landmarks are mirrored back.

use std::ops::Range;

use anyhow::bail;
use meshtrack_geom::{BoundingBox, Resolution};
use ndarray::{ArrayView3, ArrayView4, Axis, Dim};

use crate::image;
use crate::iter::{points3, zip_exact};
use crate::landmark::annotations;
use crate::scope::FrameScope;
use crate::timer::Timer;

/// Number of landmarks the iris network estimates per eye.
pub const EYE_LANDMARK_COUNT: usize = 76;

/// Index of the first iris landmark in the output of the iris network.
pub const IRIS_START: usize = 71;

/// Factor by which the box spanned by the eye corners is enlarged before cropping.
pub const ENLARGE_EYE_RATIO: f32 = 2.3;

/// Eye corner depth difference below which both eyes are considered visible enough to replace
/// all of their contours.
pub const FRONTAL_DEPTH_DIFFERENCE: f32 = 30.0;

const IRIS_UPPER_CENTER: usize = 3;
const IRIS_LOWER_CENTER: usize = 4;

/// Trait implemented by neural networks that estimate eye and iris landmarks.
pub trait IrisNetwork: Send + Sync + 'static {
    /// Returns the size of a single eye crop.
    fn input_resolution(&self) -> Resolution;

    /// Runs the network on a batch of eye crops.
    ///
    /// `input` has shape `[2, height, width, 3]` (mirrored left eye first, then right eye), with
    /// color values in `0.0..=1.0`. The output is the flattened `[x, y, z]` coordinates of the
    /// [`EYE_LANDMARK_COUNT`] landmarks of each eye, in pixels of the eye crop.
    fn infer(&self, input: ArrayView4<'_, f32>) -> anyhow::Result<Vec<f32>>;
}

/// "Left" and "right" are from the perspective of the person in the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eye {
    Left,
    Right,
}

impl Eye {
    /// Returns the mesh indices of the two eye corners.
    pub fn corners(self) -> [usize; 2] {
        let outline = self.contour(Contour::EyeLower0);
        [outline[0], outline[outline.len() - 1]]
    }

    /// Returns the mesh indices of a contour around this eye.
    pub fn contour(self, contour: Contour) -> &'static [usize] {
        use annotations::*;
        use Contour::*;

        match (self, contour) {
            (Eye::Left, EyeUpper0) => LEFT_EYE_UPPER_0,
            (Eye::Left, EyeUpper1) => LEFT_EYE_UPPER_1,
            (Eye::Left, EyeUpper2) => LEFT_EYE_UPPER_2,
            (Eye::Left, EyeLower0) => LEFT_EYE_LOWER_0,
            (Eye::Left, EyeLower1) => LEFT_EYE_LOWER_1,
            (Eye::Left, EyeLower2) => LEFT_EYE_LOWER_2,
            (Eye::Left, EyeLower3) => LEFT_EYE_LOWER_3,
            (Eye::Left, EyebrowUpper) => LEFT_EYEBROW_UPPER,
            (Eye::Left, EyebrowLower) => LEFT_EYEBROW_LOWER,
            (Eye::Right, EyeUpper0) => RIGHT_EYE_UPPER_0,
            (Eye::Right, EyeUpper1) => RIGHT_EYE_UPPER_1,
            (Eye::Right, EyeUpper2) => RIGHT_EYE_UPPER_2,
            (Eye::Right, EyeLower0) => RIGHT_EYE_LOWER_0,
            (Eye::Right, EyeLower1) => RIGHT_EYE_LOWER_1,
            (Eye::Right, EyeLower2) => RIGHT_EYE_LOWER_2,
            (Eye::Right, EyeLower3) => RIGHT_EYE_LOWER_3,
            (Eye::Right, EyebrowUpper) => RIGHT_EYEBROW_UPPER,
            (Eye::Right, EyebrowLower) => RIGHT_EYEBROW_LOWER,
        }
    }

    fn is_mirrored(self) -> bool {
        self == Eye::Left
    }
}

/// A contour around an eye that both the face mesh and the iris network estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Contour {
    EyeUpper0,
    EyeUpper1,
    EyeUpper2,
    EyeLower0,
    EyeLower1,
    EyeLower2,
    EyeLower3,
    EyebrowUpper,
    EyebrowLower,
}

impl Contour {
    pub const ALL: [Self; 9] = [
        Self::EyeUpper0,
        Self::EyeUpper1,
        Self::EyeUpper2,
        Self::EyeLower0,
        Self::EyeLower1,
        Self::EyeLower2,
        Self::EyeLower3,
        Self::EyebrowUpper,
        Self::EyebrowLower,
    ];

    /// The eyelid contours closest to the eye.
    pub const EYELIDS: [Self; 2] = [Self::EyeUpper0, Self::EyeLower0];

    /// Returns the range of iris network landmarks that make up this contour.
    pub fn iris_indices(self) -> Range<usize> {
        match self {
            Self::EyeLower0 => 0..9,
            Self::EyeUpper0 => 9..16,
            Self::EyeLower1 => 16..25,
            Self::EyeUpper1 => 25..32,
            Self::EyeLower2 => 32..41,
            Self::EyeUpper2 => 41..48,
            Self::EyebrowLower => 48..54,
            Self::EyeLower3 => 54..63,
            Self::EyebrowUpper => 63..71,
        }
    }
}

/// Decides which mesh landmarks get replaced by iris network landmarks.
///
/// When the head is turned, the eye facing away from the camera is partially occluded and its
/// iris landmarks diverge from the mesh, so only the eyelids of the other eye are replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionPolicy {
    /// Replace all contours of both eyes.
    BothEyes,
    /// Replace only the eyelids of one eye.
    EyelidsOnly(Eye),
}

impl FusionPolicy {
    /// Selects the policy for a mesh with the given left-to-right eye depth difference.
    pub fn select(depth_difference: f32) -> Self {
        if depth_difference.abs() < FRONTAL_DEPTH_DIFFERENCE {
            Self::BothEyes
        } else if depth_difference < 1.0 {
            Self::EyelidsOnly(Eye::Left)
        } else {
            Self::EyelidsOnly(Eye::Right)
        }
    }
}

/// Returns the Z difference between the outer corners of the left and the right eye.
pub fn depth_difference(mesh: &[[f32; 3]]) -> f32 {
    mesh[Eye::Left.corners()[0]][2] - mesh[Eye::Right.corners()[0]][2]
}

/// Computes the region around an eye that is passed to the iris network.
///
/// The returned box is in the same coordinate space as `mesh`.
pub fn eye_box(mesh: &[[f32; 3]], eye: Eye) -> BoundingBox {
    let [a, b] = eye.corners().map(|i| mesh[i]);
    BoundingBox::new(
        [a[0].min(b[0]), a[1].min(b[1])],
        [a[0].max(b[0]), a[1].max(b[1])],
    )
    .enlarge(ENLARGE_EYE_RATIO)
    .squarify()
}

/// Decodes the raw iris network output for one eye into the coordinate space of `eye_box`.
///
/// Z coordinates are passed through unchanged.
pub fn decode_eye(
    data: &[f32],
    eye_box: &BoundingBox,
    eye: Eye,
    crop: Resolution,
) -> Vec<[f32; 3]> {
    let [crop_w, crop_h] = crop.to_f32();
    let [box_w, box_h] = eye_box.size();
    points3(data)
        .map(|[x, y, z]| {
            let rel_x = if eye.is_mirrored() {
                1.0 - x / crop_w
            } else {
                x / crop_w
            };
            [
                rel_x * box_w + eye_box.start[0],
                y / crop_h * box_h + eye_box.start[1],
                z,
            ]
        })
        .collect()
}

/// Overwrites `contours` of `eye` in `mesh` with the corresponding iris network landmarks.
///
/// X and Y are taken from the iris network, Z is averaged between both.
pub fn replace_contours(
    mesh: &mut [[f32; 3]],
    eye_coords: &[[f32; 3]],
    eye: Eye,
    contours: &[Contour],
) {
    for &contour in contours {
        for (&mesh_index, &[x, y, z]) in
            zip_exact(eye.contour(contour), &eye_coords[contour.iris_indices()])
        {
            let point = &mut mesh[mesh_index];
            *point = [x, y, (z + point[2]) / 2.0];
        }
    }
}

/// Returns the iris landmarks of an eye, with Z coordinates taken from the surrounding eyelids.
///
/// The iris network's own Z estimates are unreliable.
pub fn adjusted_iris(mesh: &[[f32; 3]], iris: &[[f32; 3]], eye: Eye) -> Vec<[f32; 3]> {
    let upper_z = mesh[eye.contour(Contour::EyeUpper0)[IRIS_UPPER_CENTER]][2];
    let lower_z = mesh[eye.contour(Contour::EyeLower0)[IRIS_LOWER_CENTER]][2];
    let average_z = (upper_z + lower_z) / 2.0;

    iris.iter()
        .enumerate()
        .map(|(i, &[x, y, _])| {
            let z = match i {
                2 => upper_z,
                4 => lower_z,
                _ => average_z,
            };
            [x, y, z]
        })
        .collect()
}

/// Merges the landmarks of both eyes into `mesh` and appends the iris landmarks (left, then right).
pub fn fuse(mesh: &mut Vec<[f32; 3]>, left: &[[f32; 3]], right: &[[f32; 3]]) {
    let policy = FusionPolicy::select(depth_difference(mesh));
    log::trace!("iris fusion policy: {policy:?}");

    match policy {
        FusionPolicy::BothEyes => {
            replace_contours(mesh, left, Eye::Left, &Contour::ALL);
            replace_contours(mesh, right, Eye::Right, &Contour::ALL);
        }
        FusionPolicy::EyelidsOnly(eye) => {
            let coords = match eye {
                Eye::Left => left,
                Eye::Right => right,
            };
            replace_contours(mesh, coords, eye, &Contour::EYELIDS);
        }
    }

    let left_iris = adjusted_iris(mesh, &left[IRIS_START..], Eye::Left);
    let right_iris = adjusted_iris(mesh, &right[IRIS_START..], Eye::Right);
    mesh.extend(left_iris);
    mesh.extend(right_iris);
}

/// Runs an [`IrisNetwork`] on the eyes of a face crop and merges its results into the face mesh.
pub struct IrisEstimator {
    network: Box<dyn IrisNetwork>,
    t_crop: Timer,
    t_infer: Timer,
}

impl IrisEstimator {
    pub fn new<N: IrisNetwork>(network: N) -> Self {
        Self {
            network: Box::new(network),
            t_crop: Timer::new("eye crop"),
            t_infer: Timer::new("iris"),
        }
    }

    /// Refines the eye landmarks of `mesh` and appends the iris landmarks.
    ///
    /// `face` is the `H x W x 3` face crop that was passed to the face mesh network, and `mesh`
    /// the landmarks estimated on it.
    pub fn refine(
        &self,
        scope: &mut FrameScope<'_>,
        face: ArrayView3<'_, f32>,
        mesh: &mut Vec<[f32; 3]>,
    ) -> anyhow::Result<()> {
        let crop_res = self.network.input_resolution();
        let (face_h, face_w, _) = face.dim();
        let boxes = [eye_box(mesh, Eye::Left), eye_box(mesh, Eye::Right)];

        let mut batch = scope.zeros(Dim([
            2,
            crop_res.height() as usize,
            crop_res.width() as usize,
            3,
        ]));
        self.t_crop.time(|| {
            for (i, (eye, bounds)) in [Eye::Left, Eye::Right].into_iter().zip(&boxes).enumerate() {
                let mut dst = batch.index_axis_mut(Axis(0), i);
                let normalized = bounds.normalize([face_w as f32, face_h as f32]);
                image::crop_and_resize(face, &normalized, dst.view_mut(), 0.0);
                if eye.is_mirrored() {
                    image::flip_left_right(dst);
                }
            }
        });

        let output = self.t_infer.time(|| self.network.infer(batch.view()));
        scope.recycle(batch);
        let output = output?;

        let per_eye = EYE_LANDMARK_COUNT * 3;
        if output.len() != 2 * per_eye {
            bail!(
                "iris network produced {} values, expected {}",
                output.len(),
                2 * per_eye
            );
        }

        let left = decode_eye(&output[..per_eye], &boxes[0], Eye::Left, crop_res);
        let right = decode_eye(&output[per_eye..], &boxes[1], Eye::Right, crop_res);
        fuse(mesh, &left, &right);
        Ok(())
    }

    pub fn timers(&self) -> impl Iterator<Item = &Timer> + '_ {
        [&self.t_crop, &self.t_infer].into_iter()
    }
}

//! Multi-face tracking.
//!
//! Running the face detector on every frame is expensive and produces jittery boxes. Instead, the
//! [`Pipeline`] keeps a list of *regions of interest* (RoIs) in a [`TrackerState`]. Every frame,
//! each RoI is rotated upright, cropped, and passed to the face mesh network, and the resulting
//! landmarks determine the RoI for the next frame. The detector only runs when there is nothing to
//! track, or periodically when fewer faces than requested are being tracked.
//!
//! RoIs are identified by their index in the list. An index is a slot that may be reused by a
//! different face after a detection pass, not a persistent face identity.

use std::fmt;

use anyhow::anyhow;
use meshtrack_geom::{compute_rotation, BoundingBox, Resolution, Transform};
use ndarray::{ArrayView3, Axis, Dim};
use serde::Serialize;

use crate::detection::{FaceDetector, Keypoint};
use crate::image;
use crate::iris::{IrisEstimator, IrisNetwork};
use crate::landmark::{MeshNetwork, LANDMARK_COUNT, MIDWAY_BETWEEN_EYES, MOUTH_CENTER};
use crate::scope::{FrameScope, TensorPool};
use crate::timer::Timer;

/// A freshly detected face replaces the RoI in its slot only if their IoU is below this value.
pub const UPDATE_ROI_IOU_THRESHOLD: f32 = 0.25;

/// Error returned when iris landmarks are requested from a [`Pipeline`] without an iris network.
///
/// This is returned wrapped in an [`anyhow::Error`] and can be recovered with
/// [`anyhow::Error::downcast_ref`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissingIrisModel;

impl fmt::Display for MissingIrisModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("iris landmarks were requested, but no iris model is loaded")
    }
}

impl std::error::Error for MissingIrisModel {}

/// The landmarks an RoI was derived from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RoiLandmarks {
    /// Keypoints of a face detection, in image pixels.
    Sparse(Vec<[f32; 2]>),
    /// Face mesh landmarks of the previous frame, in image pixels.
    Dense(Vec<[f32; 3]>),
}

impl RoiLandmarks {
    /// Returns two landmarks on the vertical line of symmetry of the face: one on the mouth, and
    /// one above it.
    pub fn symmetry_line(&self) -> Option<([f32; 2], [f32; 2])> {
        match self {
            Self::Sparse(keypoints) => Some((
                *keypoints.get(Keypoint::Mouth as usize)?,
                *keypoints.get(Keypoint::Nose as usize)?,
            )),
            Self::Dense(mesh) => {
                let [mx, my, _] = *mesh.get(MOUTH_CENTER)?;
                let [tx, ty, _] = *mesh.get(MIDWAY_BETWEEN_EYES)?;
                Some(([mx, my], [tx, ty]))
            }
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Sparse(lms) => lms.len(),
            Self::Dense(lms) => lms.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A tracked face region, in image pixels.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionOfInterest {
    pub bounds: BoundingBox,
    pub landmarks: RoiLandmarks,
}

impl RegionOfInterest {
    /// Returns the rotation in radians that turns the face in this region upright.
    ///
    /// Returns 0 if the landmarks needed to compute the rotation are missing.
    pub fn rotation(&self) -> f32 {
        self.landmarks
            .symmetry_line()
            .map_or(0.0, |(lower, upper)| compute_rotation(lower, upper))
    }
}

/// Configuration of a [`Pipeline`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineConfig {
    /// Frames processed without running the detector while fewer than `max_faces` are tracked.
    pub max_continuous_checks: u32,
    /// Maximum number of faces to track.
    pub max_faces: usize,
    /// Face flag below which a tracked face is dropped.
    pub detection_confidence: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_continuous_checks: 5,
            max_faces: 10,
            detection_confidence: 0.9,
        }
    }
}

impl PipelineConfig {
    /// Sets how many frames may be processed without running the detector while fewer than
    /// `max_faces` faces are tracked.
    pub fn max_continuous_checks(self, max_continuous_checks: u32) -> Self {
        Self {
            max_continuous_checks,
            ..self
        }
    }

    /// Sets the maximum number of faces to track.
    pub fn max_faces(self, max_faces: usize) -> Self {
        Self { max_faces, ..self }
    }

    /// Sets the face flag value below which a face is considered lost.
    pub fn detection_confidence(self, detection_confidence: f32) -> Self {
        Self {
            detection_confidence,
            ..self
        }
    }
}

/// Tracking state carried from one frame to the next.
#[derive(Debug, Clone, Default)]
pub struct TrackerState {
    regions: Vec<RegionOfInterest>,
    runs_without_detection: u32,
}

impl TrackerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the currently tracked regions.
    pub fn regions(&self) -> &[RegionOfInterest] {
        &self.regions
    }

    /// Returns the number of frames processed since the detector last ran.
    pub fn runs_without_detection(&self) -> u32 {
        self.runs_without_detection
    }

    /// Forgets all tracked faces, so that the next frame runs the detector.
    pub fn clear(&mut self) {
        self.regions.clear();
    }

    /// Decides whether the detector has to run on the next frame.
    pub fn should_run_full_detection(&self, config: &PipelineConfig) -> bool {
        let count = self.regions.len();
        if count == 0 {
            return true;
        }
        if config.max_faces == 1 {
            return false;
        }
        count != config.max_faces && self.runs_without_detection >= config.max_continuous_checks
    }

    /// Merges the results of a detection pass into the tracked regions.
    ///
    /// Candidate `i` replaces the RoI in slot `i` unless the two overlap by at least
    /// [`UPDATE_ROI_IOU_THRESHOLD`], in which case the tracked RoI is kept. Slots beyond the number
    /// of candidates are dropped.
    pub fn update_regions_of_interest(&mut self, candidates: Vec<RegionOfInterest>) {
        let count = candidates.len();
        for (i, candidate) in candidates.into_iter().enumerate() {
            match self.regions.get_mut(i) {
                Some(current) => {
                    let iou = current.bounds.iou(&candidate.bounds);
                    if iou < UPDATE_ROI_IOU_THRESHOLD {
                        log::trace!("replacing RoI {i} (IoU {iou})");
                        *current = candidate;
                    }
                }
                None => self.regions.push(candidate),
            }
        }
        self.regions.truncate(count);
    }

    /// Removes the RoI in slot `index`, shifting later slots down.
    ///
    /// Does nothing if there is no such slot.
    pub fn clear_region(&mut self, index: usize) {
        if index < self.regions.len() {
            self.regions.remove(index);
        }
    }
}

/// Landmarks of a tracked face, computed by [`Pipeline::predict`].
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// Landmarks in pixels of the face mesh network input.
    pub raw_coords: Vec<[f32; 3]>,
    /// Landmarks in image pixels.
    pub scaled_coords: Vec<[f32; 3]>,
    /// Enlarged bounding box of `scaled_coords`.
    pub bounds: BoundingBox,
    /// Probability that the region contains a face.
    pub face_flag: f32,
}

/// Detects and tracks faces, and computes their landmarks.
pub struct Pipeline {
    detector: FaceDetector,
    refiner: Refiner,
    config: PipelineConfig,
    pool: TensorPool,
}

struct Refiner {
    mesh: Box<dyn MeshNetwork>,
    iris: Option<IrisEstimator>,
    t_rotate: Timer,
    t_crop: Timer,
    t_mesh: Timer,
}

impl Pipeline {
    pub fn new<M: MeshNetwork>(detector: FaceDetector, mesh: M, config: PipelineConfig) -> Self {
        Self {
            detector,
            refiner: Refiner {
                mesh: Box::new(mesh),
                iris: None,
                t_rotate: Timer::new("rotate"),
                t_crop: Timer::new("crop"),
                t_mesh: Timer::new("mesh"),
            },
            config,
            pool: TensorPool::new(),
        }
    }

    /// Adds an iris network, enabling iris landmark prediction.
    pub fn with_iris<I: IrisNetwork>(mut self, iris: I) -> Self {
        self.refiner.iris = Some(IrisEstimator::new(iris));
        self
    }

    pub fn has_iris(&self) -> bool {
        self.refiner.iris.is_some()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn tensor_pool(&self) -> &TensorPool {
        &self.pool
    }

    /// Returns the resolution of the face crops passed to the mesh network.
    pub fn mesh_resolution(&self) -> Resolution {
        self.refiner.mesh.input_resolution()
    }

    /// Decides whether the next call to [`Pipeline::predict`] will run the face detector.
    pub fn should_run_full_detection(&self, state: &TrackerState) -> bool {
        state.should_run_full_detection(&self.config)
    }

    /// Processes a frame.
    ///
    /// `frame` is an `H x W x 3` image with color values in `0.0..=255.0`. Returns one
    /// [`Prediction`] per tracked face. All predictions are returned, but faces whose face flag is
    /// below the configured detection confidence are removed from `state` afterwards.
    ///
    /// If no faces are detected, `state` is cleared and an empty list is returned. If an error is
    /// returned, `state` is left unchanged.
    pub fn predict(
        &mut self,
        state: &mut TrackerState,
        frame: ArrayView3<'_, f32>,
        predict_irises: bool,
    ) -> anyhow::Result<Vec<Prediction>> {
        if predict_irises && self.refiner.iris.is_none() {
            return Err(MissingIrisModel.into());
        }

        let mut scope = self.pool.scope();

        // `state` is only updated once the whole frame has been processed successfully.
        let mut next = state.clone();
        if next.should_run_full_detection(&self.config) {
            let detections = self.detector.detect(&mut scope, frame)?;
            log::debug!(
                "ran detector after {} frames, {} faces",
                next.runs_without_detection,
                detections.len()
            );
            if detections.is_empty() {
                state.regions.clear();
                return Ok(Vec::new());
            }

            let scale = detections.scale_factor();
            let candidates = detections
                .iter()
                .map(|det| RegionOfInterest {
                    bounds: det
                        .bounds()
                        .scale(scale)
                        .enlarge(BoundingBox::DEFAULT_ENLARGE_FACTOR)
                        .squarify(),
                    landmarks: RoiLandmarks::Sparse(
                        det.keypoints()
                            .iter()
                            .map(|&[x, y]| [x * scale[0], y * scale[1]])
                            .collect(),
                    ),
                })
                .collect();
            next.update_regions_of_interest(candidates);
            next.runs_without_detection = 0;
        } else {
            next.runs_without_detection = next.runs_without_detection.saturating_add(1);
        }

        let mut predictions = Vec::with_capacity(next.regions.len());
        for roi in &mut next.regions {
            let (prediction, next_roi) =
                self.refiner.refine(&mut scope, frame, roi, predict_irises)?;
            *roi = next_roi;
            predictions.push(prediction);
        }

        for (i, prediction) in predictions.iter().enumerate().rev() {
            if prediction.face_flag < self.config.detection_confidence {
                log::trace!("lost face {i} (face flag {})", prediction.face_flag);
                next.clear_region(i);
            }
        }

        *state = next;
        Ok(predictions)
    }

    pub fn timers(&self) -> impl Iterator<Item = &Timer> + '_ {
        let refiner = &self.refiner;
        self.detector
            .timers()
            .chain([&refiner.t_rotate, &refiner.t_crop, &refiner.t_mesh])
            .chain(refiner.iris.iter().flat_map(|iris| iris.timers()))
    }
}

impl Refiner {
    /// Computes the landmarks of the face in `roi` and the RoI to use in the next frame.
    fn refine(
        &self,
        scope: &mut FrameScope<'_>,
        frame: ArrayView3<'_, f32>,
        roi: &RegionOfInterest,
        predict_irises: bool,
    ) -> anyhow::Result<(Prediction, RegionOfInterest)> {
        let (frame_h, frame_w, _) = frame.dim();
        let frame_dims = [frame_w as f32, frame_h as f32];
        let mesh_res = self.mesh.input_resolution();

        let angle = roi.rotation();
        let center = roi.bounds.center();
        let (rotated, rotation) = if angle != 0.0 {
            let mut rotated = scope.zeros(frame.raw_dim());
            let center_normalized = [center[0] / frame_dims[0], center[1] / frame_dims[1]];
            self.t_rotate.time(|| {
                image::rotate_with_offset(frame, angle, 0.0, center_normalized, rotated.view_mut())
            });
            (Some(rotated), Transform::rotation_about(-angle, center))
        } else {
            (None, Transform::identity())
        };

        let mut face = scope.zeros(Dim([
            1,
            mesh_res.height() as usize,
            mesh_res.width() as usize,
            3,
        ]));
        self.t_crop.time(|| {
            let source = match &rotated {
                Some(rotated) => rotated.view(),
                None => frame.view(),
            };
            let mut dst = face.index_axis_mut(Axis(0), 0);
            image::crop_and_resize(source, &roi.bounds.normalize(frame_dims), dst.view_mut(), 0.0);
            image::map_range(dst, 0.0..=1.0);
        });

        let estimate = self.t_mesh.time(|| self.mesh.infer(face.view()));
        let landmarks = estimate.and_then(|estimate| {
            let mut raw = estimate.points(LANDMARK_COUNT)?;
            if predict_irises {
                if let Some(iris) = &self.iris {
                    iris.refine(scope, face.index_axis(Axis(0), 0), &mut raw)?;
                }
            }
            Ok((raw, estimate.face_flag))
        });
        scope.recycle(face);
        if let Some(rotated) = rotated {
            scope.recycle(rotated);
        }
        let (raw_coords, face_flag) = landmarks?;

        let scaled_coords =
            transform_raw_coords(&raw_coords, &roi.bounds, angle, &rotation, mesh_res);
        let bounds = BoundingBox::bounding(scaled_coords.iter())
            .ok_or_else(|| anyhow!("face mesh network returned no landmarks"))?
            .enlarge(BoundingBox::DEFAULT_ENLARGE_FACTOR);

        let next_roi = RegionOfInterest {
            bounds: bounds.squarify(),
            landmarks: RoiLandmarks::Dense(scaled_coords.clone()),
        };
        let prediction = Prediction {
            raw_coords,
            scaled_coords,
            bounds,
            face_flag,
        };
        Ok((prediction, next_roi))
    }
}

/// Maps landmarks from face crop pixels back to image pixels.
///
/// `bounds` is the RoI the crop was taken from, `angle` the rotation that was applied to the image
/// before cropping, and `rotation` the transform that rotated the image. Z coordinates are kept.
pub fn transform_raw_coords(
    raw: &[[f32; 3]],
    bounds: &BoundingBox,
    angle: f32,
    rotation: &Transform,
    mesh: Resolution,
) -> Vec<[f32; 3]> {
    let [box_w, box_h] = bounds.size();
    let [mesh_w, mesh_h] = mesh.to_f32();
    let [scale_x, scale_y] = [box_w / mesh_w, box_h / mesh_h];

    let coords_rotation = Transform::rotation(angle);
    let [cx, cy] = rotation.invert().apply(bounds.center());

    raw.iter()
        .map(|&[x, y, z]| {
            let [rx, ry] = coords_rotation
                .rotate_vector([scale_x * (x - mesh_w / 2.0), scale_y * (y - mesh_h / 2.0)]);
            [rx + cx, ry + cy, z]
        })
        .collect()
}

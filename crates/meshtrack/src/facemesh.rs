//! Per-frame face mesh API.
//!
//! [`FaceMesh`] owns a [`Pipeline`] and its [`TrackerState`], accepts frames in several formats,
//! and converts the pipeline's results into plain data with named landmark groups.

use std::collections::BTreeMap;

use anyhow::bail;
use ndarray::{Array2, ArrayView3, Axis, CowArray, Ix3};
use serde::Serialize;

use crate::detection::{DetectorConfig, DetectorNetwork, FaceDetector};
use crate::image;
use crate::iris::IrisNetwork;
use crate::landmark::{annotations, MeshNetwork};
use crate::pipeline::{Pipeline, PipelineConfig, Prediction, TrackerState};
use crate::timer::Timer;

pub use crate::pipeline::MissingIrisModel;

/// Configuration of a [`FaceMesh`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FaceMeshConfig {
    pipeline: PipelineConfig,
    detector: DetectorConfig,
}

impl FaceMeshConfig {
    /// Sets how many frames may be processed without running the detector while fewer than
    /// `max_faces` faces are tracked (default: 5).
    pub fn max_continuous_checks(self, max_continuous_checks: u32) -> Self {
        Self {
            pipeline: self.pipeline.max_continuous_checks(max_continuous_checks),
            ..self
        }
    }

    /// Sets the face flag value below which a tracked face is dropped (default: 0.9).
    pub fn detection_confidence(self, detection_confidence: f32) -> Self {
        Self {
            pipeline: self.pipeline.detection_confidence(detection_confidence),
            ..self
        }
    }

    /// Sets the maximum number of faces to detect and track (default: 10).
    pub fn max_faces(self, max_faces: usize) -> Self {
        Self {
            pipeline: self.pipeline.max_faces(max_faces),
            detector: self.detector.max_faces(max_faces),
        }
    }

    /// Sets the IoU above which overlapping detections are suppressed (default: 0.3).
    pub fn iou_threshold(self, iou_threshold: f32) -> Self {
        Self {
            detector: self.detector.iou_threshold(iou_threshold),
            ..self
        }
    }

    /// Sets the confidence a detection has to exceed to be tracked (default: 0.75).
    pub fn score_threshold(self, score_threshold: f32) -> Self {
        Self {
            detector: self.detector.score_threshold(score_threshold),
            ..self
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        self.pipeline
    }

    pub fn detector_config(&self) -> DetectorConfig {
        self.detector
    }
}

/// A frame passed to [`FaceMesh::estimate_faces`].
#[derive(Debug, Clone, Copy)]
pub enum FrameInput<'a> {
    /// Packed 8-bit RGB or RGBA pixels, row by row.
    Pixels {
        width: u32,
        height: u32,
        data: &'a [u8],
    },
    /// A decoded image.
    Image(&'a ::image::RgbImage),
    /// An `H x W x 3` tensor with color values in `0.0..=255.0`.
    Tensor(ArrayView3<'a, f32>),
}

impl<'a> FrameInput<'a> {
    /// Converts the frame to an image tensor, copying only if necessary.
    pub fn to_tensor(&self) -> anyhow::Result<CowArray<'a, f32, Ix3>> {
        Ok(match *self {
            Self::Pixels {
                width,
                height,
                data,
            } => image::from_pixels(width, height, data)?.into(),
            Self::Image(img) => image::from_rgb_image(img).into(),
            Self::Tensor(view) => {
                let (h, w, c) = view.dim();
                if c != 3 || h == 0 || w == 0 {
                    bail!("expected a HxWx3 image tensor, got {h}x{w}x{c}");
                }
                view.into()
            }
        })
    }
}

/// Options for a call to [`FaceMesh::estimate_faces`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EstimateOptions {
    /// Mirror all results horizontally, for example for mirrored webcam previews.
    pub flip_horizontal: bool,
    /// Run the iris network and append the iris landmarks to the mesh.
    pub predict_irises: bool,
    /// Return [`FaceTensors`] instead of [`FacePrediction`]s.
    pub return_tensors: bool,
}

impl Default for EstimateOptions {
    fn default() -> Self {
        Self {
            flip_horizontal: false,
            predict_irises: true,
            return_tensors: false,
        }
    }
}

/// Corners of a face's bounding box, in image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoxCorners {
    pub top_left: [f32; 2],
    pub bottom_right: [f32; 2],
}

impl BoxCorners {
    fn flip_horizontal(&mut self, width: f32) {
        self.top_left[0] = width - 1.0 - self.top_left[0];
        self.bottom_right[0] = width - 1.0 - self.bottom_right[0];
    }
}

/// A face with its landmarks.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FacePrediction {
    /// Probability that the tracked region contains a face.
    pub face_in_view_confidence: f32,
    pub bounding_box: BoxCorners,
    /// Landmarks in pixels of the face mesh network input.
    pub mesh: Vec<[f32; 3]>,
    /// Landmarks in image pixels.
    pub scaled_mesh: Vec<[f32; 3]>,
    /// Named groups of `scaled_mesh` landmarks (see [`annotations::MESH_ANNOTATIONS`]).
    pub annotations: BTreeMap<&'static str, Vec<[f32; 3]>>,
}

/// A face with its landmarks stored in `N x 3` arrays.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceTensors {
    pub face_in_view_confidence: f32,
    pub bounding_box: BoxCorners,
    pub mesh: Array2<f32>,
    pub scaled_mesh: Array2<f32>,
}

/// A result of [`FaceMesh::estimate_faces`].
#[derive(Debug, Clone, PartialEq)]
pub enum AnnotatedPrediction {
    Values(FacePrediction),
    Tensors(FaceTensors),
}

impl AnnotatedPrediction {
    pub fn face_in_view_confidence(&self) -> f32 {
        match self {
            Self::Values(p) => p.face_in_view_confidence,
            Self::Tensors(t) => t.face_in_view_confidence,
        }
    }

    pub fn bounding_box(&self) -> BoxCorners {
        match self {
            Self::Values(p) => p.bounding_box,
            Self::Tensors(t) => t.bounding_box,
        }
    }

    pub fn as_values(&self) -> Option<&FacePrediction> {
        match self {
            Self::Values(p) => Some(p),
            Self::Tensors(_) => None,
        }
    }

    pub fn as_tensors(&self) -> Option<&FaceTensors> {
        match self {
            Self::Values(_) => None,
            Self::Tensors(t) => Some(t),
        }
    }
}

fn flip_points(points: &mut [[f32; 3]], width: f32) {
    for p in points {
        p[0] = width - 1.0 - p[0];
    }
}

/// Tracks faces across the frames of a video.
pub struct FaceMesh {
    pipeline: Pipeline,
    state: TrackerState,
}

impl FaceMesh {
    /// Creates a face tracker from a BlazeFace detector and a face mesh network.
    pub fn new<D, M>(detector: D, mesh: M, config: FaceMeshConfig) -> Self
    where
        D: DetectorNetwork,
        M: MeshNetwork,
    {
        Self::with_detector(FaceDetector::new(detector, config.detector), mesh, config)
    }

    /// Creates a face tracker from an existing [`FaceDetector`].
    ///
    /// The detector's configuration is replaced with the one in `config`.
    pub fn with_detector<M: MeshNetwork>(
        mut detector: FaceDetector,
        mesh: M,
        config: FaceMeshConfig,
    ) -> Self {
        detector.set_config(config.detector);
        Self {
            pipeline: Pipeline::new(detector, mesh, config.pipeline),
            state: TrackerState::new(),
        }
    }

    /// Adds an iris network, which is required for [`EstimateOptions::predict_irises`].
    pub fn with_iris<I: IrisNetwork>(self, iris: I) -> Self {
        Self {
            pipeline: self.pipeline.with_iris(iris),
            ..self
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Returns the tracking state carried over to the next frame.
    pub fn state(&self) -> &TrackerState {
        &self.state
    }

    /// Forgets all tracked faces.
    pub fn reset(&mut self) {
        self.state = TrackerState::new();
    }

    /// Estimates the faces in a frame.
    ///
    /// Frames must be passed in order, and should all have the same size. Faces whose
    /// `face_in_view_confidence` is below the configured detection confidence are still returned,
    /// but are no longer tracked.
    ///
    /// # Errors
    ///
    /// Returns an error wrapping [`MissingIrisModel`] if irises are requested but no iris network
    /// was provided, and forwards errors from input conversion and the networks.
    pub fn estimate_faces(
        &mut self,
        input: FrameInput<'_>,
        options: &EstimateOptions,
    ) -> anyhow::Result<Vec<AnnotatedPrediction>> {
        if options.predict_irises && !self.pipeline.has_iris() {
            return Err(MissingIrisModel.into());
        }

        let frame = input.to_tensor()?;
        let width = frame.len_of(Axis(1)) as f32;
        let predictions = self
            .pipeline
            .predict(&mut self.state, frame.view(), options.predict_irises)?;

        Ok(predictions
            .into_iter()
            .map(|prediction| {
                if options.return_tensors {
                    AnnotatedPrediction::Tensors(to_tensors(prediction, options, width))
                } else {
                    AnnotatedPrediction::Values(to_values(prediction, options, width))
                }
            })
            .collect())
    }

    pub fn timers(&self) -> impl Iterator<Item = &Timer> + '_ {
        self.pipeline.timers()
    }
}

/// Splits a prediction into its parts, applying the horizontal flip if requested.
fn unpack(
    prediction: Prediction,
    options: &EstimateOptions,
    width: f32,
) -> (BoxCorners, Vec<[f32; 3]>, Vec<[f32; 3]>, f32) {
    let Prediction {
        mut raw_coords,
        mut scaled_coords,
        bounds,
        face_flag,
    } = prediction;
    let mut corners = BoxCorners {
        top_left: bounds.start,
        bottom_right: bounds.end,
    };

    if options.flip_horizontal {
        corners.flip_horizontal(width);
        flip_points(&mut raw_coords, width);
        flip_points(&mut scaled_coords, width);
    }
    (corners, raw_coords, scaled_coords, face_flag)
}

fn to_values(prediction: Prediction, options: &EstimateOptions, width: f32) -> FacePrediction {
    let (bounding_box, mesh, scaled_mesh, face_flag) = unpack(prediction, options, width);
    let annotations = annotations::available(scaled_mesh.len())
        .filter(|(name, _)| options.predict_irises || !annotations::is_iris_group(name))
        .map(|(name, indices)| (name, indices.iter().map(|&i| scaled_mesh[i]).collect()))
        .collect();

    FacePrediction {
        face_in_view_confidence: face_flag,
        bounding_box,
        mesh,
        scaled_mesh,
        annotations,
    }
}

fn to_tensors(prediction: Prediction, options: &EstimateOptions, width: f32) -> FaceTensors {
    let (bounding_box, mesh, scaled_mesh, face_flag) = unpack(prediction, options, width);
    FaceTensors {
        face_in_view_confidence: face_flag,
        bounding_box,
        mesh: Array2::from(mesh),
        scaled_mesh: Array2::from(scaled_mesh),
    }
}

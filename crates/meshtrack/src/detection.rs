//! Face detection.
//!
//! [`FaceDetector`] runs a BlazeFace-style single shot detector on a whole frame: the frame is
//! resized to the network input, the network's per-anchor outputs are decoded into boxes and
//! keypoints, and overlapping detections are removed with [`nms::NonMaxSuppression`].

pub mod anchors;
pub mod decode;
pub mod nms;

use meshtrack_geom::{BoundingBox, Resolution};
use ndarray::{Array2, ArrayView3, ArrayView4, Axis, Dim};
use serde::{Deserialize, Serialize};

use crate::image;
use crate::num::sigmoid;
use crate::scope::{FrameScope, TensorPool};
use crate::timer::Timer;

use self::anchors::{Anchor, AnchorLayer, Anchors, BLAZEFACE_LAYERS};
use self::nms::NonMaxSuppression;

/// Trait implemented by neural networks that detect faces in an image.
pub trait DetectorNetwork: Send + Sync + 'static {
    /// Returns the size of the images the network expects.
    fn input_resolution(&self) -> Resolution;

    /// Runs the network.
    ///
    /// `input` has shape `[1, height, width, 3]`, with color values mapped to `-1.0..=1.0`. The
    /// output must contain one row per anchor, laid out as described in [`decode`].
    fn infer(&self, input: ArrayView4<'_, f32>) -> anyhow::Result<Array2<f32>>;
}

/// The keypoints located by BlazeFace, in output order.
///
/// "Left" and "right" are from the perspective of the person in the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keypoint {
    RightEye = 0,
    LeftEye = 1,
    Nose = 2,
    Mouth = 3,
    RightEar = 4,
    LeftEar = 5,
}

/// A detected face.
///
/// All coordinates are in pixels of the detector's input image. [`Detections::scale_factor`] maps
/// them to the original frame.
#[derive(Debug, Clone)]
pub struct Detection {
    confidence: f32,
    bounds: BoundingBox,
    keypoints: Vec<[f32; 2]>,
    anchor: Anchor,
    anchor_index: usize,
}

impl Detection {
    /// Returns the detection confidence in range `0.0..=1.0`.
    #[inline]
    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    #[inline]
    pub fn bounds(&self) -> BoundingBox {
        self.bounds
    }

    #[inline]
    pub fn keypoints(&self) -> &[[f32; 2]] {
        &self.keypoints
    }

    pub fn keypoint(&self, keypoint: Keypoint) -> Option<[f32; 2]> {
        self.keypoints.get(keypoint as usize).copied()
    }

    /// Returns the anchor this detection was predicted relative to.
    #[inline]
    pub fn anchor(&self) -> Anchor {
        self.anchor
    }

    /// Returns the index of the anchor in the detector's anchor list.
    #[inline]
    pub fn anchor_index(&self) -> usize {
        self.anchor_index
    }
}

/// The result of running a [`FaceDetector`] on a frame.
#[derive(Debug, Clone)]
pub struct Detections {
    detections: Vec<Detection>,
    scale_factor: [f32; 2],
}

impl Detections {
    /// Returns the per-axis factors mapping detector input coordinates to frame coordinates.
    #[inline]
    pub fn scale_factor(&self) -> [f32; 2] {
        self.scale_factor
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    /// Returns the detections, highest confidence first.
    pub fn iter(&self) -> std::slice::Iter<'_, Detection> {
        self.detections.iter()
    }
}

impl<'a> IntoIterator for &'a Detections {
    type Item = &'a Detection;
    type IntoIter = std::slice::Iter<'a, Detection>;

    fn into_iter(self) -> Self::IntoIter {
        self.detections.iter()
    }
}

/// Detector parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorConfig {
    /// Maximum number of faces to detect.
    pub max_faces: usize,
    /// IoU above which overlapping detections are suppressed.
    pub iou_threshold: f32,
    /// Confidence a detection has to exceed to be reported.
    pub score_threshold: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            max_faces: NonMaxSuppression::DEFAULT_MAX_OUTPUTS,
            iou_threshold: NonMaxSuppression::DEFAULT_IOU_THRESH,
            score_threshold: NonMaxSuppression::DEFAULT_SCORE_THRESH,
        }
    }
}

impl DetectorConfig {
    /// Sets the maximum number of faces to detect.
    pub fn max_faces(self, max_faces: usize) -> Self {
        Self { max_faces, ..self }
    }

    /// Sets the IoU above which overlapping detections are suppressed.
    pub fn iou_threshold(self, iou_threshold: f32) -> Self {
        Self {
            iou_threshold,
            ..self
        }
    }

    /// Sets the confidence a detection has to exceed to be reported.
    pub fn score_threshold(self, score_threshold: f32) -> Self {
        Self {
            score_threshold,
            ..self
        }
    }
}

/// A face, as returned by [`FaceDetector::estimate_faces`].
///
/// Coordinates are in pixels of the frame passed to the detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub top_left: [f32; 2],
    pub bottom_right: [f32; 2],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub landmarks: Option<Vec<[f32; 2]>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probability: Option<f32>,
}

impl DetectedFace {
    /// Mirrors all coordinates around the vertical center line of an image `width` pixels wide.
    #[must_use]
    pub fn flip_horizontal(mut self, width: f32) -> Self {
        let flip = |p: &mut [f32; 2]| p[0] = width - 1.0 - p[0];
        flip(&mut self.top_left);
        flip(&mut self.bottom_right);
        if let Some(landmarks) = &mut self.landmarks {
            landmarks.iter_mut().for_each(flip);
        }
        self
    }
}

/// A face detector wrapping a [`DetectorNetwork`].
pub struct FaceDetector {
    core: DetectorCore,
    pool: TensorPool,
}

struct DetectorCore {
    network: Box<dyn DetectorNetwork>,
    anchors: Anchors,
    nms: NonMaxSuppression,
    t_resize: Timer,
    t_infer: Timer,
    t_nms: Timer,
}

impl FaceDetector {
    /// Creates a detector for a network with the BlazeFace front camera anchor layout.
    pub fn new<N: DetectorNetwork>(network: N, config: DetectorConfig) -> Self {
        Self::with_layers(network, BLAZEFACE_LAYERS, config)
    }

    /// Creates a detector for a network with a custom anchor layout.
    pub fn with_layers<N: DetectorNetwork>(
        network: N,
        layers: &[AnchorLayer],
        config: DetectorConfig,
    ) -> Self {
        let anchors = Anchors::generate(network.input_resolution(), layers);
        log::debug!(
            "face detector with {} input, {} anchors",
            network.input_resolution(),
            anchors.len()
        );

        let mut this = Self {
            core: DetectorCore {
                network: Box::new(network),
                anchors,
                nms: NonMaxSuppression::new(),
                t_resize: Timer::new("resize"),
                t_infer: Timer::new("detect"),
                t_nms: Timer::new("nms"),
            },
            pool: TensorPool::new(),
        };
        this.set_config(config);
        this
    }

    pub fn set_config(&mut self, config: DetectorConfig) {
        let nms = &mut self.core.nms;
        nms.set_max_outputs(config.max_faces);
        nms.set_iou_thresh(config.iou_threshold);
        nms.set_score_thresh(config.score_threshold);
    }

    pub fn input_resolution(&self) -> Resolution {
        self.core.network.input_resolution()
    }

    pub fn anchors(&self) -> &Anchors {
        &self.core.anchors
    }

    /// Detects faces in `frame`, drawing scratch space from `scope`.
    ///
    /// `frame` is an `H x W x 3` image with color values in `0.0..=255.0`.
    pub fn detect(
        &mut self,
        scope: &mut FrameScope<'_>,
        frame: ArrayView3<'_, f32>,
    ) -> anyhow::Result<Detections> {
        self.core.detect(scope, frame)
    }

    /// Detects faces in `frame` and returns them in frame coordinates.
    ///
    /// If `annotate_boxes` is `true`, the returned faces include keypoints and confidence. If
    /// `flip_horizontal` is `true`, all coordinates are mirrored horizontally, which is useful
    /// for mirrored camera previews.
    pub fn estimate_faces(
        &mut self,
        frame: ArrayView3<'_, f32>,
        flip_horizontal: bool,
        annotate_boxes: bool,
    ) -> anyhow::Result<Vec<DetectedFace>> {
        let width = frame.len_of(Axis(1)) as f32;
        let mut scope = self.pool.scope();
        let detections = self.core.detect(&mut scope, frame)?;
        let [sx, sy] = detections.scale_factor();

        let faces = detections
            .iter()
            .map(|det| {
                let bounds = det.bounds().scale([sx, sy]);
                let mut face = DetectedFace {
                    top_left: bounds.start,
                    bottom_right: bounds.end,
                    landmarks: None,
                    probability: None,
                };
                if annotate_boxes {
                    face.landmarks = Some(
                        det.keypoints()
                            .iter()
                            .map(|&[x, y]| [x * sx, y * sy])
                            .collect(),
                    );
                    face.probability = Some(det.confidence());
                }
                if flip_horizontal {
                    face = face.flip_horizontal(width);
                }
                face
            })
            .collect();
        Ok(faces)
    }

    pub fn timers(&self) -> impl Iterator<Item = &Timer> + '_ {
        [&self.core.t_resize, &self.core.t_infer, &self.core.t_nms].into_iter()
    }
}

impl DetectorCore {
    fn detect(
        &mut self,
        scope: &mut FrameScope<'_>,
        frame: ArrayView3<'_, f32>,
    ) -> anyhow::Result<Detections> {
        let input_res = self.network.input_resolution();
        let (frame_h, frame_w, _) = frame.dim();

        let mut input = scope.zeros(Dim([
            1,
            input_res.height() as usize,
            input_res.width() as usize,
            3,
        ]));
        self.t_resize.time(|| {
            let mut image = input.index_axis_mut(Axis(0), 0);
            image::resize_bilinear(frame, image.view_mut());
            image::map_range(image, -1.0..=1.0);
        });

        let raw = self.t_infer.time(|| self.network.infer(input.view()));
        scope.recycle(input);
        let raw = raw?;

        let boxes = decode::decode_boxes(raw.view(), &self.anchors, input_res)?;
        let scores = raw.column(0).iter().map(|&logit| sigmoid(logit)).collect::<Vec<_>>();

        let anchors = &self.anchors;
        let nms = &mut self.nms;
        let detections = self.t_nms.time(|| {
            nms.process(&boxes, &scores)
                .map(|index| Detection {
                    confidence: scores[index],
                    bounds: boxes[index],
                    keypoints: decode::decode_keypoints(raw.row(index), &anchors[index]),
                    anchor: anchors[index],
                    anchor_index: index,
                })
                .collect::<Vec<_>>()
        });
        log::trace!("{} faces detected", detections.len());

        Ok(Detections {
            detections,
            scale_factor: [
                frame_w as f32 / input_res.width() as f32,
                frame_h as f32 / input_res.height() as f32,
            ],
        })
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use ndarray::Array3;

    use super::*;
    use crate::test::FixedDetector;

    fn detector(rows: Vec<Vec<f32>>) -> FaceDetector {
        // 16x16 input with a single anchor at (8, 8).
        FaceDetector::with_layers(
            FixedDetector::new(Resolution::new(16, 16), rows),
            &[AnchorLayer::new(16, 1)],
            DetectorConfig::default(),
        )
    }

    fn row(logit: f32) -> Vec<f32> {
        let mut row = vec![logit, 1.0, -2.0, 4.0, 6.0];
        // Keypoints: right eye, left eye, nose, mouth, right ear, left ear
        row.extend([-2.0, -2.0, 2.0, -2.0, 0.0, 0.0, 0.0, 2.0, -4.0, -1.0, 4.0, -1.0]);
        row
    }

    #[test]
    fn detects_and_scales() {
        let mut det = detector(vec![row(5.0)]);
        let frame = Array3::from_elem((32, 64, 3), 255.0);
        let mut pool = TensorPool::new();
        let mut scope = pool.scope();
        let detections = det.detect(&mut scope, frame.view()).unwrap();

        assert_eq!(detections.len(), 1);
        assert_eq!(detections.scale_factor(), [4.0, 2.0]);
        let d = detections.iter().next().unwrap();
        assert_relative_eq!(d.confidence(), sigmoid(5.0));
        assert_relative_eq!(d.bounds(), BoundingBox::new([7.0, 3.0], [11.0, 9.0]), epsilon = 1e-5);
        assert_eq!(d.keypoint(Keypoint::Mouth), Some([8.0, 10.0]));
        assert_eq!(d.anchor_index(), 0);
        assert_eq!(d.anchor().center(), [8.0, 8.0]);
    }

    #[test]
    fn low_confidence_is_dropped() {
        let mut det = detector(vec![row(0.0)]);
        let frame = Array3::zeros((16, 16, 3));
        let faces = det.estimate_faces(frame.view(), false, true).unwrap();
        assert!(faces.is_empty());
    }

    #[test]
    fn estimate_faces_annotates_and_flips() {
        let mut det = detector(vec![row(5.0)]);
        let frame = Array3::zeros((32, 32, 3));

        let plain = det.estimate_faces(frame.view(), false, false).unwrap();
        assert_eq!(plain.len(), 1);
        assert_relative_eq!(plain[0].top_left[0], 14.0, epsilon = 1e-4);
        assert_relative_eq!(plain[0].bottom_right[1], 18.0, epsilon = 1e-4);
        assert_eq!(plain[0].landmarks, None);
        assert_eq!(plain[0].probability, None);

        let annotated = det.estimate_faces(frame.view(), false, true).unwrap();
        let landmarks = annotated[0].landmarks.as_ref().unwrap();
        assert_eq!(landmarks.len(), 6);
        assert_eq!(landmarks[Keypoint::Nose as usize], [16.0, 16.0]);

        let flipped = det.estimate_faces(frame.view(), true, true).unwrap();
        assert_relative_eq!(flipped[0].top_left[0], 31.0 - 14.0, epsilon = 1e-4);
        assert_eq!(
            flipped[0].landmarks.as_ref().unwrap()[Keypoint::Nose as usize],
            [15.0, 16.0]
        );
    }

    #[test]
    fn network_input_is_signed() {
        let network = FixedDetector::new(Resolution::new(16, 16), vec![row(5.0)]);
        let inputs = network.input_log();
        let mut det =
            FaceDetector::with_layers(network, &[AnchorLayer::new(16, 1)], Default::default());

        let frame = Array3::from_elem((16, 16, 3), 255.0);
        det.estimate_faces(frame.view(), false, false).unwrap();
        let frame = Array3::zeros((8, 8, 3));
        det.estimate_faces(frame.view(), false, false).unwrap();

        let inputs = inputs.lock().unwrap();
        assert_eq!(inputs.len(), 2);
        assert_relative_eq!(inputs[0][0], 1.0, epsilon = 1e-5);
        assert_relative_eq!(inputs[0][1], 1.0, epsilon = 1e-5);
        assert_relative_eq!(inputs[1][0], -1.0, epsilon = 1e-5);
        assert_relative_eq!(inputs[1][1], -1.0, epsilon = 1e-5);
    }
}

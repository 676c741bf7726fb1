//! Non-Maximum Suppression.
//!
//! Single-Shot MultiBox Detectors (SSD) produce many overlapping detections for each object.
//! Non-Maximum Suppression (NMS) filters these duplicates out, leaving only the detection with the
//! highest confidence for each object.

use std::cmp::Reverse;

use meshtrack_geom::BoundingBox;

use crate::num::TotalF32;

/// A greedy non-maximum suppression algorithm.
///
/// Candidates are visited in order of descending score (candidates with equal scores keep their
/// original order). A candidate is kept unless it overlaps an already kept box by more than the
/// IoU threshold. Candidates whose score does not exceed the score threshold are never kept.
#[derive(Debug, Clone)]
pub struct NonMaxSuppression {
    iou_thresh: f32,
    score_thresh: f32,
    max_outputs: usize,
    order: Vec<usize>,
    kept: Vec<usize>,
}

impl NonMaxSuppression {
    /// The default intersection-over-union threshold used to determine if two detections overlap.
    pub const DEFAULT_IOU_THRESH: f32 = 0.3;

    /// The default minimum score of a detection.
    pub const DEFAULT_SCORE_THRESH: f32 = 0.75;

    /// The default number of detections to keep at most.
    pub const DEFAULT_MAX_OUTPUTS: usize = 10;

    pub fn new() -> Self {
        Self {
            iou_thresh: Self::DEFAULT_IOU_THRESH,
            score_thresh: Self::DEFAULT_SCORE_THRESH,
            max_outputs: Self::DEFAULT_MAX_OUTPUTS,
            order: Vec::new(),
            kept: Vec::new(),
        }
    }

    /// Sets the intersection-over-union threshold above which two detections are considered to
    /// overlap.
    pub fn set_iou_thresh(&mut self, iou_thresh: f32) {
        self.iou_thresh = iou_thresh;
    }

    /// Sets the score a detection has to exceed to be kept.
    pub fn set_score_thresh(&mut self, score_thresh: f32) {
        self.score_thresh = score_thresh;
    }

    /// Sets the maximum number of detections to keep.
    pub fn set_max_outputs(&mut self, max_outputs: usize) {
        self.max_outputs = max_outputs;
    }

    /// Performs non-maximum suppression.
    ///
    /// `boxes` and `scores` describe the candidates and must have the same length. Returns the
    /// indices of the kept candidates, highest score first.
    ///
    /// # Panics
    ///
    /// Panics if `boxes` and `scores` have different lengths.
    pub fn process(
        &mut self,
        boxes: &[BoundingBox],
        scores: &[f32],
    ) -> impl ExactSizeIterator<Item = usize> + '_ {
        assert_eq!(boxes.len(), scores.len(), "every box needs a score");

        self.order.clear();
        self.kept.clear();

        self.order
            .extend((0..scores.len()).filter(|&i| scores[i] > self.score_thresh));
        // Stable sort, so that equal scores keep their original (anchor) order.
        self.order.sort_by_key(|&i| Reverse(TotalF32(scores[i])));

        for &candidate in &self.order {
            if self.kept.len() >= self.max_outputs {
                break;
            }

            let suppressed = self
                .kept
                .iter()
                .any(|&kept| boxes[kept].iou(&boxes[candidate]) > self.iou_thresh);
            if !suppressed {
                self.kept.push(candidate);
            }
        }

        self.kept.iter().copied()
    }
}

impl Default for NonMaxSuppression {
    fn default() -> Self {
        Self::new()
    }
}

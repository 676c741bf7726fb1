//! Decoding of raw SSD regression outputs.
//!
//! Every output row of the detector belongs to one anchor and has the layout
//! `[logit, dx, dy, w, h, kp0x, kp0y, kp1x, kp1y, ...]`: a confidence logit, the box center's
//! offset from the anchor, the box size, and keypoint offsets from the anchor. All values are in
//! pixels of the network input.

use anyhow::bail;
use itertools::Itertools;
use meshtrack_geom::{BoundingBox, Resolution};
use ndarray::{s, ArrayView1, ArrayView2};

use super::anchors::{Anchor, Anchors};

/// Number of leading box parameters in each output row (logit, center offset, size).
pub const BOX_PARAMS: usize = 5;

/// Checks that a raw output tensor has one row per anchor and room for box parameters.
///
/// Returns the number of keypoints encoded in each row.
pub fn check_output_shape(raw: &ArrayView2<'_, f32>, anchors: &Anchors) -> anyhow::Result<usize> {
    let (rows, cols) = raw.dim();
    if rows != anchors.len() {
        bail!(
            "detector produced {rows} output rows, but there are {} anchors",
            anchors.len()
        );
    }
    if cols < BOX_PARAMS || (cols - BOX_PARAMS) % 2 != 0 {
        bail!("detector output rows have unexpected length {cols}");
    }

    Ok((cols - BOX_PARAMS) / 2)
}

/// Decodes the bounding box of every anchor.
///
/// Returns one box per anchor, in anchor order, in pixels of the network input.
pub fn decode_boxes(
    raw: ArrayView2<'_, f32>,
    anchors: &Anchors,
    input: Resolution,
) -> anyhow::Result<Vec<BoundingBox>> {
    check_output_shape(&raw, anchors)?;

    let [in_w, in_h] = input.to_f32();
    let boxes = raw
        .rows()
        .into_iter()
        .zip(anchors.iter())
        .map(|(row, anchor)| {
            let cx = (anchor.x_center() + row[1]) / in_w;
            let cy = (anchor.y_center() + row[2]) / in_h;
            let w = row[3] / in_w;
            let h = row[4] / in_h;

            BoundingBox::new([cx - w / 2.0, cy - h / 2.0], [cx + w / 2.0, cy + h / 2.0])
                .scale([in_w, in_h])
        })
        .collect();
    Ok(boxes)
}

/// Decodes the keypoints stored in an output row, as absolute positions in the network input.
pub fn decode_keypoints(row: ArrayView1<'_, f32>, anchor: &Anchor) -> Vec<[f32; 2]> {
    row.slice(s![BOX_PARAMS..])
        .iter()
        .tuples()
        .map(|(x, y)| [anchor.x_center() + x, anchor.y_center() + y])
        .collect()
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use ndarray::Array2;

    use super::super::anchors::AnchorLayer;
    use super::*;

    #[test]
    fn single_anchor_box() {
        let res = Resolution::new(16, 16);
        let anchors = Anchors::generate(res, &[AnchorLayer::new(16, 1)]);
        assert_eq!(anchors[0].center(), [8.0, 8.0]);

        let row = vec![3.0, 1.0, -2.0, 4.0, 6.0, 0.5, 0.5, -1.0, 2.0];
        let raw = Array2::from_shape_vec((1, 9), row).unwrap();
        let boxes = decode_boxes(raw.view(), &anchors, res).unwrap();
        assert_eq!(boxes.len(), 1);
        // Center (9, 6), size 4x6.
        assert_relative_eq!(boxes[0], BoundingBox::new([7.0, 3.0], [11.0, 9.0]), epsilon = 1e-5);

        let kps = decode_keypoints(raw.row(0), &anchors[0]);
        assert_eq!(kps, [[8.5, 8.5], [7.0, 10.0]]);
    }

    #[test]
    fn shape_mismatch() {
        let res = Resolution::new(16, 16);
        let anchors = Anchors::generate(res, &[AnchorLayer::new(8, 1)]);
        let raw = Array2::<f32>::zeros((3, 5));
        assert!(decode_boxes(raw.view(), &anchors, res).is_err());

        let raw = Array2::<f32>::zeros((4, 6));
        assert!(decode_boxes(raw.view(), &anchors, res).is_err());

        let raw = Array2::<f32>::zeros((4, 17));
        assert_eq!(check_output_shape(&raw.view(), &anchors).unwrap(), 6);
    }
}

//! Anchor generation for Single Shot MultiBox Detectors (SSDs).
//!
//! An SSD outputs one set of box parameters per *anchor*: a fixed point on the input image that
//! the predicted box is relative to. Anchors are laid out on a grid per output layer, with several
//! anchors per grid cell.
//!
//! The order of the generated anchors matches the order of the network's output rows: layers in
//! the order given, then rows (Y), then columns (X), then anchors within a cell.

use std::ops::Index;

use meshtrack_geom::Resolution;

/// An anchor of an SSD network, in pixels of the network input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Anchor {
    x_center: f32,
    y_center: f32,
}

impl Anchor {
    #[inline]
    pub fn x_center(&self) -> f32 {
        self.x_center
    }

    #[inline]
    pub fn y_center(&self) -> f32 {
        self.y_center
    }

    #[inline]
    pub fn center(&self) -> [f32; 2] {
        [self.x_center, self.y_center]
    }
}

/// Describes an output layer of an SSD network.
#[derive(Debug, Clone, Copy)]
pub struct AnchorLayer {
    /// Size of a feature map cell, in input pixels.
    stride: u32,
    /// Number of anchors per feature map cell.
    anchors_per_cell: u32,
}

impl AnchorLayer {
    /// Creates a new layer description.
    ///
    /// # Panics
    ///
    /// Panics if `stride` or `anchors_per_cell` is 0.
    pub const fn new(stride: u32, anchors_per_cell: u32) -> Self {
        assert!(stride != 0);
        assert!(anchors_per_cell != 0);
        Self {
            stride,
            anchors_per_cell,
        }
    }

    #[inline]
    pub fn stride(&self) -> u32 {
        self.stride
    }

    #[inline]
    pub fn anchors_per_cell(&self) -> u32 {
        self.anchors_per_cell
    }
}

/// The anchor layout of the BlazeFace front camera model (128x128 input).
pub const BLAZEFACE_LAYERS: &[AnchorLayer] = &[AnchorLayer::new(8, 2), AnchorLayer::new(16, 6)];

/// The full list of anchors of a network.
#[derive(Debug, Clone, PartialEq)]
pub struct Anchors {
    anchors: Vec<Anchor>,
}

impl Anchors {
    /// Computes the anchors for a network with the given input resolution and output layers.
    pub fn generate(input: Resolution, layers: &[AnchorLayer]) -> Self {
        let mut anchors = Vec::new();

        for layer in layers {
            let rows = (input.height() + layer.stride - 1) / layer.stride;
            let cols = (input.width() + layer.stride - 1) / layer.stride;
            let stride = layer.stride as f32;

            for y in 0..rows {
                for x in 0..cols {
                    let x_center = stride * (x as f32 + 0.5);
                    let y_center = stride * (y as f32 + 0.5);
                    for _ in 0..layer.anchors_per_cell {
                        anchors.push(Anchor { x_center, y_center });
                    }
                }
            }
        }

        Self { anchors }
    }

    /// Returns the total number of anchors.
    #[inline]
    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = &Anchor> + '_ {
        self.anchors.iter()
    }
}

impl Index<usize> for Anchors {
    type Output = Anchor;

    fn index(&self, index: usize) -> &Anchor {
        &self.anchors[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blazeface_anchor_count() {
        let anchors = Anchors::generate(Resolution::new(128, 128), BLAZEFACE_LAYERS);
        // 16*16*2 + 8*8*6
        assert_eq!(anchors.len(), 896);
        assert_eq!(anchors[0].center(), [4.0, 4.0]);
        assert_eq!(anchors[1].center(), [4.0, 4.0]);
        assert_eq!(anchors[2].center(), [12.0, 4.0]);
        // First anchor of the second row.
        assert_eq!(anchors[32].center(), [4.0, 12.0]);
        // First anchor of the second layer.
        assert_eq!(anchors[512].center(), [8.0, 8.0]);
        assert_eq!(anchors[895].center(), [120.0, 120.0]);
    }

    #[test]
    fn grid_rounds_up() {
        let anchors = Anchors::generate(Resolution::new(20, 10), &[AnchorLayer::new(8, 1)]);
        // ceil(20 / 8) = 3 columns, ceil(10 / 8) = 2 rows
        assert_eq!(anchors.len(), 6);
        assert_eq!(anchors[2].center(), [20.0, 4.0]);
        assert_eq!(anchors[3].center(), [4.0, 12.0]);
    }

    #[test]
    fn deterministic() {
        let layers = [AnchorLayer::new(4, 3), AnchorLayer::new(16, 1)];
        let res = Resolution::new(64, 48);
        assert_eq!(
            Anchors::generate(res, &layers),
            Anchors::generate(res, &layers)
        );
    }
}

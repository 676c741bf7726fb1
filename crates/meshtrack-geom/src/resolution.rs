use std::fmt;

/// Resolution (`width x height`) of an image or a neural network input.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    width: u32,
    height: u32,
}

impl Resolution {
    /// Creates a new [`Resolution`] of `width x height`.
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Returns the width of this [`Resolution`].
    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Returns the height of this [`Resolution`].
    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn num_pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Returns `[width, height]` as floats, the form used when scaling coordinates.
    #[inline]
    pub fn to_f32(&self) -> [f32; 2] {
        [self.width as f32, self.height as f32]
    }

    /// Computes the per-axis factors that map coordinates in `self` to coordinates in `target`.
    pub fn scale_to(&self, target: Resolution) -> [f32; 2] {
        [
            target.width as f32 / self.width as f32,
            target.height as f32 / self.height as f32,
        ]
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl fmt::Debug for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_factors() {
        let model = Resolution::new(128, 128);
        assert_eq!(model.scale_to(Resolution::new(640, 480)), [5.0, 3.75]);
        assert_eq!(format!("{model}"), "128x128");
    }
}

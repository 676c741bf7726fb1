//! Image tensor operations.
//!
//! Images are stored as `H x W x C` tensors of `f32` color values (usually RGB, `C = 3`). Frames
//! enter the crate with values in `0.0..=255.0`; each network applies its own value mapping after
//! sampling.
//!
//! All operations write into a caller-provided output tensor, which lets the pipeline draw its
//! scratch space from a [`crate::scope::FrameScope`].

use anyhow::bail;
use meshtrack_geom::BoundingBox;
use ndarray::{s, Array3, ArrayView3, ArrayViewMut3, Axis, Zip};

/// Converts a packed 8-bit pixel buffer into an RGB image tensor.
///
/// `data` must contain `width * height` pixels with 3 (RGB) or 4 (RGBA) channels each. An alpha
/// channel is discarded.
pub fn from_pixels(width: u32, height: u32, data: &[u8]) -> anyhow::Result<Array3<f32>> {
    let (w, h) = (width as usize, height as usize);
    let pixels = w * h;
    if pixels == 0 {
        bail!("invalid frame size {width}x{height}");
    }

    let channels = match data.len() / pixels {
        3 | 4 if data.len() % pixels == 0 => data.len() / pixels,
        _ => bail!(
            "pixel buffer of length {} doesn't match a {width}x{height} RGB or RGBA image",
            data.len()
        ),
    };

    let rgb = data
        .chunks_exact(channels)
        .flat_map(|px| [px[0], px[1], px[2]])
        .map(f32::from)
        .collect::<Vec<_>>();
    Ok(Array3::from_shape_vec((h, w, 3), rgb)?)
}

/// Converts a decoded RGB image into an image tensor.
pub fn from_rgb_image(image: &::image::RgbImage) -> Array3<f32> {
    let (w, h) = image.dimensions();
    Array3::from_shape_fn((h as usize, w as usize, 3), |(y, x, c)| {
        f32::from(image.get_pixel(x as u32, y as u32)[c])
    })
}

/// Resizes `src` to the size of `dst` with bilinear interpolation.
///
/// Output pixel `(x, y)` samples the source at `(x * in_w / out_w, y * in_h / out_h)`, without
/// aligning corners or shifting to pixel centers.
pub fn resize_bilinear(src: ArrayView3<'_, f32>, mut dst: ArrayViewMut3<'_, f32>) {
    let (in_h, in_w, _) = src.dim();
    let (out_h, out_w, _) = dst.dim();
    if in_h == 0 || in_w == 0 {
        dst.fill(0.0);
        return;
    }

    let scale_y = in_h as f32 / out_h as f32;
    let scale_x = in_w as f32 / out_w as f32;

    for y in 0..out_h {
        let (y0, y1, dy) = lerp_indices(y as f32 * scale_y, in_h);
        for x in 0..out_w {
            let (x0, x1, dx) = lerp_indices(x as f32 * scale_x, in_w);
            sample_bilinear(&src, [y0, y1], [x0, x1], dy, dx, dst.slice_mut(s![y, x, ..]));
        }
    }
}

fn lerp_indices(pos: f32, len: usize) -> (usize, usize, f32) {
    let lo = pos.floor();
    let hi = (pos.ceil() as usize).min(len - 1);
    (lo as usize, hi, pos - lo)
}

fn sample_bilinear(
    src: &ArrayView3<'_, f32>,
    [y0, y1]: [usize; 2],
    [x0, x1]: [usize; 2],
    dy: f32,
    dx: f32,
    out: ndarray::ArrayViewMut1<'_, f32>,
) {
    let tl = src.slice(s![y0, x0, ..]);
    let tr = src.slice(s![y0, x1, ..]);
    let bl = src.slice(s![y1, x0, ..]);
    let br = src.slice(s![y1, x1, ..]);
    Zip::from(out)
        .and(&tl)
        .and(&tr)
        .and(&bl)
        .and(&br)
        .for_each(|out, &tl, &tr, &bl, &br| {
            let top = tl + (tr - tl) * dx;
            let bottom = bl + (br - bl) * dx;
            *out = top + (bottom - top) * dy;
        });
}

/// Crops the region `normalized` out of `src` and resizes it to the size of `dst`.
///
/// `normalized` is given in coordinates relative to the image size (`0.0..=1.0` covers the whole
/// image, but regions may extend past the image borders). Samples that fall outside of `src` are
/// set to `extrapolation_value`.
///
/// The region's corners are mapped to the centers of the edge pixels of `dst`, matching the
/// `crop_and_resize` operation found in common tensor libraries.
pub fn crop_and_resize(
    src: ArrayView3<'_, f32>,
    normalized: &BoundingBox,
    mut dst: ArrayViewMut3<'_, f32>,
    extrapolation_value: f32,
) {
    let (in_h, in_w, _) = src.dim();
    let (out_h, out_w, _) = dst.dim();
    if in_h == 0 || in_w == 0 {
        dst.fill(extrapolation_value);
        return;
    }

    let [x1, y1] = normalized.start;
    let [x2, y2] = normalized.end;
    let (max_y, max_x) = ((in_h - 1) as f32, (in_w - 1) as f32);

    let axis_mapping = |start: f32, end: f32, max: f32, out_len: usize| {
        if out_len > 1 {
            (start * max, (end - start) * max / (out_len - 1) as f32)
        } else {
            (0.5 * (start + end) * max, 0.0)
        }
    };
    let (y_base, y_step) = axis_mapping(y1, y2, max_y, out_h);
    let (x_base, x_step) = axis_mapping(x1, x2, max_x, out_w);

    for y in 0..out_h {
        let in_y = y_base + y as f32 * y_step;
        if in_y < 0.0 || in_y > max_y {
            dst.slice_mut(s![y, .., ..]).fill(extrapolation_value);
            continue;
        }
        let (y0, y1, dy) = lerp_indices(in_y, in_h);

        for x in 0..out_w {
            let in_x = x_base + x as f32 * x_step;
            if in_x < 0.0 || in_x > max_x {
                dst.slice_mut(s![y, x, ..]).fill(extrapolation_value);
                continue;
            }
            let (x0, x1, dx) = lerp_indices(in_x, in_w);
            sample_bilinear(&src, [y0, y1], [x0, x1], dy, dx, dst.slice_mut(s![y, x, ..]));
        }
    }
}

/// Rotates `src` by `radians` around `center` and writes the result into `dst`.
///
/// `center` is given relative to the image size (`[0.5, 0.5]` is the middle of the image).
/// Nearest-neighbor sampling is used, and pixels that would be sampled from outside of `src` are
/// set to `fill_value`. `dst` must have the same size as `src`.
///
/// The output pixel at `p` is sampled from `c + R(radians) * (p - c)`, so the image content
/// appears rotated by `-radians` in the output.
pub fn rotate_with_offset(
    src: ArrayView3<'_, f32>,
    radians: f32,
    fill_value: f32,
    center: [f32; 2],
    mut dst: ArrayViewMut3<'_, f32>,
) {
    debug_assert_eq!(src.dim(), dst.dim());
    let (h, w, _) = src.dim();
    let cx = w as f32 * center[0];
    let cy = h as f32 * center[1];
    let (sin, cos) = radians.sin_cos();

    for row in 0..h {
        for col in 0..w {
            let (dx, dy) = (col as f32 - cx, row as f32 - cy);
            // Round half up.
            let src_x = ((dx * cos - dy * sin) + cx + 0.5).floor();
            let src_y = ((dx * sin + dy * cos) + cy + 0.5).floor();

            let mut out = dst.slice_mut(s![row, col, ..]);
            if src_x >= 0.0 && src_x < w as f32 && src_y >= 0.0 && src_y < h as f32 {
                out.assign(&src.slice(s![src_y as usize, src_x as usize, ..]));
            } else {
                out.fill(fill_value);
            }
        }
    }
}

/// Mirrors an image horizontally in place.
pub fn flip_left_right(mut image: ArrayViewMut3<'_, f32>) {
    let w = image.len_of(Axis(1));
    for x in 0..w / 2 {
        let (left, right) = image.multi_slice_mut((s![.., x, ..], s![.., w - 1 - x, ..]));
        Zip::from(left)
            .and(right)
            .for_each(|l, r| std::mem::swap(l, r));
    }
}

/// Maps color values from `0.0..=255.0` to `target` in place.
pub fn map_range(mut image: ArrayViewMut3<'_, f32>, target: std::ops::RangeInclusive<f32>) {
    let (start, end) = (*target.start(), *target.end());
    let scale = (end - start) / 255.0;
    image.mapv_inplace(|v| v * scale + start);
}

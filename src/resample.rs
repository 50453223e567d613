//! Resampling and smoothing of float maps before they are turned into pixels.

use ndarray::{Array2, Array3, Array4, ArrayView2, ArrayView3, Axis};

use crate::convolutions::conv2d;
use crate::error::Result;
use crate::Padding;

fn nearest_index(dst: usize, src_len: usize, dst_len: usize) -> usize {
    let scale = src_len as f64 / dst_len as f64;
    ((dst as f64 * scale).floor() as usize).min(src_len - 1)
}

/// Nearest-neighbour resize. Keeps the blocky per-unit boundaries of small
/// activation maps.
pub fn resize_nearest(map: ArrayView2<f32>, height: usize, width: usize) -> Array2<f32> {
    let (src_h, src_w) = map.dim();
    if src_h == 0 || src_w == 0 {
        return Array2::zeros((height, width));
    }
    Array2::from_shape_fn((height, width), |(y, x)| {
        map[[nearest_index(y, src_h, height), nearest_index(x, src_w, width)]]
    })
}

/// Source sample pair and weight of the second sample, pixel centres aligned.
fn linear_taps(dst: usize, src_len: usize, dst_len: usize) -> (usize, usize, f32) {
    let scale = src_len as f64 / dst_len as f64;
    let pos = (dst as f64 + 0.5) * scale - 0.5;
    let mut left = pos.floor();
    let mut frac = pos - left;
    if left < 0.0 {
        left = 0.0;
        frac = 0.0;
    }
    let left = left as usize;
    if left >= src_len - 1 {
        return (src_len - 1, src_len - 1, 0.0);
    }
    (left, left + 1, frac as f32)
}

/// Bilinear resize of every channel of a `(C, H, W)` tensor.
pub fn resize_bilinear(tensor: ArrayView3<f32>, height: usize, width: usize) -> Array3<f32> {
    let (channels, src_h, src_w) = tensor.dim();
    if src_h == 0 || src_w == 0 {
        return Array3::zeros((channels, height, width));
    }
    let rows: Vec<_> = (0..height).map(|y| linear_taps(y, src_h, height)).collect();
    let cols: Vec<_> = (0..width).map(|x| linear_taps(x, src_w, width)).collect();
    Array3::from_shape_fn((channels, height, width), |(c, y, x)| {
        let (y0, y1, fy) = rows[y];
        let (x0, x1, fx) = cols[x];
        let top = tensor[[c, y0, x0]] * (1.0 - fx) + tensor[[c, y0, x1]] * fx;
        let bottom = tensor[[c, y1, x0]] * (1.0 - fx) + tensor[[c, y1, x1]] * fx;
        top * (1.0 - fy) + bottom * fy
    })
}

/// Index into `0..len` mirrored about the edge samples (`dcb|abcd|cba`).
fn reflect_101(index: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let last = len as isize - 1;
    let period = 2 * last;
    let mut i = index.rem_euclid(period);
    if i > last {
        i = period - i;
    }
    i as usize
}

/// Normalized 1-d Gaussian taps for `sigma`; the window spans four sigmas
/// on each side.
pub fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let size = (((sigma * 8.0 + 1.0).round() as usize) | 1).max(1);
    let radius = (size / 2) as f32;
    let two_sigma_sq = 2.0 * sigma * sigma;
    let taps: Vec<f32> = (0..size)
        .map(|i| {
            let d = i as f32 - radius;
            (-d * d / two_sigma_sq).exp()
        })
        .collect();
    let total: f32 = taps.iter().sum();
    taps.into_iter().map(|t| t / total).collect()
}

/// Separable Gaussian blur with mirrored borders. Both passes run through
/// the im2col convolution.
pub fn gaussian_blur(map: ArrayView2<f32>, sigma: f32) -> Result<Array2<f32>> {
    if !(sigma > 0.0) || map.is_empty() {
        return Ok(map.to_owned());
    }
    let taps = gaussian_kernel(sigma);
    let radius = taps.len() / 2;
    let (height, width) = map.dim();

    let vertical = Array4::from_shape_vec((1, 1, taps.len(), 1), taps.clone())?;
    let padded = Array3::from_shape_fn((1, height + 2 * radius, width), |(_, y, x)| {
        map[[reflect_101(y as isize - radius as isize, height), x]]
    });
    let pass = conv2d(vertical.view(), None, padded.view(), Padding::Valid, 1)?;

    let horizontal = Array4::from_shape_vec((1, 1, 1, taps.len()), taps)?;
    let padded = Array3::from_shape_fn((1, height, width + 2 * radius), |(_, y, x)| {
        pass[[0, y, reflect_101(x as isize - radius as isize, width)]]
    });
    let pass = conv2d(horizontal.view(), None, padded.view(), Padding::Valid, 1)?;
    Ok(pass.index_axis_move(Axis(0), 0))
}

/// `(C, H, W)` → `(H, W)` Euclidean norm across channels.
pub fn channel_norm(tensor: ArrayView3<f32>) -> Array2<f32> {
    tensor
        .map_axis(Axis(0), |pixel| pixel.iter().map(|v| v * v).sum::<f32>().sqrt())
}

/// `(C, H, W)` → `(H, W)` mean across channels.
pub fn channel_mean(tensor: ArrayView3<f32>) -> Array2<f32> {
    match tensor.mean_axis(Axis(0)) {
        Some(mean) => mean,
        None => Array2::zeros((tensor.len_of(Axis(1)), tensor.len_of(Axis(2)))),
    }
}

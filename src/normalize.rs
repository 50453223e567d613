//! Value normalizers shared by the thumbnail and detail renderers.
//!
//! All of them survive flat and non-finite input: a constant tensor maps to
//! the middle of the output range and NaN / inf samples count as zero.

use ndarray::{Array, ArrayBase, Data, Dimension};

/// Mid-gray of an 8-bit channel.
pub const MID_GRAY: u8 = 128;

fn finite_or_zero(v: f32) -> f32 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

/// Minimum and maximum over the finite-sanitized values, `None` when empty.
pub fn min_max<S, D>(data: &ArrayBase<S, D>) -> Option<(f32, f32)>
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    if data.is_empty() {
        return None;
    }
    Some(data.iter().map(|&v| finite_or_zero(v)).fold(
        (f32::INFINITY, f32::NEG_INFINITY),
        |(lo, hi), v| (lo.min(v), hi.max(v)),
    ))
}

/// Stretches `data` onto [0, 1]. A flat input becomes 0.5 everywhere.
pub fn norm01<S, D>(data: &ArrayBase<S, D>, epsilon: f32) -> Array<f32, D>
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    match min_max(data) {
        Some((lo, hi)) if hi > lo => {
            let range = hi - lo + epsilon;
            data.mapv(|v| ((finite_or_zero(v) - lo) / range).clamp(0.0, 1.0))
        }
        _ => data.mapv(|_| 0.5),
    }
}

/// Maps `data` onto [0, 255] keeping zero at mid-gray, so positive and
/// negative values stay distinguishable:
/// `255 * (0.5 + x / (2 * max(|max|, |min|) + eps))`.
pub fn centered_normalize<S, D>(data: &ArrayBase<S, D>, epsilon: f32) -> Array<u8, D>
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    match min_max(data) {
        Some((lo, hi)) if hi > lo => {
            let scale = 2.0 * hi.abs().max(lo.abs()) + epsilon;
            data.mapv(|v| to_u8(255.0 * (0.5 + finite_or_zero(v) / scale)))
        }
        _ => data.mapv(|_| MID_GRAY),
    }
}

/// Layer-wide min-max onto the display range [0, 255]. Flat layers come out
/// at mid-gray.
pub fn display_normalize<S, D>(data: &ArrayBase<S, D>) -> Array<f32, D>
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    match min_max(data) {
        Some((lo, hi)) if hi > lo => {
            let range = hi - lo;
            data.mapv(|v| (finite_or_zero(v) - lo) / range * 255.0)
        }
        _ => data.mapv(|_| f32::from(MID_GRAY)),
    }
}

/// Rounds and saturates onto a byte.
pub fn to_u8(v: f32) -> u8 {
    finite_or_zero(v).round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2, Array2};

    #[test]
    fn centered_keeps_zero_at_mid_gray() {
        let data = arr1(&[-3.0f32, 0.0, 1.0, 2.0]);
        let out = centered_normalize(&data, 1e-10);
        assert_eq!(out[1], 128);
        assert_eq!(out[0], 0);
        assert_eq!(out[2], 170);
    }

    #[test]
    fn centered_positive_max_reaches_white() {
        let data = arr2(&[[0.5f32, 1.0], [2.0, 4.0]]);
        let out = centered_normalize(&data, 1e-10);
        assert_eq!(out[[1, 1]], 255);
        assert_eq!(out[[0, 0]], 143);
    }

    #[test]
    fn flat_inputs_give_mid_values() {
        let zeros = Array2::<f32>::zeros((3, 3));
        assert!(centered_normalize(&zeros, 1e-10).iter().all(|&v| v == MID_GRAY));
        assert!(norm01(&zeros, 1e-10).iter().all(|&v| v == 0.5));
        let constant = Array2::<f32>::from_elem((2, 2), 7.5);
        assert!(centered_normalize(&constant, 1e-10).iter().all(|&v| v == MID_GRAY));
        assert!(display_normalize(&constant).iter().all(|&v| v == 128.0));
    }

    #[test]
    fn non_finite_values_never_escape() {
        let data = arr1(&[f32::NAN, 1.0, f32::INFINITY, -1.0]);
        let unit = norm01(&data, 1e-10);
        assert!(unit.iter().all(|v| v.is_finite()));
        assert_abs_diff_eq!(unit[0], 0.5, epsilon = 1e-6);
        let bytes = centered_normalize(&data, 1e-10);
        assert_eq!(bytes[0], 128);
        assert_eq!(bytes[2], 128);
    }

    #[test]
    fn display_range_spans_bytes() {
        let data = arr1(&[2.0f32, 4.0, 6.0]);
        let out = display_normalize(&data);
        assert_abs_diff_eq!(out[0], 0.0);
        assert_abs_diff_eq!(out[1], 127.5);
        assert_abs_diff_eq!(out[2], 255.0);
    }
}

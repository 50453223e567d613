//! Transposed convolutions (also called deconvolution layers). The backward
//! projections of the reference backend use them to carry a unit's signal
//! from a convolution's output back to its input.
//!
//! More can be read here:
//! - <https://datascience.stackexchange.com/questions/6107/what-are-deconvolutional-layers>
//! - <https://github.com/akutzer/numpy_cnn/blob/master/CNN/Layer/TransposedConv.py>
use ndarray::*;
use num_traits::Float;

use crate::convolutions::{add_bias, get_padding_size, im2col, incompatible, ConvolutionLayer};
use crate::error::Result;
use crate::Padding;

impl<F: 'static + Float + std::ops::AddAssign> ConvolutionLayer<F> {
    /// Maps a signal shaped like this layer's output back onto an input of
    /// `height` x `width`. This is the adjoint of [`ConvolutionLayer::convolve`]
    /// without the bias.
    pub fn transposed_convolve_to(
        &self,
        signal: ArrayView3<F>,
        height: usize,
        width: usize,
    ) -> Result<Array3<F>> {
        let (_, _, kernel_h, kernel_w) = self.kernel.dim();
        let full = conv_transpose2d(self.kernel.view(), None, signal, Padding::Valid, self.stride)?;
        let (pad_top, pad_left) = match self.padding {
            Padding::Same => {
                let (_, _, top, _, left, _) =
                    get_padding_size(height, width, self.stride, kernel_h, kernel_w);
                (top, left)
            }
            Padding::Valid => (0, 0),
        };

        // `full` lives in padded input coordinates; cut the real input out of
        // it. Rows the forward pass never read stay zero.
        let (channels, full_h, full_w) = full.dim();
        let rows = height.min(full_h.saturating_sub(pad_top));
        let cols = width.min(full_w.saturating_sub(pad_left));
        let mut output = Array3::zeros((channels, height, width));
        output
            .slice_mut(s![.., ..rows, ..cols])
            .assign(&full.slice(s![.., pad_top..pad_top + rows, pad_left..pad_left + cols]));
        Ok(output)
    }
}

/// Performs a transposed convolution on `signal` `(C, H, W)`. This upsamples
/// the signal.
///
/// NOTE: the kernel is laid out `(C, F, HH, WW)`, i.e. the *forward*
/// convolution's kernel, so passing a layer's weights computes the gradient
/// of that layer with respect to its input.
///
/// Output is `(F, (H - 1) * stride + HH, (W - 1) * stride + WW)` for
/// `Padding::Valid`; `Padding::Same` crops it to `(F, H * stride, W * stride)`.
pub fn conv_transpose2d<F: 'static + Float + std::ops::AddAssign>(
    kernel: ArrayView4<F>,
    bias: Option<&Array1<F>>,
    signal: ArrayView3<F>,
    padding: Padding,
    stride: usize,
) -> Result<Array3<F>> {
    let (kernel_channels, num_filters, kernel_h, kernel_w) = kernel.dim();
    let (channels, height, width) = signal.dim();
    if stride == 0 || kernel_channels != channels || height == 0 || width == 0 {
        return Err(incompatible());
    }

    // Spread the signal out by `stride` and pad by the kernel size minus one,
    // so a stride-1 correlation with the flipped kernel scatters every sample
    // over its receptive field.
    let dilated_h = (height - 1) * stride + 1;
    let dilated_w = (width - 1) * stride + 1;
    let pad_h = kernel_h - 1;
    let pad_w = kernel_w - 1;
    let mut padded = Array3::zeros((channels, dilated_h + 2 * pad_h, dilated_w + 2 * pad_w));
    padded
        .slice_mut(s![
            ..,
            pad_h..pad_h + dilated_h;stride,
            pad_w..pad_w + dilated_w;stride
        ])
        .assign(&signal);

    // FLIP: filter row `f` holds kernel[c, f] rotated by 180 degrees.
    let window = kernel_h * kernel_w;
    let filter_col = Array2::from_shape_fn((num_filters, channels * window), |(f, idx)| {
        let (c, r) = (idx / window, idx % window);
        kernel[[c, f, kernel_h - 1 - r / kernel_w, kernel_w - 1 - r % kernel_w]]
    });

    let new_h = dilated_h + kernel_h - 1;
    let new_w = dilated_w + kernel_w - 1;
    // NOTE: the kernel strides across the padded signal at 1 regardless of `stride`
    let im_col = im2col(padded.view(), kernel_h, kernel_w, 1);
    let mul = im_col.dot(&filter_col.t());
    let full = mul
        .into_shape((new_h, new_w, num_filters))?
        .permuted_axes([2, 0, 1]);

    let mut output = match padding {
        Padding::Same => {
            let (_, _, top, _, left, _) =
                get_padding_size(height * stride, width * stride, stride, kernel_h, kernel_w);
            full.slice(s![
                ..,
                top..top + height * stride,
                left..left + width * stride
            ])
            .as_standard_layout()
            .into_owned()
        }
        Padding::Valid => full.as_standard_layout().into_owned(),
    };
    add_bias(&mut output, bias)?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convolutions::conv2d;
    use approx::assert_abs_diff_eq;

    fn ramp(shape: (usize, usize, usize, usize), scale: f32) -> Array4<f32> {
        Array::from_shape_fn(shape, |(a, b, c, d)| {
            ((a * 7 + b * 5 + c * 3 + d) % 11) as f32 * scale - 1.0
        })
    }

    fn inner(a: &Array3<f32>, b: &Array3<f32>) -> f32 {
        a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn single_pixel_scatters_kernel() {
        let kernel = Array::from_shape_vec((1, 1, 2, 2), vec![1., 2., 3., 4.]).unwrap();
        let signal = Array3::<f32>::ones((1, 1, 1));
        let out = conv_transpose2d(kernel.view(), None, signal.view(), Padding::Valid, 1).unwrap();
        assert_eq!(out.dim(), (1, 2, 2));
        assert_eq!(out.iter().copied().collect::<Vec<_>>(), vec![1., 2., 3., 4.]);
    }

    #[test]
    fn strided_output_size() {
        let kernel = Array4::<f32>::ones((2, 3, 3, 3));
        let signal = Array3::<f32>::ones((2, 4, 5));
        let out = conv_transpose2d(kernel.view(), None, signal.view(), Padding::Valid, 2).unwrap();
        assert_eq!(out.dim(), (3, 9, 11));
        let same = conv_transpose2d(kernel.view(), None, signal.view(), Padding::Same, 2).unwrap();
        assert_eq!(same.dim(), (3, 8, 10));
    }

    #[test]
    fn is_adjoint_of_convolution() {
        for &(padding, stride) in &[
            (Padding::Valid, 1),
            (Padding::Same, 1),
            (Padding::Valid, 2),
            (Padding::Same, 2),
        ] {
            let kernel = ramp((3, 2, 3, 3), 0.25);
            let layer = ConvolutionLayer::new(kernel, None, stride, padding).unwrap();
            let x = Array::from_shape_fn((2, 7, 6), |(c, i, j)| ((c + 2 * i + 3 * j) % 5) as f32 - 2.0);
            let y_shape = layer.output_size(7, 6);
            let y = Array::from_shape_fn((3, y_shape.0, y_shape.1), |(c, i, j)| {
                ((3 * c + i + j) % 4) as f32 - 1.5
            });
            let forward = layer.convolve(x.view()).unwrap();
            let backward = layer.transposed_convolve_to(y.view(), 7, 6).unwrap();
            assert_eq!(backward.dim(), x.dim());
            assert_abs_diff_eq!(inner(&forward, &y), inner(&x, &backward), epsilon = 1e-3);
        }
    }

    #[test]
    fn matches_full_convolution_of_flipped_kernel() {
        // stride 1: the transposed convolution is a "full" correlation with
        // the flipped kernel, i.e. a Valid conv2d on the zero-padded signal.
        let kernel = Array::from_shape_vec((1, 1, 2, 2), vec![1., 2., 3., 4.]).unwrap();
        let signal = Array::from_shape_vec((1, 2, 2), vec![1., 0., 0., 2.]).unwrap();
        let out = conv_transpose2d(kernel.view(), None, signal.view(), Padding::Valid, 1).unwrap();
        let flipped = Array::from_shape_vec((1, 1, 2, 2), vec![4., 3., 2., 1.]).unwrap();
        let mut padded = Array3::<f32>::zeros((1, 4, 4));
        padded.slice_mut(s![.., 1..3, 1..3]).assign(&signal);
        let reference = conv2d(flipped.view(), None, padded.view(), Padding::Valid, 1).unwrap();
        assert_eq!(out, reference);
    }
}

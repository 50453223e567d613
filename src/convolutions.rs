//! Im2col convolutions used by the reference backend's forward pass and by
//! the separable blur of the deconvolution view.
//!
//! Tensors are channel-first `(C, H, W)`, kernels `(F, C, HH, WW)`.
//! More on the im2col trick:
//! - <https://leonardoaraujosantos.gitbook.io/artificial-inteligence/machine_learning/deep_learning/convolution_layer/making_faster>

use ndarray::*;
use num_traits::Float;

use crate::error::Result;
use crate::Padding;

/// A convolution with optional per-filter bias.
#[derive(Debug, Clone)]
pub struct ConvolutionLayer<F: Float> {
    pub(crate) kernel: Array4<F>,
    pub(crate) bias: Option<Array1<F>>,
    pub(crate) stride: usize,
    pub(crate) padding: Padding,
}

impl<F: 'static + Float + std::ops::AddAssign> ConvolutionLayer<F> {
    /// Kernel layout is (out channels, in channels, kernel height, kernel width).
    pub fn new(
        kernel: Array4<F>,
        bias: Option<Array1<F>>,
        stride: usize,
        padding: Padding,
    ) -> Result<ConvolutionLayer<F>> {
        if stride == 0 || kernel.shape().contains(&0) {
            return Err(incompatible());
        }
        if let Some(bias) = &bias {
            if bias.len() != kernel.len_of(Axis(0)) {
                return Err(incompatible());
            }
        }
        Ok(ConvolutionLayer {
            kernel,
            bias,
            stride,
            padding,
        })
    }

    pub fn kernel(&self) -> ArrayView4<F> {
        self.kernel.view()
    }

    pub fn in_channels(&self) -> usize {
        self.kernel.len_of(Axis(1))
    }

    pub fn out_channels(&self) -> usize {
        self.kernel.len_of(Axis(0))
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn padding(&self) -> Padding {
        self.padding
    }

    /// Output height and width for an input of the given spatial size.
    pub fn output_size(&self, height: usize, width: usize) -> (usize, usize) {
        let kh = self.kernel.len_of(Axis(2));
        let kw = self.kernel.len_of(Axis(3));
        output_size(height, width, kh, kw, self.padding, self.stride)
    }

    pub fn convolve(&self, image: ArrayView3<F>) -> Result<Array3<F>> {
        conv2d(
            self.kernel.view(),
            self.bias.as_ref(),
            image,
            self.padding,
            self.stride,
        )
    }
}

pub(crate) fn incompatible() -> crate::VisError {
    ShapeError::from_kind(ErrorKind::IncompatibleShape).into()
}

pub(crate) fn output_size(
    height: usize,
    width: usize,
    kernel_h: usize,
    kernel_w: usize,
    padding: Padding,
    stride: usize,
) -> (usize, usize) {
    match padding {
        // H' = ceil(H / stride)
        Padding::Same => (
            (height + stride - 1) / stride,
            (width + stride - 1) / stride,
        ),
        // H' = (H - HH) / stride + 1
        Padding::Valid => (
            (height - kernel_h) / stride + 1,
            (width - kernel_w) / stride + 1,
        ),
    }
}

/// Padding amounts for `Padding::Same`, as
/// `(along height, along width, top, bottom, left, right)`.
pub(crate) fn get_padding_size(
    input_h: usize,
    input_w: usize,
    stride: usize,
    kernel_h: usize,
    kernel_w: usize,
) -> (usize, usize, usize, usize, usize, usize) {
    let along = |input: usize, kernel: usize| {
        if input % stride == 0 {
            kernel.saturating_sub(stride)
        } else {
            kernel.saturating_sub(input % stride)
        }
    };
    let pad_along_height = along(input_h, kernel_h);
    let pad_along_width = along(input_w, kernel_w);

    // The larger half goes first; this is what matches PyTorch for even kernels.
    let pad_bottom = pad_along_height / 2;
    let pad_top = pad_along_height - pad_bottom;
    let pad_right = pad_along_width / 2;
    let pad_left = pad_along_width - pad_right;

    (
        pad_along_height,
        pad_along_width,
        pad_top,
        pad_bottom,
        pad_left,
        pad_right,
    )
}

/// Unrolls every receptive field of `image` into one row:
/// `(new_h * new_w, C * HH * WW)`.
pub(crate) fn im2col<F: Float>(
    image: ArrayView3<F>,
    kernel_h: usize,
    kernel_w: usize,
    stride: usize,
) -> Array2<F> {
    let (channels, height, width) = image.dim();
    let new_h = (height - kernel_h) / stride + 1;
    let new_w = (width - kernel_w) / stride + 1;
    let mut cols = Array2::zeros((new_h * new_w, channels * kernel_h * kernel_w));
    for (row, mut col_row) in cols.outer_iter_mut().enumerate() {
        let (i, j) = (row / new_w, row % new_w);
        let patch = image.slice(s![
            ..,
            i * stride..i * stride + kernel_h,
            j * stride..j * stride + kernel_w,
        ]);
        for (dst, src) in col_row.iter_mut().zip(patch.iter()) {
            *dst = *src;
        }
    }
    cols
}

/// Cross-correlates `image` `(C, H, W)` with `kernel` `(F, C, HH, WW)`,
/// returning `(F, H', W')`.
pub fn conv2d<F: 'static + Float + std::ops::AddAssign>(
    kernel: ArrayView4<F>,
    bias: Option<&Array1<F>>,
    image: ArrayView3<F>,
    padding: Padding,
    stride: usize,
) -> Result<Array3<F>> {
    let (num_filters, kernel_channels, kernel_h, kernel_w) = kernel.dim();
    let (channels, height, width) = image.dim();
    if stride == 0 || kernel_channels != channels {
        return Err(incompatible());
    }
    if padding == Padding::Valid && (height < kernel_h || width < kernel_w) {
        return Err(incompatible());
    }
    let (new_h, new_w) = output_size(height, width, kernel_h, kernel_w, padding, stride);

    // weights.reshape(F, C*HH*WW), in logical order whatever the memory layout
    let filter_col = Array::from_shape_vec(
        (num_filters, channels * kernel_h * kernel_w),
        kernel.iter().copied().collect(),
    )?;

    let im_col = match padding {
        Padding::Same => {
            let (pad_h, pad_w, pad_top, _, pad_left, _) =
                get_padding_size(height, width, stride, kernel_h, kernel_w);
            let mut padded = Array3::zeros((channels, height + pad_h, width + pad_w));
            padded
                .slice_mut(s![
                    ..,
                    pad_top..pad_top + height,
                    pad_left..pad_left + width
                ])
                .assign(&image);
            im2col(padded.view(), kernel_h, kernel_w, stride)
        }
        Padding::Valid => im2col(image, kernel_h, kernel_w, stride),
    };

    let mul = im_col.dot(&filter_col.t());
    let mut output = mul
        .into_shape((new_h, new_w, num_filters))?
        .permuted_axes([2, 0, 1])
        .as_standard_layout()
        .into_owned();
    add_bias(&mut output, bias)?;
    Ok(output)
}

pub(crate) fn add_bias<F: Float + std::ops::AddAssign>(
    x: &mut Array3<F>,
    bias: Option<&Array1<F>>,
) -> Result<()> {
    if let Some(bias) = bias {
        if bias.len() != x.len_of(Axis(0)) {
            return Err(incompatible());
        }
        for (mut channel, &b) in x.outer_iter_mut().zip(bias.iter()) {
            channel.map_inplace(|v| *v += b);
        }
    }
    Ok(())
}

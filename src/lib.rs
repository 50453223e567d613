//! This package is the toolkit-independent core of an interactive CNN
//! visualizer. Given an inference backend and an input image it produces:
//! - per-layer unit thumbnails arranged in a viewport-filling grid,
//! - a detailed unit view: the activation map, optionally overlaid on the
//!   input image, or a deconvolution / backprop saliency view,
//! - galleries of the images that activate a unit the most.
//!
//! A host GUI sends [`state::Command`]s to a [`visualizer::Visualizer`] and
//! paints the [`PixelBuffer`]s it hands back. Inference runs on a worker
//! thread behind the [`engine::InferenceEngine`] trait; [`network::ConvNet`]
//! is a small reference backend built on the im2col convolutions in
//! [`convolutions`] and [`transposed_convolutions`].
//!
//! Tensors are channel-first throughout: a convolutional layer's activations
//! have shape (units, height, width), a fully connected layer's (units,).
//!
//! Example:
//! ```
//! use deepvis_rs::layout::{compute_layout, Viewport};
//!
//! // 128 units of 112 px in an 800x600 viewport, never below 20% scale
//! let layout = compute_layout(112, Viewport::new(800, 600), 128, 0.2, 10).unwrap();
//! assert!(layout.columns * layout.rows >= 128);
//! assert!(layout.cell_size >= 23);
//! ```

use ndarray::ArrayD;

pub mod colormap;
pub mod config;
pub mod convolutions;
pub mod engine;
pub mod error;
pub mod grid;
pub mod layout;
pub mod logging;
pub mod network;
pub mod normalize;
pub mod render;
pub mod resample;
pub mod state;
pub mod topk;
pub mod transposed_convolutions;
pub mod visualizer;
pub mod worker;

pub use config::VisConfig;
pub use error::{Result, VisError};

/// Raw activations or backward projections, channel-first.
pub type ActivationTensor = ArrayD<f32>;
/// 8-bit RGB image; the renderers' output and the grid's input unit.
pub type PixelBuffer = image::RgbImage;

/// Padding (specific way of adding zeros to the input matrix) kind used in the convolution.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum Padding {
    /// Output has the same shape as input.
    Same,
    /// Padding is only used to make input fit the kernel.
    Valid,
}

//! A small in-process CNN implementing [`InferenceEngine`].
//!
//! Layers are chained with a builder. The forward pass keeps every layer's
//! input, pre-activation and max-pool switches, so that a unit can be
//! projected back onto the input image with any [`BackpropMode`].
//!
//! ```
//! use deepvis_rs::network::ConvNet;
//! use deepvis_rs::Padding;
//! use ndarray::{Array1, Array2, Array4};
//!
//! let net = ConvNet::new((3, 8, 8), vec!["a".into(), "b".into()])
//!     .conv("conv1", Array4::ones((4, 3, 3, 3)), None, 1, Padding::Same, true)
//!     .and_then(|net| net.max_pool("pool1", 2))
//!     .and_then(|net| net.dense("fc", Array2::zeros((2, 64)), Array1::zeros(2), false))
//!     .unwrap();
//! assert_eq!(net.layer_names(), vec!["conv1", "pool1", "fc"]);
//! ```

use image::imageops::{self, FilterType};
use ndarray::{Array1, Array2, Array3, Array4, ArrayD, Axis, Ix1, Ix3, IxDyn, Zip};

use crate::convolutions::{incompatible, ConvolutionLayer};
use crate::engine::{rank_predictions, BackpropMode, InferenceEngine, LayerInfo, Prediction, SessionId};
use crate::error::{Result, VisError};
use crate::topk::NpyTopKStore;
use crate::{ActivationTensor, Padding, PixelBuffer};

/// Per-channel mean the VGG family was trained with.
pub const VGG_MEAN: [f32; 3] = [103.939, 116.779, 123.68];

#[derive(Debug, Clone)]
enum LayerKind {
    Conv {
        conv: ConvolutionLayer<f32>,
        relu: bool,
    },
    MaxPool {
        size: usize,
    },
    Dense {
        weights: Array2<f32>,
        bias: Array1<f32>,
        relu: bool,
    },
}

impl LayerKind {
    fn has_relu(&self) -> bool {
        match self {
            LayerKind::Conv { relu, .. } | LayerKind::Dense { relu, .. } => *relu,
            LayerKind::MaxPool { .. } => false,
        }
    }
}

#[derive(Debug, Clone)]
struct NamedLayer {
    name: String,
    kind: LayerKind,
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
}

/// Everything one forward pass leaves behind for the backward projections.
#[derive(Debug)]
struct Trace {
    session: SessionId,
    pre_activations: Vec<ArrayD<f32>>,
    outputs: Vec<ArrayD<f32>>,
    switches: Vec<Option<Array3<usize>>>,
}

#[derive(Debug)]
pub struct ConvNet {
    input_shape: (usize, usize, usize),
    mean: [f32; 3],
    labels: Vec<String>,
    layers: Vec<NamedLayer>,
    top_k: Option<NpyTopKStore>,
    next_session: u64,
    trace: Option<Trace>,
}

impl ConvNet {
    /// `input_shape` is `(3, height, width)`; images are resized to it.
    pub fn new(input_shape: (usize, usize, usize), labels: Vec<String>) -> Self {
        ConvNet {
            input_shape,
            mean: [0.0; 3],
            labels,
            layers: Vec::new(),
            top_k: None,
            next_session: 0,
            trace: None,
        }
    }

    pub fn with_mean(mut self, mean: [f32; 3]) -> Self {
        self.mean = mean;
        self
    }

    pub fn with_top_k_store(mut self, store: NpyTopKStore) -> Self {
        self.top_k = Some(store);
        self
    }

    pub fn layer_names(&self) -> Vec<&str> {
        self.layers.iter().map(|l| l.name.as_str()).collect()
    }

    fn current_shape(&self) -> Vec<usize> {
        match self.layers.last() {
            Some(layer) => layer.output_shape.clone(),
            None => vec![self.input_shape.0, self.input_shape.1, self.input_shape.2],
        }
    }

    fn push(mut self, name: &str, kind: LayerKind, output_shape: Vec<usize>) -> Result<Self> {
        if self.layers.iter().any(|l| l.name == name) {
            return Err(VisError::InferenceError(format!("duplicate layer name `{}`", name)));
        }
        let input_shape = self.current_shape();
        self.layers.push(NamedLayer {
            name: name.to_string(),
            kind,
            input_shape,
            output_shape,
        });
        Ok(self)
    }

    /// Appends a convolution; `kernel` is `(out, in, height, width)`.
    pub fn conv(
        self,
        name: &str,
        kernel: Array4<f32>,
        bias: Option<Array1<f32>>,
        stride: usize,
        padding: Padding,
        relu: bool,
    ) -> Result<Self> {
        let shape = self.current_shape();
        let (_, _, kh, kw) = kernel.dim();
        if shape.len() != 3 || kernel.len_of(Axis(1)) != shape[0] {
            return Err(incompatible());
        }
        if padding == Padding::Valid && (shape[1] < kh || shape[2] < kw) {
            return Err(incompatible());
        }
        let conv = ConvolutionLayer::new(kernel, bias, stride, padding)?;
        let (h, w) = conv.output_size(shape[1], shape[2]);
        let output_shape = vec![conv.out_channels(), h, w];
        self.push(name, LayerKind::Conv { conv, relu }, output_shape)
    }

    /// Appends a non-overlapping `size x size` max pooling.
    pub fn max_pool(self, name: &str, size: usize) -> Result<Self> {
        let shape = self.current_shape();
        if shape.len() != 3 || size == 0 || shape[1] < size || shape[2] < size {
            return Err(incompatible());
        }
        let output_shape = vec![shape[0], shape[1] / size, shape[2] / size];
        self.push(name, LayerKind::MaxPool { size }, output_shape)
    }

    /// Appends a fully connected layer; `weights` is `(out, in)` and the
    /// previous output is flattened.
    pub fn dense(self, name: &str, weights: Array2<f32>, bias: Array1<f32>, relu: bool) -> Result<Self> {
        let inputs: usize = self.current_shape().iter().product();
        if weights.ncols() != inputs || bias.len() != weights.nrows() {
            return Err(incompatible());
        }
        let output_shape = vec![weights.nrows()];
        self.push(name, LayerKind::Dense { weights, bias, relu }, output_shape)
    }

    fn layer_index(&self, name: &str) -> Result<usize> {
        self.layers
            .iter()
            .position(|l| l.name == name)
            .ok_or_else(|| VisError::LayerNotFound(name.to_string()))
    }

    fn trace(&self, session: SessionId) -> Result<&Trace> {
        match &self.trace {
            Some(trace) if trace.session == session => Ok(trace),
            Some(trace) => Err(VisError::InferenceError(format!(
                "session {} was replaced by session {}",
                session.0, trace.session.0
            ))),
            None => Err(VisError::InferenceError(format!(
                "session {} is unknown, no forward pass has run",
                session.0
            ))),
        }
    }

    fn preprocess(&self, image: &PixelBuffer) -> Result<Array3<f32>> {
        let (channels, height, width) = self.input_shape;
        if image.width() == 0 || image.height() == 0 {
            return Err(VisError::InferenceError("input image is empty".to_string()));
        }
        if channels != 3 {
            return Err(VisError::InferenceError(format!(
                "network expects {} channels, images have 3",
                channels
            )));
        }
        let resized;
        let source = if image.dimensions() == (width as u32, height as u32) {
            image
        } else {
            resized = imageops::resize(image, width as u32, height as u32, FilterType::Triangle);
            &resized
        };
        let mean = self.mean;
        Ok(Array3::from_shape_fn((3, height, width), |(c, y, x)| {
            f32::from(source.get_pixel(x as u32, y as u32)[c]) - mean[c]
        }))
    }
}

fn relu(x: &ArrayD<f32>) -> ArrayD<f32> {
    x.mapv(|v| v.max(0.0))
}

/// Max pooling that also returns, per output sample, the flat `y * w + x`
/// index of the input sample it came from.
fn max_pool_forward(input: &Array3<f32>, size: usize) -> (Array3<f32>, Array3<usize>) {
    let (channels, height, width) = input.dim();
    let (out_h, out_w) = (height / size, width / size);
    let mut output = Array3::zeros((channels, out_h, out_w));
    let mut switches = Array3::zeros((channels, out_h, out_w));
    for c in 0..channels {
        for oy in 0..out_h {
            for ox in 0..out_w {
                let mut best = (f32::NEG_INFINITY, oy * size * width + ox * size);
                for y in oy * size..(oy + 1) * size {
                    for x in ox * size..(ox + 1) * size {
                        let v = input[[c, y, x]];
                        if v > best.0 {
                            best = (v, y * width + x);
                        }
                    }
                }
                output[[c, oy, ox]] = best.0;
                switches[[c, oy, ox]] = best.1;
            }
        }
    }
    (output, switches)
}

fn apply_backward_relu(signal: &mut ArrayD<f32>, pre_activation: &ArrayD<f32>, mode: BackpropMode) {
    Zip::from(signal).and(pre_activation).for_each(|g, &pre| {
        *g = match mode {
            BackpropMode::Gradient if pre > 0.0 => *g,
            BackpropMode::Gradient => 0.0,
            BackpropMode::ZfDeconv => g.max(0.0),
            BackpropMode::GuidedBackprop if pre > 0.0 => g.max(0.0),
            BackpropMode::GuidedBackprop => 0.0,
        };
    });
}

impl InferenceEngine for ConvNet {
    fn list_layers(&self) -> Vec<LayerInfo> {
        self.layers
            .iter()
            .map(|l| LayerInfo::new(l.name.clone(), l.output_shape.clone()))
            .collect()
    }

    fn forward(&mut self, image: &PixelBuffer) -> Result<SessionId> {
        let mut x = self.preprocess(image)?.into_dyn();
        let mut pre_activations = Vec::with_capacity(self.layers.len());
        let mut outputs = Vec::with_capacity(self.layers.len());
        let mut switches = Vec::with_capacity(self.layers.len());

        for layer in &self.layers {
            let (pre, switch) = match &layer.kind {
                LayerKind::Conv { conv, .. } => {
                    let input = x.view().into_dimensionality::<Ix3>()?;
                    (conv.convolve(input)?.into_dyn(), None)
                }
                LayerKind::MaxPool { size } => {
                    let input = x.clone().into_dimensionality::<Ix3>()?;
                    let (out, switch) = max_pool_forward(&input, *size);
                    (out.into_dyn(), Some(switch))
                }
                LayerKind::Dense { weights, bias, .. } => {
                    let flat = Array1::from_iter(x.iter().copied());
                    ((weights.dot(&flat) + bias).into_dyn(), None)
                }
            };
            let out = if layer.kind.has_relu() { relu(&pre) } else { pre.clone() };
            x = out.clone();
            pre_activations.push(pre);
            outputs.push(out);
            switches.push(switch);
        }

        self.next_session += 1;
        let session = SessionId(self.next_session);
        tracing::debug!(session = session.0, layers = self.layers.len(), "forward pass done");
        self.trace = Some(Trace {
            session,
            pre_activations,
            outputs,
            switches,
        });
        Ok(session)
    }

    fn activation(&self, session: SessionId, layer: &str) -> Result<ActivationTensor> {
        let index = self.layer_index(layer)?;
        Ok(self.trace(session)?.outputs[index].clone())
    }

    fn deconv(
        &mut self,
        session: SessionId,
        layer: &str,
        unit: usize,
        mode: BackpropMode,
    ) -> Result<ActivationTensor> {
        let index = self.layer_index(layer)?;
        let trace = self.trace(session)?;
        let output = &trace.outputs[index];
        let units = output.len_of(Axis(0));
        if unit >= units {
            return Err(VisError::UnitOutOfRange {
                layer: layer.to_string(),
                unit,
                units,
            });
        }

        // Seed: the chosen unit keeps its own activation, all others are zero.
        let mut signal = ArrayD::zeros(output.raw_dim());
        signal
            .index_axis_mut(Axis(0), unit)
            .assign(&output.index_axis(Axis(0), unit));

        for i in (0..=index).rev() {
            let named = &self.layers[i];
            if named.kind.has_relu() {
                apply_backward_relu(&mut signal, &trace.pre_activations[i], mode);
            }
            signal = match &named.kind {
                LayerKind::Conv { conv, .. } => {
                    let (h, w) = (named.input_shape[1], named.input_shape[2]);
                    let grad = signal.into_dimensionality::<Ix3>()?;
                    conv.transposed_convolve_to(grad.view(), h, w)?.into_dyn()
                }
                LayerKind::MaxPool { .. } => {
                    let grad = signal.into_dimensionality::<Ix3>()?;
                    let switch = trace.switches[i].as_ref().ok_or_else(incompatible)?;
                    let width = named.input_shape[2];
                    let mut back = Array3::zeros((
                        named.input_shape[0],
                        named.input_shape[1],
                        named.input_shape[2],
                    ));
                    for ((c, oy, ox), &g) in grad.indexed_iter() {
                        let flat = switch[[c, oy, ox]];
                        back[[c, flat / width, flat % width]] += g;
                    }
                    back.into_dyn()
                }
                LayerKind::Dense { weights, .. } => {
                    let grad = signal.into_dimensionality::<Ix1>()?;
                    let back = weights.t().dot(&grad);
                    ArrayD::from_shape_vec(IxDyn(&named.input_shape), back.to_vec())?
                }
            };
        }
        tracing::debug!(layer, unit, mode = %mode, "deconv projected to input");
        Ok(signal)
    }

    fn top_k_images(
        &self,
        layer: &str,
        unit: usize,
        k: usize,
        use_deconv: bool,
    ) -> Result<Vec<PixelBuffer>> {
        self.layer_index(layer)?;
        match &self.top_k {
            Some(store) => store.load(layer, unit, k, use_deconv),
            None => Ok(Vec::new()),
        }
    }

    fn classify(&self, session: SessionId) -> Result<Vec<Prediction>> {
        let trace = self.trace(session)?;
        let logits = trace
            .outputs
            .last()
            .ok_or_else(|| VisError::InferenceError("network has no layers".to_string()))?;
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exp: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
        let total: f32 = exp.iter().sum();
        let probabilities: Vec<f32> = exp.iter().map(|v| v / total).collect();
        Ok(rank_predictions(&self.labels, &probabilities))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use image::Rgb;
    use ndarray::{arr1, arr2, s};

    fn identity_kernel(channels: usize) -> Array4<f32> {
        let mut kernel = Array4::zeros((channels, channels, 1, 1));
        for c in 0..channels {
            kernel[[c, c, 0, 0]] = 1.0;
        }
        kernel
    }

    /// conv1: identity + ReLU, conv2: `300 - red` + ReLU.
    fn two_conv_net() -> ConvNet {
        let mut kernel = Array4::zeros((1, 3, 1, 1));
        kernel[[0, 0, 0, 0]] = -1.0;
        ConvNet::new((3, 4, 4), vec![])
            .conv("conv1", identity_kernel(3), None, 1, Padding::Valid, true)
            .and_then(|net| net.conv("conv2", kernel, Some(arr1(&[300.0])), 1, Padding::Valid, true))
            .unwrap()
    }

    #[test]
    fn forward_records_every_layer() {
        let mut net = two_conv_net();
        let session = net.forward(&PixelBuffer::from_pixel(4, 4, Rgb([100, 50, 25]))).unwrap();
        let conv1 = net.activation(session, "conv1").unwrap();
        assert_eq!(conv1.shape(), &[3, 4, 4]);
        assert_abs_diff_eq!(conv1[[1, 2, 2]], 50.0);
        let conv2 = net.activation(session, "conv2").unwrap();
        assert_eq!(conv2.shape(), &[1, 4, 4]);
        assert_abs_diff_eq!(conv2[[0, 0, 0]], 200.0);
        assert_eq!(net.list_layers()[1], LayerInfo::new("conv2", vec![1, 4, 4]));
    }

    #[test]
    fn unknown_layers_and_stale_sessions_fail() {
        let mut net = two_conv_net();
        let image = PixelBuffer::from_pixel(4, 4, Rgb([1, 1, 1]));
        let first = net.forward(&image).unwrap();
        assert!(matches!(net.activation(first, "fc9"), Err(VisError::LayerNotFound(_))));
        let second = net.forward(&image).unwrap();
        assert!(second > first);
        assert!(matches!(net.activation(first, "conv1"), Err(VisError::InferenceError(_))));
        assert!(matches!(
            net.deconv(second, "conv2", 1, BackpropMode::Gradient),
            Err(VisError::UnitOutOfRange { .. })
        ));
        assert!(net.forward(&PixelBuffer::new(0, 0)).is_err());
    }

    #[test]
    fn zf_deconv_rectifies_negative_signal() {
        let mut net = two_conv_net();
        let session = net.forward(&PixelBuffer::from_pixel(4, 4, Rgb([100, 100, 100]))).unwrap();

        let gradient = net.deconv(session, "conv2", 0, BackpropMode::Gradient).unwrap();
        assert_eq!(gradient.shape(), &[3, 4, 4]);
        assert!(gradient.slice(s![0, .., ..]).iter().all(|&v| (v + 200.0).abs() < 1e-4));
        assert!(gradient.slice(s![1.., .., ..]).iter().all(|&v| v == 0.0));

        let zf = net.deconv(session, "conv2", 0, BackpropMode::ZfDeconv).unwrap();
        assert!(zf.iter().all(|&v| v == 0.0));
        let guided = net.deconv(session, "conv2", 0, BackpropMode::GuidedBackprop).unwrap();
        assert!(guided.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn gradient_mask_follows_forward_activation() {
        // dark pixels are switched off by conv1's ReLU once the mean is removed
        let mut net = ConvNet::new((3, 2, 2), vec![])
            .with_mean([50.0, 50.0, 50.0])
            .conv("conv1", identity_kernel(3), None, 1, Padding::Valid, true)
            .unwrap();
        let mut image = PixelBuffer::from_pixel(2, 2, Rgb([10, 10, 10]));
        image.put_pixel(1, 1, Rgb([200, 10, 10]));
        let session = net.forward(&image).unwrap();
        let gradient = net.deconv(session, "conv1", 0, BackpropMode::Gradient).unwrap();
        assert_abs_diff_eq!(gradient[[0, 1, 1]], 150.0);
        assert_eq!(gradient.iter().filter(|&&v| v != 0.0).count(), 1);
    }

    #[test]
    fn pooling_and_dense_route_to_the_argmax() {
        let weights = arr2(&[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
        let mut net = ConvNet::new((3, 2, 2), vec!["red".into(), "green".into()])
            .max_pool("pool", 2)
            .and_then(|net| net.dense("fc", weights, arr1(&[0.0, 0.0]), false))
            .unwrap();
        let mut image = PixelBuffer::from_pixel(2, 2, Rgb([10, 20, 30]));
        image.put_pixel(0, 1, Rgb([90, 20, 30]));
        let session = net.forward(&image).unwrap();

        let fc = net.activation(session, "fc").unwrap();
        assert_eq!(fc.shape(), &[2]);
        assert_abs_diff_eq!(fc[[0]], 90.0);

        let back = net.deconv(session, "fc", 0, BackpropMode::Gradient).unwrap();
        assert_eq!(back.shape(), &[3, 2, 2]);
        // pixel (x=0, y=1) is row 1, column 0
        assert_abs_diff_eq!(back[[0, 1, 0]], 90.0);
        assert_abs_diff_eq!(back.sum(), 90.0);

        let ranked = net.classify(session).unwrap();
        assert_eq!(ranked[0].label, "red");
        let total: f32 = ranked.iter().map(|p| p.probability).sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn builder_rejects_mismatched_shapes() {
        let net = ConvNet::new((3, 4, 4), vec![]);
        assert!(net
            .conv("c", Array4::zeros((2, 1, 3, 3)), None, 1, Padding::Same, true)
            .is_err());
        let net = ConvNet::new((3, 4, 4), vec![]);
        assert!(net.dense("fc", Array2::zeros((2, 47)), Array1::zeros(2), false).is_err());
        let net = ConvNet::new((3, 4, 4), vec![]).max_pool("p", 2).unwrap();
        assert!(net.max_pool("p2", 3).is_err());
        let net = ConvNet::new((3, 4, 4), vec![]).max_pool("p", 2).unwrap();
        assert!(net.max_pool("p", 2).is_err());
    }

    #[test]
    fn no_top_images_without_a_store() {
        let net = two_conv_net();
        assert!(net.top_k_images("conv1", 0, 9, false).unwrap().is_empty());
        assert!(net.top_k_images("nope", 0, 9, false).is_err());
    }
}

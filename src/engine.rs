//! The interface the visualizer needs from an inference backend.

use std::fmt;

use crate::error::Result;
use crate::{ActivationTensor, PixelBuffer};

/// Name and per-image output shape of a layer, channel-first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerInfo {
    pub name: String,
    pub output_shape: Vec<usize>,
}

impl LayerInfo {
    pub fn new(name: impl Into<String>, output_shape: Vec<usize>) -> Self {
        LayerInfo {
            name: name.into(),
            output_shape,
        }
    }

    /// Number of units (filters or neurons).
    pub fn units(&self) -> usize {
        self.output_shape.first().copied().unwrap_or(0)
    }

    /// Whether each unit has a spatial map rather than a single value.
    pub fn is_spatial(&self) -> bool {
        self.output_shape.len() >= 3
    }

    /// `H×W×C` style label for network overviews.
    pub fn shape_label(&self) -> String {
        let mut dims: Vec<String> = self.output_shape.iter().skip(1).map(|d| d.to_string()).collect();
        dims.push(self.units().to_string());
        dims.join("×")
    }
}

/// Opaque handle of one forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

/// How a unit's signal is carried back to the input image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackpropMode {
    /// Plain gradient: the backward ReLU masks by the forward activation.
    Gradient,
    /// Zeiler & Fergus deconvnet: the backward ReLU rectifies the signal.
    ZfDeconv,
    /// Both masks at once.
    GuidedBackprop,
}

impl BackpropMode {
    pub const ALL: [BackpropMode; 3] = [
        BackpropMode::Gradient,
        BackpropMode::ZfDeconv,
        BackpropMode::GuidedBackprop,
    ];

    pub fn label(self) -> &'static str {
        match self {
            BackpropMode::Gradient => "Gradient",
            BackpropMode::ZfDeconv => "ZF Deconv",
            BackpropMode::GuidedBackprop => "Guided Backprop",
        }
    }
}

impl fmt::Display for BackpropMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub label: String,
    pub probability: f32,
}

/// Inference backend. Implementations run on the worker thread, so they
/// need to be `Send`; nothing calls them concurrently.
pub trait InferenceEngine: Send {
    /// Layers in network order.
    fn list_layers(&self) -> Vec<LayerInfo>;

    /// Runs the network on `image`. Fails with `InferenceError` on malformed input.
    fn forward(&mut self, image: &PixelBuffer) -> Result<SessionId>;

    /// Output of `layer` for the image of `session`: `(C, H, W)` or `(C,)`.
    fn activation(&self, session: SessionId, layer: &str) -> Result<ActivationTensor>;

    /// Projection of one unit back onto the input, `(3, H, W)`.
    fn deconv(
        &mut self,
        session: SessionId,
        layer: &str,
        unit: usize,
        mode: BackpropMode,
    ) -> Result<ActivationTensor>;

    /// Precomputed images that activate `unit` the most; empty when the
    /// backend has no cache for it.
    fn top_k_images(
        &self,
        layer: &str,
        unit: usize,
        k: usize,
        use_deconv: bool,
    ) -> Result<Vec<PixelBuffer>>;

    /// Class probabilities, most likely first.
    fn classify(&self, session: SessionId) -> Result<Vec<Prediction>>;
}

/// Sorts `(label, probability)` pairs into predictions, most likely first.
pub fn rank_predictions(labels: &[String], probabilities: &[f32]) -> Vec<Prediction> {
    let mut ranked: Vec<Prediction> = probabilities
        .iter()
        .enumerate()
        .map(|(index, &probability)| Prediction {
            label: labels
                .get(index)
                .cloned()
                .unwrap_or_else(|| format!("class {}", index)),
            probability,
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.probability
            .partial_cmp(&a.probability)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ranked
}

/// Text of the results panel: one `#i label p%` line per prediction.
pub fn format_predictions(predictions: &[Prediction], shown: usize) -> String {
    predictions
        .iter()
        .take(shown)
        .enumerate()
        .map(|(rank, p)| format!("#{} {:>16}    {:4.2}%", rank, p.label, p.probability * 100.0))
        .collect::<Vec<_>>()
        .join("\n")
}

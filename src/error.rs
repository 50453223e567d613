//! Error type shared by every module of the crate.

use thiserror::Error;

/// Everything that can go wrong while laying out, rendering or talking to
/// an inference backend.
#[derive(Debug, Error)]
pub enum VisError {
    /// Caller passed arguments the layout engine cannot work with.
    #[error("invalid layout input: {0}")]
    InvalidLayoutInput(String),
    /// Nothing has been computed yet for the requested layer / unit.
    #[error("no data available for {what}")]
    NoDataAvailable { what: String },
    #[error("layer `{0}` not found")]
    LayerNotFound(String),
    #[error("unit {unit} out of range for layer `{layer}` with {units} units")]
    UnitOutOfRange {
        layer: String,
        unit: usize,
        units: usize,
    },
    #[error("inference failed: {0}")]
    InferenceError(String),
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
    #[error(transparent)]
    Npy(#[from] ndarray_npy::ReadNpyError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("inference worker is no longer running")]
    WorkerStopped,
}

impl VisError {
    pub(crate) fn no_data(what: impl Into<String>) -> Self {
        VisError::NoDataAvailable { what: what.into() }
    }

    /// Transient errors the UI swallows while keeping its last frame.
    pub fn is_transient(&self) -> bool {
        matches!(self, VisError::NoDataAvailable { .. })
    }
}

pub type Result<T> = std::result::Result<T, VisError>;

//! Precomputed "top images" galleries stored as `.npy` files.
//!
//! Layout on disk, one file per unit and source:
//!
//! ```text
//! <root>/<layer>/unit_<index>_input.npy    (k, H, W, 3) u8
//! <root>/<layer>/unit_<index>_deconv.npy   (k, H, W, 3) u8
//! ```
//!
//! Units without a file simply have no gallery.

use std::path::{Path, PathBuf};

use ndarray::{Array4, Axis};
use ndarray_npy::read_npy;

use crate::convolutions::incompatible;
use crate::error::Result;
use crate::PixelBuffer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpyTopKStore {
    root: PathBuf,
}

impl NpyTopKStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        NpyTopKStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, layer: &str, unit: usize, use_deconv: bool) -> PathBuf {
        let source = if use_deconv { "deconv" } else { "input" };
        self.root
            .join(layer)
            .join(format!("unit_{}_{}.npy", unit, source))
    }

    /// Up to `k` images of `unit`, strongest first.
    pub fn load(&self, layer: &str, unit: usize, k: usize, use_deconv: bool) -> Result<Vec<PixelBuffer>> {
        let path = self.path_for(layer, unit, use_deconv);
        if !path.is_file() {
            tracing::debug!(path = %path.display(), "no top images cached");
            return Ok(Vec::new());
        }
        let stack: Array4<u8> = read_npy(&path)?;
        let (_, height, width, channels) = stack.dim();
        if channels != 3 {
            return Err(incompatible());
        }
        stack
            .axis_iter(Axis(0))
            .take(k)
            .map(|image| {
                let raw: Vec<u8> = image.iter().copied().collect();
                PixelBuffer::from_raw(width as u32, height as u32, raw).ok_or_else(incompatible)
            })
            .collect()
    }
}

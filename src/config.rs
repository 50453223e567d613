//! Tunables for rendering, layout and the worker thread.
//!
//! Every field has a default, so a config file only needs the keys it
//! changes:
//!
//! ```toml
//! [layout]
//! border_width = 6
//!
//! [render]
//! canonical_size = 256
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VisError};

/// Environment variable pointing at a TOML config file.
pub const CONFIG_ENV: &str = "DEEPVIS_CONFIG";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VisConfig {
    pub render: RenderSettings,
    pub layout: LayoutSettings,
    pub gallery: GallerySettings,
    pub worker: WorkerSettings,
}

impl VisConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: VisConfig = toml::from_str(text)?;
        config.render.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Reads the file named by `DEEPVIS_CONFIG`, or falls back to defaults
    /// when the variable is unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) if !path.is_empty() => {
                tracing::info!(path = ?path, "loading visualizer config");
                Self::load(path)
            }
            _ => Ok(Self::default()),
        }
    }
}

/// Parameters of the detail-view renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    /// Edge length of the square detail view.
    pub canonical_size: u32,
    /// Activation value (display range) at which overlay alpha is 50%.
    pub overlay_border: f32,
    /// Half-width of the sigmoid domain used for the overlay alpha.
    pub overlay_delta: f32,
    /// Gaussian sigma of the blurred-norm view, relative to `canonical_size`.
    pub blur_fraction: f32,
    pub epsilon: f32,
    /// Edge length of the swatch drawn for fully connected units.
    pub scalar_unit_size: u32,
}

impl RenderSettings {
    /// Rejects values that would render empty or NaN frames.
    pub fn validate(&self) -> Result<()> {
        let positive = |v: f32| v.is_finite() && v > 0.0;
        if self.canonical_size == 0 {
            return Err(invalid("render.canonical_size must be positive"));
        }
        if !positive(self.overlay_delta) {
            return Err(invalid("render.overlay_delta must be positive"));
        }
        if !self.overlay_border.is_finite() {
            return Err(invalid("render.overlay_border must be finite"));
        }
        if !positive(self.blur_fraction) {
            return Err(invalid("render.blur_fraction must be positive"));
        }
        if !positive(self.epsilon) {
            return Err(invalid("render.epsilon must be positive"));
        }
        Ok(())
    }
}

fn invalid(reason: &str) -> VisError {
    VisError::InvalidConfig(reason.to_string())
}

impl Default for RenderSettings {
    fn default() -> Self {
        RenderSettings {
            canonical_size: 224,
            overlay_border: 32.0,
            overlay_delta: 4.0,
            blur_fraction: 0.02,
            epsilon: 1e-10,
            scalar_unit_size: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutSettings {
    pub border_width: u32,
    pub min_scale_factor: f64,
    /// Viewport assumed before the host reports its first resize.
    pub initial_viewport: (u32, u32),
}

impl Default for LayoutSettings {
    fn default() -> Self {
        LayoutSettings {
            border_width: 10,
            min_scale_factor: 0.2,
            initial_viewport: (800, 600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GallerySettings {
    /// How many top images are requested per unit.
    pub top_k: usize,
    /// How many predictions the results panel lists.
    pub shown_predictions: usize,
}

impl Default for GallerySettings {
    fn default() -> Self {
        GallerySettings {
            top_k: 9,
            shown_predictions: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub thread_name: String,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        WorkerSettings {
            thread_name: "deepvis-inference".to_string(),
        }
    }
}

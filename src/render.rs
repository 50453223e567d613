//! Turns activations and backward projections into pixels.
//!
//! Activations arrive display-normalized (layer-wide onto [0, 255], see
//! [`unit_slice`]). The detail view is always `canonical_size` square.

use std::fmt;
use std::path::Path;

use image::imageops::{self, FilterType};
use image::Rgb;
use ndarray::{Array2, ArrayD, ArrayView2, ArrayViewD, Axis, Ix2, Ix3};

use crate::colormap::Jet;
use crate::config::RenderSettings;
use crate::convolutions::incompatible;
use crate::error::{Result, VisError};
use crate::normalize::{centered_normalize, display_normalize, norm01, to_u8};
use crate::resample::{channel_mean, channel_norm, gaussian_blur, resize_bilinear, resize_nearest};
use crate::{ActivationTensor, PixelBuffer};

/// How an activation map is combined with the input image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OverlayMode {
    /// The grayscale map alone.
    NoOverlay,
    /// Input image where the unit fires, black elsewhere.
    OverActive,
    /// Input image where the unit is silent, the map elsewhere.
    OverInactive,
    /// The map, with the input image showing through where the unit fires.
    OnlyActive,
    /// Input image where the unit is silent, black elsewhere.
    OnlyInactive,
}

impl OverlayMode {
    pub const ALL: [OverlayMode; 5] = [
        OverlayMode::NoOverlay,
        OverlayMode::OverActive,
        OverlayMode::OverInactive,
        OverlayMode::OnlyActive,
        OverlayMode::OnlyInactive,
    ];

    pub fn label(self) -> &'static str {
        match self {
            OverlayMode::NoOverlay => "No overlay",
            OverlayMode::OverActive => "Over active",
            OverlayMode::OverInactive => "Over inactive",
            OverlayMode::OnlyActive => "Only active",
            OverlayMode::OnlyInactive => "Only inactive",
        }
    }

    fn base_is_map(self) -> bool {
        matches!(
            self,
            OverlayMode::NoOverlay | OverlayMode::OnlyActive | OverlayMode::OverInactive
        )
    }

    fn inverted(self) -> bool {
        matches!(self, OverlayMode::OverInactive | OverlayMode::OnlyInactive)
    }
}

/// How a `(C, H, W)` backward projection is shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeconvView {
    Raw,
    Gray,
    Norm,
    NormBlurred,
}

impl DeconvView {
    pub const ALL: [DeconvView; 4] = [
        DeconvView::Raw,
        DeconvView::Gray,
        DeconvView::Norm,
        DeconvView::NormBlurred,
    ];

    pub fn label(self) -> &'static str {
        match self {
            DeconvView::Raw => "Deconv raw",
            DeconvView::Gray => "Deconv gray",
            DeconvView::Norm => "Deconv norm",
            DeconvView::NormBlurred => "Deconv norm blurred",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderMode {
    Activation(OverlayMode),
    Deconv(DeconvView),
}

impl RenderMode {
    pub fn is_deconv(self) -> bool {
        matches!(self, RenderMode::Deconv(_))
    }

    pub fn label(self) -> &'static str {
        match self {
            RenderMode::Activation(mode) => mode.label(),
            RenderMode::Deconv(view) => view.label(),
        }
    }
}

impl Default for RenderMode {
    fn default() -> Self {
        RenderMode::Activation(OverlayMode::NoOverlay)
    }
}

impl fmt::Display for RenderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Overlay opacity in [0, 255] of a display-range activation `a`.
///
/// A sigmoid centred on `overlay_border` whose slope flattens as `a`
/// grows, rescaled so that `a = 0` is transparent and `a = 255` opaque.
pub fn overlay_alpha(a: f32, settings: &RenderSettings) -> f32 {
    let border = settings.overlay_border;
    let delta = settings.overlay_delta;
    let a = if a.is_finite() { a } else { 0.0 };
    let stretch = border / delta + a * (255.0 - 2.0 * border) / delta / 255.0;
    let low = sigmoid(-delta);
    let high = sigmoid(delta);
    let alpha = 255.0 * (sigmoid((a - border) / stretch) - low) / (high - low);
    alpha.clamp(0.0, 255.0)
}

fn gray_pixel(v: u8) -> Rgb<u8> {
    Rgb([v, v, v])
}

fn gray_image(map: ArrayView2<f32>) -> PixelBuffer {
    let (height, width) = map.dim();
    PixelBuffer::from_fn(width as u32, height as u32, |x, y| {
        gray_pixel(to_u8(map[[y as usize, x as usize]]))
    })
}

fn as_map(slice: ArrayViewD<f32>) -> Result<Array2<f32>> {
    match slice.ndim() {
        0 => Ok(Array2::from_elem((1, 1), slice.iter().copied().next().unwrap_or(0.0))),
        2 => Ok(slice.into_dimensionality::<Ix2>()?.to_owned()),
        _ => Err(incompatible()),
    }
}

fn fit_input(input: &PixelBuffer, size: u32) -> Result<PixelBuffer> {
    if input.width() == 0 || input.height() == 0 {
        return Err(VisError::no_data("input image"));
    }
    if input.dimensions() == (size, size) {
        return Ok(input.clone());
    }
    Ok(imageops::resize(input, size, size, FilterType::Nearest))
}

/// Renders one unit's display-range activation (a 0-d scalar or an
/// `(H, W)` map) into the detail view.
pub fn render_activation(
    slice: ArrayViewD<f32>,
    input: &PixelBuffer,
    mode: OverlayMode,
    settings: &RenderSettings,
) -> Result<PixelBuffer> {
    if slice.is_empty() {
        return Err(VisError::no_data("activation"));
    }
    let size = settings.canonical_size as usize;
    let map = as_map(slice)?;

    let mut canvas = if mode.base_is_map() {
        gray_image(resize_nearest(map.view(), size, size).view())
    } else {
        PixelBuffer::new(size as u32, size as u32)
    };
    if mode == OverlayMode::NoOverlay {
        return Ok(canvas);
    }

    let mut alpha = map.mapv(|a| overlay_alpha(a, settings));
    if mode.inverted() {
        alpha.mapv_inplace(|a| 255.0 - a);
    }
    let alpha = resize_nearest(alpha.view(), size, size);
    let source = fit_input(input, size as u32)?;

    for (x, y, pixel) in canvas.enumerate_pixels_mut() {
        let a = alpha[[y as usize, x as usize]] / 255.0;
        let src = source.get_pixel(x, y);
        for c in 0..3 {
            pixel[c] = to_u8(f32::from(src[c]) * a + f32::from(pixel[c]) * (1.0 - a));
        }
    }
    Ok(canvas)
}

/// Renders a `(C, H, W)` backward projection, bilinear-resized to the
/// detail view size.
pub fn render_deconv(
    tensor: ArrayViewD<f32>,
    view: DeconvView,
    settings: &RenderSettings,
) -> Result<PixelBuffer> {
    if tensor.is_empty() {
        return Err(VisError::no_data("deconvolution"));
    }
    let size = settings.canonical_size as usize;
    let tensor = tensor.into_dimensionality::<Ix3>()?;
    let resized = resize_bilinear(tensor, size, size);
    let side = size as u32;

    let image = match view {
        DeconvView::Raw => {
            let channels = resized.len_of(Axis(0));
            let planes: Vec<Array2<u8>> = resized
                .axis_iter(Axis(0))
                .map(|plane| centered_normalize(&plane, settings.epsilon))
                .collect();
            PixelBuffer::from_fn(side, side, |x, y| {
                let (x, y) = (x as usize, y as usize);
                Rgb([
                    planes[0][[y, x]],
                    planes[1 % channels][[y, x]],
                    planes[2 % channels][[y, x]],
                ])
            })
        }
        DeconvView::Gray => {
            let gray = centered_normalize(&channel_mean(resized.view()), settings.epsilon);
            PixelBuffer::from_fn(side, side, |x, y| gray_pixel(gray[[y as usize, x as usize]]))
        }
        DeconvView::Norm | DeconvView::NormBlurred => {
            let mut norm = channel_norm(resized.view());
            if view == DeconvView::NormBlurred {
                norm = gaussian_blur(norm.view(), settings.blur_fraction * size as f32)?;
            }
            let unit = norm01(&norm, settings.epsilon);
            let jet = Jet::default();
            PixelBuffer::from_fn(side, side, |x, y| jet.pixel(unit[[y as usize, x as usize]]))
        }
    };
    Ok(image)
}

/// Display-range activation of one unit. The range is taken over the whole
/// layer, so a weak unit stays dark next to a strong one.
pub fn unit_slice(layer_name: &str, layer: &ActivationTensor, unit: usize) -> Result<ArrayD<f32>> {
    let units = if layer.ndim() == 0 { 0 } else { layer.len_of(Axis(0)) };
    if unit >= units {
        return Err(VisError::UnitOutOfRange {
            layer: layer_name.to_string(),
            unit,
            units,
        });
    }
    Ok(display_normalize(layer).index_axis_move(Axis(0), unit))
}

/// Grid thumbnails of every unit: grayscale maps for convolutional layers,
/// solid swatches for fully connected ones.
pub fn unit_thumbnails(layer: &ActivationTensor, settings: &RenderSettings) -> Result<Vec<PixelBuffer>> {
    let normalized = display_normalize(layer);
    match normalized.ndim() {
        1 => {
            let side = settings.scalar_unit_size.max(1);
            Ok(normalized
                .iter()
                .map(|&v| PixelBuffer::from_pixel(side, side, gray_pixel(to_u8(v))))
                .collect())
        }
        3 => normalized
            .axis_iter(Axis(0))
            .map(|map| Ok(gray_image(map.into_dimensionality::<Ix2>()?)))
            .collect(),
        _ => Err(incompatible()),
    }
}

/// Writes a frame as PNG.
pub fn save_png<P: AsRef<Path>>(frame: &PixelBuffer, path: P) -> Result<()> {
    frame.save_with_format(path, image::ImageFormat::Png)?;
    Ok(())
}

/// The detail panel. Keeps the data it was last given so that mode changes
/// re-render without another round trip to the backend, and keeps the last
/// good frame when a render has nothing to show.
#[derive(Debug, Clone)]
pub struct DetailView {
    settings: RenderSettings,
    mode: RenderMode,
    activation: Option<(ArrayD<f32>, PixelBuffer)>,
    deconv: Option<ArrayD<f32>>,
    frame: Option<PixelBuffer>,
}

impl DetailView {
    pub fn new(settings: RenderSettings) -> Self {
        DetailView {
            settings,
            mode: RenderMode::default(),
            activation: None,
            deconv: None,
            frame: None,
        }
    }

    pub fn mode(&self) -> RenderMode {
        self.mode
    }

    /// Last successfully rendered frame.
    pub fn frame(&self) -> Option<&PixelBuffer> {
        self.frame.as_ref()
    }

    /// New activation slice (display range) and the image it belongs to.
    pub fn set_activation(&mut self, slice: ArrayD<f32>, input: PixelBuffer) {
        self.activation = Some((slice, input));
    }

    pub fn set_deconv(&mut self, tensor: ArrayD<f32>) {
        self.deconv = Some(tensor);
    }

    /// Forgets the deconvolution, e.g. after the unit changed.
    pub fn clear_deconv(&mut self) {
        self.deconv = None;
    }

    pub fn set_mode(&mut self, mode: RenderMode) -> Result<&PixelBuffer> {
        self.mode = mode;
        self.render()
    }

    /// Renders the held data in the current mode. On failure the previous
    /// frame stays in place.
    pub fn render(&mut self) -> Result<&PixelBuffer> {
        let frame = match self.mode {
            RenderMode::Activation(overlay) => {
                let (slice, input) = self
                    .activation
                    .as_ref()
                    .ok_or_else(|| VisError::no_data("activation"))?;
                render_activation(slice.view(), input, overlay, &self.settings)?
            }
            RenderMode::Deconv(view) => {
                let tensor = self
                    .deconv
                    .as_ref()
                    .ok_or_else(|| VisError::no_data("deconvolution"))?;
                render_deconv(tensor.view(), view, &self.settings)?
            }
        };
        let frame: &PixelBuffer = self.frame.insert(frame);
        Ok(frame)
    }
}

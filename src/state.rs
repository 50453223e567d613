//! UI state of the visualizer and the gate that keeps renders away from
//! half-arrived inference results.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::engine::BackpropMode;
use crate::layout::Viewport;
use crate::render::RenderMode;

/// What the main panel shows for the selected layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerView {
    Activations,
    TopImages,
}

/// Which precomputed gallery is shown for a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopImagesSource {
    Input,
    Deconv,
}

impl TopImagesSource {
    pub fn use_deconv(self) -> bool {
        self == TopImagesSource::Deconv
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionState {
    pub layer: Option<String>,
    pub unit: Option<usize>,
    pub clicked_grid_index: usize,
}

/// Everything the user can change, as plain data.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewState {
    pub selection: SelectionState,
    pub render_mode: RenderMode,
    pub backprop_mode: BackpropMode,
    pub layer_view: LayerView,
    pub top_images_source: TopImagesSource,
    pub viewport: Viewport,
}

/// User interaction, already decoded from whatever toolkit produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    UnitSelected(usize),
    LayerSelected(String),
    ModeChanged(RenderMode),
    BackpropModeChanged(BackpropMode),
    ViewportResized(u32, u32),
    LayerViewChanged(LayerView),
    TopImagesSourceChanged(TopImagesSource),
    ResetSelection,
}

impl ViewState {
    pub fn new(viewport: Viewport) -> Self {
        ViewState {
            selection: SelectionState::default(),
            render_mode: RenderMode::default(),
            backprop_mode: BackpropMode::Gradient,
            layer_view: LayerView::Activations,
            top_images_source: TopImagesSource::Input,
            viewport,
        }
    }

    /// The state after `command`. Pure: effects are up to the caller.
    ///
    /// The unit selection survives layer switches; only `ResetSelection`
    /// drops it.
    pub fn reduce(&self, command: &Command) -> ViewState {
        let mut next = self.clone();
        match command {
            Command::UnitSelected(index) => {
                next.selection.unit = Some(*index);
                next.selection.clicked_grid_index = *index;
            }
            Command::LayerSelected(name) => next.selection.layer = Some(name.clone()),
            Command::ModeChanged(mode) => next.render_mode = *mode,
            Command::BackpropModeChanged(mode) => next.backprop_mode = *mode,
            Command::ViewportResized(width, height) => next.viewport = Viewport::new(*width, *height),
            Command::LayerViewChanged(view) => next.layer_view = *view,
            Command::TopImagesSourceChanged(source) => next.top_images_source = *source,
            Command::ResetSelection => {
                next.selection.unit = None;
                next.selection.clicked_grid_index = 0;
            }
        }
        next
    }
}

/// Identifies one request to the inference worker. Clones share the
/// cancellation flag.
#[derive(Debug, Clone)]
pub struct RequestToken {
    id: u64,
    cancelled: Arc<AtomicBool>,
}

impl RequestToken {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl PartialEq for RequestToken {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for RequestToken {}

/// Hands out tokens with increasing ids.
#[derive(Debug, Default)]
pub struct TokenSource {
    last: u64,
}

impl TokenSource {
    pub fn issue(&mut self) -> RequestToken {
        self.last += 1;
        RequestToken {
            id: self.last,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatePhase {
    Idle,
    Loading,
    Rendering,
}

/// `Idle -> Loading -> Idle` around a forward pass, `Idle -> Rendering ->
/// Idle` around a render. Renders are refused while loading.
#[derive(Debug)]
pub struct BusyGate {
    phase: GatePhase,
    loading: Option<RequestToken>,
}

impl Default for BusyGate {
    fn default() -> Self {
        BusyGate {
            phase: GatePhase::Idle,
            loading: None,
        }
    }
}

impl BusyGate {
    pub fn phase(&self) -> GatePhase {
        self.phase
    }

    pub fn is_busy(&self) -> bool {
        self.phase != GatePhase::Idle
    }

    pub fn status(&self) -> &'static str {
        if self.phase == GatePhase::Loading {
            "Busy"
        } else {
            "Ready"
        }
    }

    /// Starts waiting for `token`. A load still in flight is cancelled.
    pub fn begin_loading(&mut self, token: RequestToken) {
        if let Some(previous) = self.loading.replace(token) {
            previous.cancel();
        }
        self.phase = GatePhase::Loading;
    }

    /// Ends the load started with `token`; any other token is ignored.
    pub fn finish_loading(&mut self, token: &RequestToken) -> bool {
        match &self.loading {
            Some(current) if current == token => {
                self.loading = None;
                self.phase = GatePhase::Idle;
                true
            }
            _ => false,
        }
    }

    pub fn begin_render(&mut self) -> bool {
        if self.phase != GatePhase::Idle {
            tracing::trace!(phase = ?self.phase, "render dropped");
            return false;
        }
        self.phase = GatePhase::Rendering;
        true
    }

    pub fn end_render(&mut self) {
        if self.phase == GatePhase::Rendering {
            self.phase = GatePhase::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{DeconvView, OverlayMode};

    fn state() -> ViewState {
        ViewState::new(Viewport::new(800, 600))
    }

    #[test]
    fn unit_selection_survives_layer_switch() {
        let s = state()
            .reduce(&Command::LayerSelected("conv1".into()))
            .reduce(&Command::UnitSelected(5))
            .reduce(&Command::LayerSelected("conv2".into()));
        assert_eq!(s.selection.layer.as_deref(), Some("conv2"));
        assert_eq!(s.selection.unit, Some(5));
        assert_eq!(s.selection.clicked_grid_index, 5);

        let reset = s.reduce(&Command::ResetSelection);
        assert_eq!(reset.selection.unit, None);
        assert_eq!(reset.selection.clicked_grid_index, 0);
        assert_eq!(reset.selection.layer.as_deref(), Some("conv2"));
    }

    #[test]
    fn reduce_leaves_the_original_untouched() {
        let s = state();
        let next = s
            .reduce(&Command::ModeChanged(RenderMode::Deconv(DeconvView::Norm)))
            .reduce(&Command::BackpropModeChanged(BackpropMode::ZfDeconv))
            .reduce(&Command::ViewportResized(300, 200))
            .reduce(&Command::LayerViewChanged(LayerView::TopImages))
            .reduce(&Command::TopImagesSourceChanged(TopImagesSource::Deconv));
        assert_eq!(s, state());
        assert_eq!(next.render_mode, RenderMode::Deconv(DeconvView::Norm));
        assert_eq!(next.backprop_mode, BackpropMode::ZfDeconv);
        assert_eq!(next.viewport, Viewport::new(300, 200));
        assert_eq!(next.layer_view, LayerView::TopImages);
        assert!(next.top_images_source.use_deconv());
        let back = next.reduce(&Command::ModeChanged(RenderMode::Activation(OverlayMode::OverActive)));
        assert!(!back.render_mode.is_deconv());
    }

    #[test]
    fn tokens_are_ordered_and_share_cancellation() {
        let mut source = TokenSource::default();
        let a = source.issue();
        let b = source.issue();
        assert!(b.id() > a.id());
        let shared = a.clone();
        a.cancel();
        assert!(shared.is_cancelled());
        assert!(!b.is_cancelled());
    }

    #[test]
    fn gate_drops_renders_while_loading() {
        let mut source = TokenSource::default();
        let mut gate = BusyGate::default();
        assert_eq!(gate.status(), "Ready");

        let first = source.issue();
        gate.begin_loading(first.clone());
        assert_eq!(gate.status(), "Busy");
        assert!(!gate.begin_render());

        let second = source.issue();
        gate.begin_loading(second.clone());
        assert!(first.is_cancelled());
        assert!(!gate.finish_loading(&first));
        assert_eq!(gate.phase(), GatePhase::Loading);
        assert!(gate.finish_loading(&second));

        assert!(gate.begin_render());
        assert_eq!(gate.phase(), GatePhase::Rendering);
        assert!(!gate.begin_render());
        gate.end_render();
        assert!(!gate.is_busy());
    }
}

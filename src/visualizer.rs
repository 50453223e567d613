//! Toolkit-independent front end: turns [`Command`]s into renders.
//!
//! The host calls [`Visualizer::dispatch`] for user input and
//! [`Visualizer::poll`] from its event loop, then repaints from the
//! accessors. Inference happens on the [`InferenceWorker`] thread; results
//! only become visible once a whole [`Snapshot`] has arrived.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::VisConfig;
use crate::engine::{format_predictions, BackpropMode, InferenceEngine, LayerInfo, SessionId};
use crate::error::{Result, VisError};
use crate::grid::{LayerGrid, SelectionChanged};
use crate::layout::Viewport;
use crate::render::{unit_slice, unit_thumbnails, DetailView};
use crate::state::{BusyGate, Command, LayerView, ViewState};
use crate::worker::{InferenceWorker, Outcome, Reply, Request, RequestKind, Snapshot};
use crate::{ActivationTensor, PixelBuffer};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DeconvKey {
    session: SessionId,
    layer: String,
    unit: usize,
    mode: BackpropMode,
}

const READY: &str = "Ready";

pub struct Visualizer {
    config: VisConfig,
    worker: InferenceWorker,
    state: ViewState,
    gate: BusyGate,
    grid: LayerGrid,
    detail: DetailView,
    snapshot: Option<Arc<Snapshot>>,
    thumbnails: HashMap<String, Vec<PixelBuffer>>,
    deconvs: HashMap<DeconvKey, ActivationTensor>,
    pending_deconv: Option<DeconvKey>,
    /// Best image per unit, keyed by layer and gallery source.
    layer_tops: HashMap<(String, bool), Vec<Option<PixelBuffer>>>,
    pending_layer_tops: Option<(String, bool)>,
    top_images: Vec<PixelBuffer>,
    message: String,
}

impl Visualizer {
    /// Starts the worker thread and selects the first layer.
    pub fn new(engine: Box<dyn InferenceEngine>, config: VisConfig) -> Result<Self> {
        config.render.validate()?;
        let worker = InferenceWorker::spawn(engine, &config.worker)?;
        let (width, height) = config.layout.initial_viewport;
        let viewport = Viewport::new(width, height);
        let mut state = ViewState::new(viewport);
        state.selection.layer = worker.layers().first().map(|l| l.name.clone());
        Ok(Visualizer {
            grid: LayerGrid::new(viewport, &config.layout),
            detail: DetailView::new(config.render.clone()),
            config,
            worker,
            state,
            gate: BusyGate::default(),
            snapshot: None,
            thumbnails: HashMap::new(),
            deconvs: HashMap::new(),
            pending_deconv: None,
            layer_tops: HashMap::new(),
            pending_layer_tops: None,
            top_images: Vec::new(),
            message: READY.to_string(),
        })
    }

    pub fn layers(&self) -> &[LayerInfo] {
        self.worker.layers()
    }

    pub fn state(&self) -> &ViewState {
        &self.state
    }

    pub fn grid(&self) -> &LayerGrid {
        &self.grid
    }

    /// The unit grid painted into one image.
    pub fn grid_image(&self) -> PixelBuffer {
        self.grid.compose()
    }

    /// Last good frame of the detail view.
    pub fn detail_frame(&self) -> Option<&PixelBuffer> {
        self.detail.frame()
    }

    pub fn top_images(&self) -> &[PixelBuffer] {
        &self.top_images
    }

    /// Whether a reply of `kind` is still on its way.
    pub fn is_pending(&self, kind: RequestKind) -> bool {
        self.worker.is_pending(kind)
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_deref()
    }

    /// "Busy" while a forward pass is running, otherwise "Ready" or the
    /// last backend error.
    pub fn status(&self) -> &str {
        if self.gate.is_busy() {
            self.gate.status()
        } else {
            &self.message
        }
    }

    pub fn predictions_text(&self) -> String {
        match &self.snapshot {
            Some(snapshot) => format_predictions(&snapshot.predictions, self.config.gallery.shown_predictions),
            None => String::new(),
        }
    }

    /// Runs the network on a new input image. Pending deconvolutions of the
    /// previous image are dropped.
    pub fn set_input(&mut self, image: PixelBuffer) -> Result<()> {
        self.worker.cancel(RequestKind::Deconv);
        self.pending_deconv = None;
        let token = self.worker.submit(Request::Forward(image))?;
        tracing::info!(token = token.id(), "forward pass requested");
        self.gate.begin_loading(token);
        Ok(())
    }

    /// Applies every reply the worker has delivered. Returns how many.
    pub fn poll(&mut self) -> Result<usize> {
        let replies = self.worker.poll();
        let count = replies.len();
        for reply in replies {
            self.apply(reply)?;
        }
        Ok(count)
    }

    /// Blocks until one reply has been applied or `timeout` passes.
    pub fn wait_for_update(&mut self, timeout: Duration) -> Result<bool> {
        match self.worker.wait(timeout) {
            Some(reply) => {
                self.apply(reply)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn dispatch(&mut self, command: Command) -> Result<()> {
        tracing::debug!(?command, "dispatch");
        if let Command::UnitSelected(index) = command {
            self.grid.click(index)?;
        }
        self.state = self.state.reduce(&command);
        let outcome = match command {
            Command::UnitSelected(_) => self.refresh_unit(),
            Command::LayerSelected(_) => self.refresh_layer(),
            Command::ModeChanged(_) | Command::BackpropModeChanged(_) => self.refresh_detail(),
            Command::ViewportResized(width, height) => self.resize(Viewport::new(width, height)),
            Command::LayerViewChanged(_) => self.refresh_grid(),
            Command::TopImagesSourceChanged(_) => {
                let grid = self.refresh_grid();
                let top = self.request_top_images();
                grid.and(top)
            }
            Command::ResetSelection => {
                if self.grid.unit_count() > 0 {
                    self.grid.click(0)?;
                }
                self.refresh_unit()
            }
        };
        self.report(outcome)
    }

    fn apply(&mut self, reply: Reply) -> Result<()> {
        let Reply { token, result, .. } = reply;
        match result {
            Ok(Outcome::Forward(snapshot)) => {
                if !self.gate.finish_loading(&token) {
                    return Ok(());
                }
                tracing::info!(session = snapshot.session.0, "snapshot received");
                self.snapshot = Some(snapshot);
                self.thumbnails.clear();
                self.deconvs.clear();
                self.message = READY.to_string();
                let outcome = self.refresh_layer();
                self.report(outcome)
            }
            Ok(Outcome::Deconv {
                session,
                layer,
                unit,
                mode,
                tensor,
            }) => {
                let key = DeconvKey {
                    session,
                    layer,
                    unit,
                    mode,
                };
                if self.pending_deconv.as_ref() == Some(&key) {
                    self.pending_deconv = None;
                }
                let current = self.current_deconv_key().as_ref() == Some(&key);
                self.deconvs.insert(key, tensor);
                if current {
                    let outcome = self.refresh_detail();
                    return self.report(outcome);
                }
                Ok(())
            }
            Ok(Outcome::TopImages {
                layer,
                unit,
                use_deconv,
                images,
            }) => {
                let current = self.state.selection.layer.as_deref() == Some(layer.as_str())
                    && self.state.selection.clicked_grid_index == unit
                    && self.state.top_images_source.use_deconv() == use_deconv;
                if current {
                    self.top_images = images;
                }
                Ok(())
            }
            Ok(Outcome::LayerTopImages {
                layer,
                use_deconv,
                images,
            }) => {
                let key = (layer, use_deconv);
                if self.pending_layer_tops.as_ref() == Some(&key) {
                    self.pending_layer_tops = None;
                }
                let current = self.state.layer_view == LayerView::TopImages
                    && self.state.selection.layer.as_deref() == Some(key.0.as_str())
                    && self.state.top_images_source.use_deconv() == use_deconv;
                self.layer_tops.insert(key, images);
                if current {
                    let outcome = self.refresh_grid();
                    return self.report(outcome);
                }
                Ok(())
            }
            Err(err) => {
                self.gate.finish_loading(&token);
                self.report(Err(err))
            }
        }
    }

    /// Swallows transient errors and turns backend failures into the status
    /// message; programmer errors propagate.
    fn report(&mut self, outcome: Result<()>) -> Result<()> {
        match outcome {
            Ok(()) => Ok(()),
            Err(err) if err.is_transient() => {
                tracing::debug!(%err, "nothing to show yet");
                Ok(())
            }
            Err(err @ VisError::InvalidLayoutInput(_))
            | Err(err @ VisError::WorkerStopped)
            | Err(err @ VisError::Config(_))
            | Err(err @ VisError::InvalidConfig(_)) => Err(err),
            Err(err) => {
                tracing::warn!(%err, "backend error");
                self.message = err.to_string();
                Ok(())
            }
        }
    }

    fn resize(&mut self, viewport: Viewport) -> Result<()> {
        if let Some(SelectionChanged(index)) = self.grid.resize(viewport)? {
            self.sync_selection(index);
        }
        Ok(())
    }

    fn sync_selection(&mut self, index: usize) {
        let selection = &mut self.state.selection;
        selection.clicked_grid_index = index;
        if selection.unit.is_some() {
            selection.unit = Some(index);
        }
    }

    fn selected_layer(&self) -> Result<(Arc<Snapshot>, String)> {
        let snapshot = self
            .snapshot
            .clone()
            .ok_or_else(|| VisError::no_data("input image"))?;
        let layer = self
            .state
            .selection
            .layer
            .clone()
            .ok_or_else(|| VisError::no_data("layer selection"))?;
        Ok((snapshot, layer))
    }

    /// Rebuilds the grid for the selected layer, then the unit views.
    fn refresh_layer(&mut self) -> Result<()> {
        let grid = self.refresh_grid();
        let unit = self.refresh_unit();
        grid.and(unit)
    }

    /// Fills the grid with activation thumbnails, or with each unit's best
    /// image in the top-images view. Units without a cached image keep
    /// their thumbnail.
    fn refresh_grid(&mut self) -> Result<()> {
        let (snapshot, layer) = self.selected_layer()?;
        let mut units = match self.thumbnails.get(&layer) {
            Some(cached) => cached.clone(),
            None => {
                let rendered = unit_thumbnails(snapshot.activation(&layer)?, &self.config.render)?;
                self.thumbnails.insert(layer.clone(), rendered.clone());
                rendered
            }
        };
        if self.state.layer_view == LayerView::TopImages {
            let key = (layer.clone(), self.state.top_images_source.use_deconv());
            match self.layer_tops.get(&key) {
                Some(tops) => {
                    for (unit, top) in units.iter_mut().zip(tops) {
                        if let Some(image) = top {
                            *unit = image.clone();
                        }
                    }
                }
                None => self.request_layer_tops(key, units.len())?,
            }
        }
        let reflow = self.grid.set_units(units)?;
        tracing::debug!(layer = %layer, kind = ?reflow.kind, view = ?self.state.layer_view, "layer shown");
        if let Some(SelectionChanged(index)) = reflow.selection {
            self.sync_selection(index);
        }
        Ok(())
    }

    fn request_layer_tops(&mut self, key: (String, bool), units: usize) -> Result<()> {
        let in_flight = self.worker.is_pending(RequestKind::LayerTopImages)
            && self.pending_layer_tops.as_ref() == Some(&key);
        if in_flight {
            return Ok(());
        }
        self.worker.submit(Request::LayerTopImages {
            layer: key.0.clone(),
            units,
            use_deconv: key.1,
        })?;
        self.pending_layer_tops = Some(key);
        Ok(())
    }

    fn refresh_unit(&mut self) -> Result<()> {
        let detail = self.refresh_detail();
        let top = self.request_top_images();
        detail.and(top)
    }

    fn current_deconv_key(&self) -> Option<DeconvKey> {
        let snapshot = self.snapshot.as_ref()?;
        Some(DeconvKey {
            session: snapshot.session,
            layer: self.state.selection.layer.clone()?,
            unit: self.state.selection.clicked_grid_index,
            mode: self.state.backprop_mode,
        })
    }

    /// Re-renders the detail view. Dropped while a forward pass is in
    /// flight; the arriving snapshot renders again.
    fn refresh_detail(&mut self) -> Result<()> {
        if !self.gate.begin_render() {
            return Ok(());
        }
        let outcome = self.render_detail();
        self.gate.end_render();
        outcome
    }

    fn render_detail(&mut self) -> Result<()> {
        let (snapshot, layer) = self.selected_layer()?;
        let unit = self.state.selection.clicked_grid_index;
        let slice = unit_slice(&layer, snapshot.activation(&layer)?, unit)?;
        self.detail.set_activation(slice, snapshot.input.clone());

        if self.state.render_mode.is_deconv() {
            let key = DeconvKey {
                session: snapshot.session,
                layer: layer.clone(),
                unit,
                mode: self.state.backprop_mode,
            };
            match self.deconvs.get(&key) {
                Some(tensor) => self.detail.set_deconv(tensor.clone()),
                None => {
                    self.detail.clear_deconv();
                    let in_flight = self.worker.is_pending(RequestKind::Deconv)
                        && self.pending_deconv.as_ref() == Some(&key);
                    if !in_flight {
                        self.worker.submit(Request::Deconv {
                            session: key.session,
                            layer: key.layer.clone(),
                            unit: key.unit,
                            mode: key.mode,
                        })?;
                        self.pending_deconv = Some(key);
                    }
                }
            }
        }
        self.detail.set_mode(self.state.render_mode).map(|_| ())
    }

    /// Asks for the gallery of the clicked unit. Runs on every unit, layer
    /// or source change, whichever view the grid is in.
    fn request_top_images(&mut self) -> Result<()> {
        let layer = match &self.state.selection.layer {
            Some(layer) => layer.clone(),
            None => return Err(VisError::no_data("layer selection")),
        };
        self.top_images.clear();
        self.worker.submit(Request::TopImages {
            layer,
            unit: self.state.selection.clicked_grid_index,
            k: self.config.gallery.top_k,
            use_deconv: self.state.top_images_source.use_deconv(),
        })?;
        Ok(())
    }
}

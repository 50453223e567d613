//! Background thread that owns the inference engine.
//!
//! There is one pending slot per request kind. Submitting a request
//! replaces whatever was still waiting in its slot and cancels the token of
//! the previous request of that kind, so only the latest request of each
//! kind ever produces a reply.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::WorkerSettings;
use crate::engine::{BackpropMode, InferenceEngine, LayerInfo, Prediction, SessionId};
use crate::error::{Result, VisError};
use crate::state::{RequestToken, TokenSource};
use crate::{ActivationTensor, PixelBuffer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Forward,
    Deconv,
    TopImages,
    LayerTopImages,
}

impl RequestKind {
    const COUNT: usize = 4;

    fn slot(self) -> usize {
        match self {
            RequestKind::Forward => 0,
            RequestKind::Deconv => 1,
            RequestKind::TopImages => 2,
            RequestKind::LayerTopImages => 3,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Request {
    Forward(PixelBuffer),
    Deconv {
        session: SessionId,
        layer: String,
        unit: usize,
        mode: BackpropMode,
    },
    TopImages {
        layer: String,
        unit: usize,
        k: usize,
        use_deconv: bool,
    },
    /// The best image of every unit of a layer, for the grid.
    LayerTopImages {
        layer: String,
        units: usize,
        use_deconv: bool,
    },
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Forward(_) => RequestKind::Forward,
            Request::Deconv { .. } => RequestKind::Deconv,
            Request::TopImages { .. } => RequestKind::TopImages,
            Request::LayerTopImages { .. } => RequestKind::LayerTopImages,
        }
    }
}

/// Everything one forward pass produced. Never modified after creation.
#[derive(Debug)]
pub struct Snapshot {
    pub session: SessionId,
    pub input: PixelBuffer,
    pub layers: Vec<LayerInfo>,
    pub activations: HashMap<String, ActivationTensor>,
    pub predictions: Vec<Prediction>,
}

impl Snapshot {
    pub fn activation(&self, layer: &str) -> Result<&ActivationTensor> {
        self.activations
            .get(layer)
            .ok_or_else(|| VisError::LayerNotFound(layer.to_string()))
    }
}

#[derive(Debug)]
pub enum Outcome {
    Forward(Arc<Snapshot>),
    Deconv {
        session: SessionId,
        layer: String,
        unit: usize,
        mode: BackpropMode,
        tensor: ActivationTensor,
    },
    TopImages {
        layer: String,
        unit: usize,
        use_deconv: bool,
        images: Vec<PixelBuffer>,
    },
    /// One entry per unit, `None` where the store has nothing.
    LayerTopImages {
        layer: String,
        use_deconv: bool,
        images: Vec<Option<PixelBuffer>>,
    },
}

#[derive(Debug)]
pub struct Reply {
    pub kind: RequestKind,
    pub token: RequestToken,
    pub result: Result<Outcome>,
}

type Slot = Option<(RequestToken, Request)>;

#[derive(Default)]
struct Queue {
    slots: [Slot; RequestKind::COUNT],
    shutdown: bool,
}

impl Queue {
    fn take_next(&mut self) -> Option<(RequestToken, Request)> {
        self.slots.iter_mut().find_map(Option::take)
    }
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    wake: Condvar,
}

pub struct InferenceWorker {
    shared: Arc<Shared>,
    replies: Receiver<Reply>,
    latest: [Option<RequestToken>; RequestKind::COUNT],
    tokens: TokenSource,
    layers: Vec<LayerInfo>,
    handle: Option<JoinHandle<()>>,
}

impl InferenceWorker {
    pub fn spawn(engine: Box<dyn InferenceEngine>, settings: &WorkerSettings) -> Result<Self> {
        let layers = engine.list_layers();
        let shared = Arc::new(Shared::default());
        let (sender, replies) = mpsc::channel();
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(settings.thread_name.clone())
            .spawn(move || run(engine, thread_shared, sender))?;
        tracing::info!(thread = %settings.thread_name, layers = layers.len(), "inference worker started");
        Ok(InferenceWorker {
            shared,
            replies,
            latest: Default::default(),
            tokens: TokenSource::default(),
            layers,
            handle: Some(handle),
        })
    }

    /// Layers of the engine, read once at start-up.
    pub fn layers(&self) -> &[LayerInfo] {
        &self.layers
    }

    /// Queues `request`, superseding the previous request of its kind.
    pub fn submit(&mut self, request: Request) -> Result<RequestToken> {
        let kind = request.kind();
        let token = self.tokens.issue();
        {
            let mut queue = self.shared.queue.lock().map_err(|_| VisError::WorkerStopped)?;
            if queue.shutdown {
                return Err(VisError::WorkerStopped);
            }
            if let Some((superseded, _)) = queue.slots[kind.slot()].replace((token.clone(), request)) {
                tracing::debug!(token = superseded.id(), ?kind, "pending request superseded");
            }
        }
        if let Some(previous) = self.latest[kind.slot()].replace(token.clone()) {
            previous.cancel();
        }
        self.shared.wake.notify_one();
        Ok(token)
    }

    /// Cancels the latest request of `kind`, pending or running.
    pub fn cancel(&mut self, kind: RequestKind) {
        if let Some(token) = self.latest[kind.slot()].take() {
            token.cancel();
        }
        if let Ok(mut queue) = self.shared.queue.lock() {
            queue.slots[kind.slot()] = None;
        }
    }

    /// Whether a reply is still expected for `kind`.
    pub fn is_pending(&self, kind: RequestKind) -> bool {
        self.latest[kind.slot()].is_some()
    }

    fn accept(&mut self, reply: &Reply) -> bool {
        let slot = reply.kind.slot();
        let current = match &self.latest[slot] {
            Some(token) => token == &reply.token && !token.is_cancelled(),
            None => false,
        };
        if current {
            self.latest[slot] = None;
        } else {
            tracing::debug!(token = reply.token.id(), kind = ?reply.kind, "stale reply discarded");
        }
        current
    }

    /// Replies that arrived since the last call, stale ones removed.
    pub fn poll(&mut self) -> Vec<Reply> {
        let arrived: Vec<Reply> = self.replies.try_iter().collect();
        arrived.into_iter().filter(|reply| self.accept(reply)).collect()
    }

    /// Blocks until a current reply arrives or `timeout` passes.
    pub fn wait(&mut self, timeout: Duration) -> Option<Reply> {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.checked_duration_since(Instant::now())?;
            match self.replies.recv_timeout(left) {
                Ok(reply) if self.accept(&reply) => return Some(reply),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }
}

impl Drop for InferenceWorker {
    fn drop(&mut self) {
        if let Ok(mut queue) = self.shared.queue.lock() {
            queue.shutdown = true;
        }
        for token in self.latest.iter().flatten() {
            token.cancel();
        }
        self.shared.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("inference worker panicked");
            }
        }
    }
}

fn next_request(shared: &Shared) -> Option<(RequestToken, Request)> {
    let mut queue = shared.queue.lock().ok()?;
    loop {
        if queue.shutdown {
            return None;
        }
        if let Some(next) = queue.take_next() {
            return Some(next);
        }
        queue = shared.wake.wait(queue).ok()?;
    }
}

fn run(mut engine: Box<dyn InferenceEngine>, shared: Arc<Shared>, replies: Sender<Reply>) {
    while let Some((token, request)) = next_request(&shared) {
        let kind = request.kind();
        if token.is_cancelled() {
            continue;
        }
        let started = Instant::now();
        let result = handle(engine.as_mut(), request);
        tracing::debug!(
            token = token.id(),
            ?kind,
            ok = result.is_ok(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request done"
        );
        if token.is_cancelled() {
            continue;
        }
        if replies.send(Reply { kind, token, result }).is_err() {
            break;
        }
    }
    tracing::info!("inference worker stopped");
}

fn handle(engine: &mut dyn InferenceEngine, request: Request) -> Result<Outcome> {
    match request {
        Request::Forward(image) => {
            let session = engine.forward(&image)?;
            let layers = engine.list_layers();
            let mut activations = HashMap::with_capacity(layers.len());
            for info in &layers {
                activations.insert(info.name.clone(), engine.activation(session, &info.name)?);
            }
            let predictions = engine.classify(session)?;
            Ok(Outcome::Forward(Arc::new(Snapshot {
                session,
                input: image,
                layers,
                activations,
                predictions,
            })))
        }
        Request::Deconv {
            session,
            layer,
            unit,
            mode,
        } => {
            let tensor = engine.deconv(session, &layer, unit, mode)?;
            Ok(Outcome::Deconv {
                session,
                layer,
                unit,
                mode,
                tensor,
            })
        }
        Request::TopImages {
            layer,
            unit,
            k,
            use_deconv,
        } => {
            let images = engine.top_k_images(&layer, unit, k, use_deconv)?;
            Ok(Outcome::TopImages {
                layer,
                unit,
                use_deconv,
                images,
            })
        }
        Request::LayerTopImages {
            layer,
            units,
            use_deconv,
        } => {
            let mut images = Vec::with_capacity(units);
            for unit in 0..units {
                images.push(engine.top_k_images(&layer, unit, 1, use_deconv)?.into_iter().next());
            }
            Ok(Outcome::LayerTopImages {
                layer,
                use_deconv,
                images,
            })
        }
    }
}

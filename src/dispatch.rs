//! The engine-facing half of the bridge.
//!
//! An engine reports what happens inside it through its [`EventSink`], from
//! any thread. Under [`DeliveryMode::Queued`](crate::config::DeliveryMode)
//! every event goes into the handle's FIFO and is delivered by the handle's
//! [`DispatchWorker`]; under `Direct` the sink invokes the callback right on
//! the calling thread.

pub mod frame;

use crate::bridge::entry::HandleEntry;
use crate::bridge::handle::EngineHandle;
use crate::engine::NavigationState;
use crate::script::{JsRequestId, ScriptCompletion, ScriptOutcome, ScriptResult};
use frame::{frame_len, FrameBuffer};
use log::{debug, trace, warn};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::UnboundedReceiver;

/// One queued event.
pub(crate) enum Dispatch {
    Loading(bool),
    Progress(f32),
    /// Deliver the coalesced value of the oldest queued progress window
    ProgressLatest,
    UrlChanged(String),
    TitleChanged(String),
    NavigationState(NavigationState),
    Frame { buffer: FrameBuffer, width: u32, height: u32 },
    Script { result: ScriptResult, completion: Option<ScriptCompletion> },
    /// Last message of a handle's queue
    Shutdown,
}

/// Where an engine sends its notifications.
///
/// Cheap to clone. Does not keep the handle alive: once the handle is
/// destroyed every call is a no-op.
#[derive(Clone)]
pub struct EventSink {
    handle: EngineHandle,
    entry: Weak<HandleEntry>,
}

impl EventSink {
    pub(crate) fn new(entry: &Arc<HandleEntry>) -> Self {
        Self { handle: entry.handle, entry: Arc::downgrade(entry) }
    }

    /// The handle this sink reports for.
    pub fn handle(&self) -> EngineHandle {
        self.handle
    }

    /// Does the handle still accept events?
    pub fn is_live(&self) -> bool {
        self.entry
            .upgrade()
            .is_some_and(|e| e.teardown.lifecycle() == crate::bridge::Lifecycle::Live)
    }

    fn with_entry(&self, f: impl FnOnce(&Arc<HandleEntry>)) {
        match self.entry.upgrade() {
            Some(entry) => f(&entry),
            None => trace!("Event for released {} ignored", self.handle),
        }
    }

    pub fn loading_changed(&self, is_loading: bool) {
        self.with_entry(|e| e.post(Dispatch::Loading(is_loading)));
    }

    /// Reports load progress. Values are clamped to `0.0..=1.0`; NaN is ignored.
    pub fn progress(&self, progress: f32) {
        if progress.is_nan() {
            warn!("Ignoring NaN progress for {}", self.handle);
            return;
        }
        self.with_entry(|e| e.post_progress(progress.clamp(0.0, 1.0)));
    }

    pub fn url_changed(&self, url: impl Into<String>) {
        let url = url.into();
        self.with_entry(|e| e.post(Dispatch::UrlChanged(url)));
    }

    pub fn title_changed(&self, title: impl Into<String>) {
        let title = title.into();
        self.with_entry(|e| e.post(Dispatch::TitleChanged(title)));
    }

    pub fn navigation_state(&self, state: NavigationState) {
        self.with_entry(|e| e.post(Dispatch::NavigationState(state)));
    }

    /// A buffer for a `width` x `height` frame, recycled from the handle's pool
    /// when possible. `None` for frames larger than the bridge accepts.
    pub fn frame_buffer(&self, width: u32, height: u32) -> Option<FrameBuffer> {
        let len = frame_len(width, height)?;
        Some(match self.entry.upgrade() {
            Some(entry) => entry.frames.acquire(len),
            None => FrameBuffer::new(len),
        })
    }

    /// Hands a rendered frame over. The buffer goes back to the pool after the
    /// render callback returned.
    pub fn render_frame(&self, buffer: FrameBuffer, width: u32, height: u32) {
        let Some(required) = frame_len(width, height) else {
            warn!("Dropping oversized {width}x{height} frame for {}", self.handle);
            return;
        };
        if buffer.len() < required {
            warn!(
                "Dropping {}x{} frame for {}: buffer holds {} of {} bytes",
                width,
                height,
                self.handle,
                buffer.len(),
                required
            );
            return;
        }
        self.with_entry(|e| e.post(Dispatch::Frame { buffer, width, height }));
    }

    /// Answers the script request `id`. Only the first answer per request
    /// reaches the host.
    pub fn script_result(&self, id: JsRequestId, outcome: ScriptOutcome) {
        self.with_entry(|e| e.post_script(id, outcome));
    }
}

/// Delivers the queued events of one handle, one at a time.
pub(crate) struct DispatchWorker {
    entry: Arc<HandleEntry>,
    rx: UnboundedReceiver<Dispatch>,
}

impl DispatchWorker {
    pub(crate) fn new(entry: Arc<HandleEntry>, rx: UnboundedReceiver<Dispatch>) -> Self {
        Self { entry, rx }
    }

    pub(crate) async fn run(mut self) {
        debug!("Delivery worker for {} started", self.entry.handle);

        while let Some(msg) = self.rx.recv().await {
            if let Dispatch::Shutdown = msg {
                break;
            }
            let entry = &self.entry;
            tokio::task::block_in_place(|| match entry.enter(true) {
                Some(_guard) => entry.deliver(msg),
                None => trace!("Event for destroyed {} dropped", entry.handle),
            });
        }

        debug!("Delivery worker for {} finished", self.entry.handle);
        let entry = &self.entry;
        tokio::task::block_in_place(|| {
            if entry.teardown.worker_finished() {
                entry.release();
            }
        });
    }
}

//! Per-handle state: the engine, its callback slots, the delivery queue and
//! the teardown coordinator.

use crate::bridge::handle::EngineHandle;
use crate::bridge::teardown::{self, Teardown};
use crate::callbacks::{CallbackSlots, EventKind};
use crate::config::{BridgeConfig, DeliveryMode, ProgressPolicy};
use crate::dispatch::frame::{Frame, FramePool};
use crate::dispatch::Dispatch;
use crate::engine::Engine;
use crate::errors::BridgeError;
use crate::script::{JsRequestId, PendingScripts, ScriptCompletion, ScriptError, ScriptOutcome, ScriptResult};
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

pub(crate) struct HandleEntry {
    pub(crate) handle: EngineHandle,
    pub(crate) teardown: Teardown,
    pub(crate) slots: CallbackSlots,
    pub(crate) pending: PendingScripts,
    pub(crate) frames: FramePool,
    engine: Mutex<Option<Arc<dyn Engine>>>,
    tx: UnboundedSender<Dispatch>,
    progress: Mutex<ProgressWindows>,
    delivery_mode: DeliveryMode,
    progress_policy: ProgressPolicy,
    runtime: tokio::runtime::Handle,
    /// Cancels this handle's script timers
    cancel: CancellationToken,
}

impl HandleEntry {
    pub(crate) fn new(
        handle: EngineHandle,
        config: &BridgeConfig,
        tx: UnboundedSender<Dispatch>,
        runtime: tokio::runtime::Handle,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            handle,
            teardown: Teardown::default(),
            slots: CallbackSlots::default(),
            pending: PendingScripts::default(),
            frames: FramePool::new(config.frame_pool_size),
            engine: Mutex::new(None),
            tx,
            progress: Mutex::new(ProgressWindows::default()),
            delivery_mode: config.delivery_mode,
            progress_policy: config.progress_policy,
            runtime,
            cancel,
        }
    }

    pub(crate) fn attach_engine(&self, engine: Arc<dyn Engine>) {
        *self.engine.lock() = Some(engine);
    }

    /// Takes an in-flight slot for a host operation or a dispatch.
    pub(crate) fn enter(self: &Arc<Self>, allow_draining: bool) -> Option<OpGuard> {
        if !self.teardown.try_enter(allow_draining) {
            return None;
        }
        teardown::mark_active(self.handle);
        Some(OpGuard { entry: self.clone() })
    }

    /// Hands an event to the delivery path. Events arriving after destroy
    /// began are dropped.
    pub(crate) fn post(self: &Arc<Self>, msg: Dispatch) {
        match self.delivery_mode {
            DeliveryMode::Queued => {
                if self.teardown.with_intake(false, || self.send(msg)).is_none() {
                    trace!("Dropping event for {} after destroy", self.handle);
                }
            }
            DeliveryMode::Direct => match self.enter(false) {
                Some(_guard) => self.deliver(msg),
                None => trace!("Dropping event for {} after destroy", self.handle),
            },
        }
    }

    pub(crate) fn post_progress(self: &Arc<Self>, progress: f32) {
        if self.delivery_mode == DeliveryMode::Direct || self.progress_policy == ProgressPolicy::EveryUpdate {
            self.post(Dispatch::Progress(progress));
            return;
        }

        let accepted = self.teardown.with_intake(false, || {
            let mut windows = self.progress.lock();
            if windows.open {
                if let Some(latest) = windows.values.back_mut() {
                    *latest = progress;
                    return;
                }
            }
            windows.values.push_back(progress);
            windows.open = true;
            self.send_locked(Dispatch::ProgressLatest);
        });
        if accepted.is_none() {
            trace!("Dropping progress for {} after destroy", self.handle);
        }
    }

    /// Resolves a script request with the engine's answer. Answers for
    /// requests already resolved (by a timeout or by destroy) are dropped.
    pub(crate) fn post_script(self: &Arc<Self>, id: JsRequestId, outcome: ScriptOutcome) {
        if !self.resolve_script(id, outcome) {
            warn!("Dropping late result of script {id} for {}", self.handle);
        }
    }

    /// Claims `id` and delivers `outcome` for it. Returns `false` if the
    /// request was already resolved.
    fn resolve_script(self: &Arc<Self>, id: JsRequestId, outcome: ScriptOutcome) -> bool {
        match self.delivery_mode {
            DeliveryMode::Queued => self
                .teardown
                .with_intake(true, || match self.pending.resolve(id) {
                    Some(completion) => {
                        self.send(Dispatch::Script { result: ScriptResult { id, outcome }, completion });
                        true
                    }
                    None => false,
                })
                .unwrap_or(false),
            DeliveryMode::Direct => match self.enter(true) {
                Some(_guard) => match self.pending.resolve(id) {
                    Some(completion) => {
                        self.deliver(Dispatch::Script { result: ScriptResult { id, outcome }, completion });
                        true
                    }
                    None => false,
                },
                None => false,
            },
        }
    }

    /// Registers a script request while the handle still accepts work.
    /// Returns the token that stops the request's timer once it is resolved.
    pub(crate) fn register_script(
        &self,
        id: JsRequestId,
        completion: Option<ScriptCompletion>,
    ) -> Result<CancellationToken, BridgeError> {
        let timer = self.cancel.child_token();
        self.teardown
            .with_intake(false, || self.pending.register(id, completion, timer.clone()))
            .ok_or(BridgeError::InvalidHandle)?;
        Ok(timer)
    }

    /// Resolves `id` with a timeout error unless something else resolves it
    /// first. The task ends as soon as `timer` is cancelled.
    pub(crate) fn arm_script_timeout(self: &Arc<Self>, id: JsRequestId, timeout: Duration, timer: CancellationToken) {
        let entry = Arc::downgrade(self);
        self.runtime.spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if let Some(entry) = entry.upgrade() {
                        tokio::task::block_in_place(|| {
                            if entry.resolve_script(id, Err(ScriptError::TimedOut(timeout))) {
                                debug!("Script {id} of {} timed out after {timeout:?}", entry.handle);
                            }
                        });
                    }
                }
            }
        });
    }

    /// Queues `msg`. Any other event closes the open progress window, so later
    /// progress lands behind it.
    fn send(&self, msg: Dispatch) {
        let mut windows = self.progress.lock();
        windows.open = false;
        self.send_locked(msg);
    }

    fn send_locked(&self, msg: Dispatch) {
        if self.tx.send(msg).is_err() {
            warn!("Delivery worker of {} is gone; event dropped", self.handle);
        }
    }

    /// Runs the callback for one event on the current thread.
    pub(crate) fn deliver(&self, msg: Dispatch) {
        match msg {
            Dispatch::Loading(is_loading) => {
                if let Some(cb) = self.slots.loading.get() {
                    self.invoke(EventKind::Loading, || cb(is_loading));
                }
            }
            Dispatch::Progress(progress) => self.deliver_progress(progress),
            Dispatch::ProgressLatest => {
                let latest = self.progress.lock().take_oldest();
                if let Some(progress) = latest {
                    self.deliver_progress(progress);
                }
            }
            Dispatch::UrlChanged(url) => {
                if let Some(cb) = self.slots.url.get() {
                    self.invoke(EventKind::UrlChanged, || cb(&url));
                }
            }
            Dispatch::TitleChanged(title) => {
                if let Some(cb) = self.slots.title.get() {
                    self.invoke(EventKind::TitleChanged, || cb(&title));
                }
            }
            Dispatch::NavigationState(state) => {
                if let Some(cb) = self.slots.navigation.get() {
                    self.invoke(EventKind::NavigationState, || cb(state));
                }
            }
            Dispatch::Frame { buffer, width, height } => {
                if let Some(cb) = self.slots.render.get() {
                    let frame = Frame { pixels: buffer.as_slice(), width, height };
                    self.invoke(EventKind::RenderFrame, || cb(&frame));
                }
                // The loan ends here
                self.frames.recycle(buffer);
            }
            Dispatch::Script { result, completion } => match completion {
                Some(completion) => self.invoke(EventKind::JsResult, || completion(&result)),
                None => {
                    if let Some(cb) = self.slots.script.get() {
                        self.invoke(EventKind::JsResult, || cb(&result));
                    }
                }
            },
            Dispatch::Shutdown => {}
        }
    }

    fn deliver_progress(&self, progress: f32) {
        if let Some(cb) = self.slots.progress.get() {
            self.invoke(EventKind::Progress, || cb(progress));
        }
    }

    fn invoke(&self, kind: EventKind, f: impl FnOnce()) {
        trace!("Dispatching {kind} for {}", self.handle);
        if catch_unwind(AssertUnwindSafe(f)).is_err() {
            error!("The {kind} callback of {} panicked", self.handle);
        }
    }

    /// Runs destroy after the entry has left the registry.
    pub(crate) fn destroy(self: &Arc<Self>, drain_timeout: Duration) -> Result<(), BridgeError> {
        if !self.teardown.begin_drain() {
            return Err(BridgeError::InvalidHandle);
        }
        info!("Destroying {}", self.handle);
        self.cancel.cancel();

        let unresolved = self.teardown.seal(|| {
            let drained = self.pending.drain();
            let unresolved = match self.delivery_mode {
                DeliveryMode::Queued => {
                    for (id, completion) in drained {
                        let result = ScriptResult { id, outcome: Err(ScriptError::HandleDestroyed) };
                        self.send(Dispatch::Script { result, completion });
                    }
                    Vec::new()
                }
                DeliveryMode::Direct => drained,
            };
            self.send(Dispatch::Shutdown);
            unresolved
        });

        for (id, completion) in unresolved {
            if let Some(_guard) = self.enter(true) {
                let result = ScriptResult { id, outcome: Err(ScriptError::HandleDestroyed) };
                self.deliver(Dispatch::Script { result, completion });
            }
        }

        if teardown::is_active(self.handle) {
            debug!("{} destroyed from inside one of its own calls; release deferred", self.handle);
            if self.teardown.defer_release() {
                self.release();
            }
            return Ok(());
        }

        if self.teardown.wait_idle(drain_timeout) {
            self.release();
            Ok(())
        } else {
            error!(
                "{} did not drain within {:?}; release deferred to the last in-flight dispatch",
                self.handle, drain_timeout
            );
            Err(BridgeError::Timeout(drain_timeout))
        }
    }

    /// Frees the engine and everything that references host code. Runs once,
    /// by whoever won the Draining→Destroyed transition.
    pub(crate) fn release(&self) {
        debug!("Releasing {}", self.handle);
        let engine = self.engine.lock().take();
        if let Some(engine) = engine {
            engine.shutdown();
        }
        self.slots.clear();
        self.frames.clear();
        *self.progress.lock() = ProgressWindows::default();
    }

    pub(crate) fn engine(&self) -> Result<Arc<dyn Engine>, BridgeError> {
        self.engine.lock().clone().ok_or(BridgeError::InvalidHandle)
    }
}

/// Coalesced progress values, one per `ProgressLatest` marker still queued,
/// oldest first. Only the newest window absorbs updates, and only while no
/// other event was queued behind its marker.
#[derive(Default)]
struct ProgressWindows {
    values: VecDeque<f32>,
    open: bool,
}

impl ProgressWindows {
    fn take_oldest(&mut self) -> Option<f32> {
        let value = self.values.pop_front();
        if self.values.is_empty() {
            self.open = false;
        }
        value
    }
}

/// Holds one in-flight slot of a handle. Dropping it may perform the
/// deferred release.
pub(crate) struct OpGuard {
    entry: Arc<HandleEntry>,
}

impl OpGuard {
    pub(crate) fn entry(&self) -> &Arc<HandleEntry> {
        &self.entry
    }

    pub(crate) fn engine(&self) -> Result<Arc<dyn Engine>, BridgeError> {
        self.entry.engine()
    }
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        teardown::unmark_active(self.entry.handle);
        if self.entry.teardown.exit() {
            self.entry.release();
        }
    }
}

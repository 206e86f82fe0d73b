//! The public Rust API: [`Bridge`].
//!
//! A `Bridge` owns the handle registry, the engine factory and the tokio
//! runtime that delivers events. Every engine instance is addressed through an
//! opaque [`EngineHandle`]; every call on a destroyed or unknown handle fails
//! with [`BridgeError::InvalidHandle`].
//!
//! ```no_run
//! use std::time::Duration;
//! use webengine_bridge::engine::headless::HeadlessEngineFactory;
//! use webengine_bridge::Bridge;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let bridge = Bridge::new(None, Box::new(HeadlessEngineFactory::default()))?;
//! let h = bridge.create()?;
//! bridge.set_title_callback(h, Some(std::sync::Arc::new(|title: &str| println!("title: {title}"))))?;
//! bridge.load_url(h, "https://example.com")?;
//! std::thread::sleep(Duration::from_millis(200));
//! bridge.destroy(h)?;
//! # Ok(()) }
//! ```

pub(crate) mod entry;
pub mod handle;
pub(crate) mod registry;
pub(crate) mod teardown;

#[cfg(test)]
mod tests;

pub use handle::EngineHandle;
pub use teardown::Lifecycle;

use crate::callbacks::{
    EngineObserver, LoadingCallback, NavigationCallback, ProgressCallback, RenderCallback, ScriptCallback,
    TitleCallback, UrlCallback,
};
use crate::config::{validate, BridgeConfig, EngineSettings};
use crate::cookies::{copy_nul_terminated, format_cookie_header, Cookie};
use crate::dispatch::frame::frame_len;
use crate::dispatch::{DispatchWorker, EventSink};
use crate::engine::{Engine, EngineFactory, KeyEvent, TouchEvent};
use crate::errors::BridgeError;
use crate::script::{JsRequestId, ScriptCompletion, ScriptRequest};
use entry::{HandleEntry, OpGuard};
use log::{debug, info, warn};
use registry::HandleRegistry;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct Bridge {
    /// Configuration shared by every handle
    config: Arc<BridgeConfig>,
    registry: HandleRegistry<HandleEntry>,
    factory: Box<dyn EngineFactory>,
    /// Runs the delivery workers and script timers
    runtime: Arc<Runtime>,
    /// Parent of every handle's timer token
    cancel: CancellationToken,
}

impl Bridge {
    /// Creates a bridge over engines built by `factory`.
    ///
    /// If `config` is `None`, [`BridgeConfig::default`] is used.
    pub fn new(config: Option<BridgeConfig>, factory: Box<dyn EngineFactory>) -> Result<Self, BridgeError> {
        let config = config.unwrap_or_default();
        validate(&config)?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.dispatch_threads)
            .thread_name("webengine-dispatch")
            .enable_all()
            .build()
            .map_err(|e| BridgeError::AllocationFailure(format!("dispatch runtime: {e}")))?;

        debug!(
            "Bridge started: {:?} delivery, {} dispatch threads, max {} handles",
            config.delivery_mode, config.dispatch_threads, config.max_handles
        );

        Ok(Self {
            registry: HandleRegistry::new(config.max_handles),
            config: Arc::new(config),
            factory,
            runtime: Arc::new(runtime),
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Creates a fully initialized engine instance.
    pub fn create(&self) -> Result<EngineHandle, BridgeError> {
        let handle = self.registry.reserve()?;
        match self.build_entry(handle) {
            Ok(entry) => {
                let name = entry.engine().map(|e| e.name().to_string()).unwrap_or_default();
                self.registry.commit(handle, entry);
                info!("Created {handle} ({name})");
                Ok(handle)
            }
            Err(e) => {
                self.registry.abandon(handle);
                warn!("Creating {handle} failed: {e}");
                Err(e)
            }
        }
    }

    fn build_entry(&self, handle: EngineHandle) -> Result<Arc<HandleEntry>, BridgeError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let entry = Arc::new(HandleEntry::new(
            handle,
            &self.config,
            tx,
            self.runtime.handle().clone(),
            self.cancel.child_token(),
        ));

        let engine = self
            .factory
            .create(EventSink::new(&entry), &self.config.default_settings)
            .map_err(|e| BridgeError::AllocationFailure(format!("{e:#}")))?;
        entry.attach_engine(engine);

        self.runtime.spawn(DispatchWorker::new(entry.clone(), rx).run());
        Ok(entry)
    }

    /// Destroys the handle.
    ///
    /// Events queued before this call are still delivered; anything the engine
    /// reports afterwards is dropped and pending scripts resolve with
    /// [`ScriptError::HandleDestroyed`](crate::script::ScriptError). Waits at
    /// most `drain_timeout` for in-flight callbacks. Called from inside one of
    /// the handle's own callbacks it returns right away and the release
    /// happens once that callback is done.
    pub fn destroy(&self, handle: EngineHandle) -> Result<(), BridgeError> {
        let entry = self.registry.remove(handle)?;
        entry.destroy(self.config.drain_timeout)
    }

    /// Is `handle` a live handle of this bridge?
    pub fn is_live(&self, handle: EngineHandle) -> bool {
        self.registry.get(handle).is_ok()
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn enter(&self, handle: EngineHandle) -> Result<OpGuard, BridgeError> {
        self.registry.get(handle)?.enter(false).ok_or(BridgeError::InvalidHandle)
    }

    /// Runs `f` against the engine while holding an in-flight slot.
    fn with_engine<R>(&self, handle: EngineHandle, f: impl FnOnce(&dyn Engine) -> R) -> Result<R, BridgeError> {
        let guard = self.enter(handle)?;
        let engine = guard.engine()?;
        Ok(f(engine.as_ref()))
    }

    pub fn load_url(&self, handle: EngineHandle, url: &str) -> Result<(), BridgeError> {
        debug!("{handle}: load {url}");
        self.with_engine(handle, |e| e.load_url(url))
    }

    pub fn go_back(&self, handle: EngineHandle) -> Result<(), BridgeError> {
        self.with_engine(handle, |e| e.go_back())
    }

    pub fn go_forward(&self, handle: EngineHandle) -> Result<(), BridgeError> {
        self.with_engine(handle, |e| e.go_forward())
    }

    pub fn reload(&self, handle: EngineHandle) -> Result<(), BridgeError> {
        self.with_engine(handle, |e| e.reload())
    }

    /// Advisory: a load that already committed is not undone.
    pub fn stop_loading(&self, handle: EngineHandle) -> Result<(), BridgeError> {
        self.with_engine(handle, |e| e.stop_loading())
    }

    /// Starts evaluating `script`.
    ///
    /// Exactly one result is delivered for the returned id: to `completion`
    /// when given, to the JS-result callback otherwise.
    pub fn execute_javascript(
        &self,
        handle: EngineHandle,
        script: &str,
        completion: Option<ScriptCompletion>,
    ) -> Result<JsRequestId, BridgeError> {
        let guard = self.enter(handle)?;
        let engine = guard.engine()?;
        let entry = guard.entry();

        let id = JsRequestId::new();
        let timer = entry.register_script(id, completion)?;
        if let Some(timeout) = self.config.script_timeout {
            entry.arm_script_timeout(id, timeout, timer);
        }

        debug!("{handle}: execute script {id}");
        engine.execute_javascript(ScriptRequest { id, source: script.to_string() });
        Ok(id)
    }

    pub fn send_touch_event(&self, handle: EngineHandle, event: TouchEvent) -> Result<(), BridgeError> {
        if !event.x.is_finite() || !event.y.is_finite() {
            return Err(BridgeError::InvalidArgument(format!("touch at ({}, {})", event.x, event.y)));
        }
        self.with_engine(handle, |e| e.send_touch_event(event))
    }

    pub fn send_key_event(&self, handle: EngineHandle, event: KeyEvent) -> Result<(), BridgeError> {
        self.with_engine(handle, |e| e.send_key_event(event))
    }

    /// Resizes the viewport. Sides above
    /// [`MAX_FRAME_DIMENSION`](crate::dispatch::frame::MAX_FRAME_DIMENSION) are rejected.
    pub fn set_viewport_size(&self, handle: EngineHandle, width: u32, height: u32) -> Result<(), BridgeError> {
        if frame_len(width, height).is_none() {
            return Err(BridgeError::InvalidArgument(format!("viewport {width}x{height}")));
        }
        self.with_engine(handle, |e| e.set_viewport_size(width, height))
    }

    pub fn set_loading_callback(&self, handle: EngineHandle, cb: Option<LoadingCallback>) -> Result<(), BridgeError> {
        let guard = self.enter(handle)?;
        guard.entry().slots.loading.set(cb);
        Ok(())
    }

    pub fn set_progress_callback(&self, handle: EngineHandle, cb: Option<ProgressCallback>) -> Result<(), BridgeError> {
        let guard = self.enter(handle)?;
        guard.entry().slots.progress.set(cb);
        Ok(())
    }

    pub fn set_url_callback(&self, handle: EngineHandle, cb: Option<UrlCallback>) -> Result<(), BridgeError> {
        let guard = self.enter(handle)?;
        guard.entry().slots.url.set(cb);
        Ok(())
    }

    pub fn set_title_callback(&self, handle: EngineHandle, cb: Option<TitleCallback>) -> Result<(), BridgeError> {
        let guard = self.enter(handle)?;
        guard.entry().slots.title.set(cb);
        Ok(())
    }

    pub fn set_navigation_callback(
        &self,
        handle: EngineHandle,
        cb: Option<NavigationCallback>,
    ) -> Result<(), BridgeError> {
        let guard = self.enter(handle)?;
        guard.entry().slots.navigation.set(cb);
        Ok(())
    }

    pub fn set_render_callback(&self, handle: EngineHandle, cb: Option<RenderCallback>) -> Result<(), BridgeError> {
        let guard = self.enter(handle)?;
        guard.entry().slots.render.set(cb);
        Ok(())
    }

    /// Callback for script results without a per-call completion.
    pub fn set_script_callback(&self, handle: EngineHandle, cb: Option<ScriptCallback>) -> Result<(), BridgeError> {
        let guard = self.enter(handle)?;
        guard.entry().slots.script.set(cb);
        Ok(())
    }

    /// Routes every event kind of `handle` to `observer`, replacing all
    /// registered callbacks.
    pub fn set_observer(&self, handle: EngineHandle, observer: Arc<dyn EngineObserver>) -> Result<(), BridgeError> {
        let guard = self.enter(handle)?;
        guard.entry().slots.install_observer(observer);
        Ok(())
    }

    pub fn set_cookie(&self, handle: EngineHandle, domain: &str, name: &str, value: &str) -> Result<(), BridgeError> {
        if domain.trim().trim_start_matches('.').is_empty() {
            return Err(BridgeError::InvalidArgument("empty cookie domain".into()));
        }
        if name.is_empty() || name.contains(['=', ';']) {
            return Err(BridgeError::InvalidArgument(format!("cookie name {name:?}")));
        }
        let cookie = Cookie::new(domain, name, value);
        self.with_engine(handle, |e| e.set_cookie(cookie))
    }

    /// Cookies applying to `domain` as `name=value` pairs joined by `"; "`.
    pub fn get_cookies(&self, handle: EngineHandle, domain: &str) -> Result<String, BridgeError> {
        self.with_engine(handle, |e| format_cookie_header(&e.cookies_for(domain)))
    }

    /// Like [`Bridge::get_cookies`], copied NUL-terminated into `buf`.
    ///
    /// Returns the number of bytes written before the NUL. On
    /// [`BridgeError::BufferTooSmall`] `buf` still holds the truncated copy.
    pub fn copy_cookies(&self, handle: EngineHandle, domain: &str, buf: &mut [u8]) -> Result<usize, BridgeError> {
        let cookies = self.get_cookies(handle, domain)?;
        copy_nul_terminated(&cookies, buf)
    }

    pub fn clear_cookies(&self, handle: EngineHandle) -> Result<(), BridgeError> {
        self.with_engine(handle, |e| e.clear_cookies())
    }

    /// Applies to loads started after this call.
    pub fn set_user_agent(&self, handle: EngineHandle, user_agent: &str) -> Result<(), BridgeError> {
        self.with_engine(handle, |e| e.set_user_agent(user_agent))
    }

    /// Applies to documents loaded after this call.
    pub fn enable_javascript(&self, handle: EngineHandle, enabled: bool) -> Result<(), BridgeError> {
        self.with_engine(handle, |e| e.set_javascript_enabled(enabled))
    }

    /// Applies to documents loaded after this call.
    pub fn enable_images(&self, handle: EngineHandle, enabled: bool) -> Result<(), BridgeError> {
        self.with_engine(handle, |e| e.set_images_enabled(enabled))
    }

    pub fn settings(&self, handle: EngineHandle) -> Result<EngineSettings, BridgeError> {
        self.with_engine(handle, |e| e.settings())
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        for handle in self.registry.handles() {
            if let Err(e) = self.destroy(handle) {
                warn!("Destroying {handle} on shutdown failed: {e}");
            }
        }
        self.cancel.cancel();
    }
}

//! Callback slot table: one slot per event kind, last registration wins.
//!
//! Callbacks are stored closures rather than raw function pointers so that
//! host code can capture state. A slot is read at delivery time, so a
//! callback replaced while events are queued never sees those events.

use crate::dispatch::frame::Frame;
use crate::engine::NavigationState;
use crate::script::ScriptResult;
use parking_lot::RwLock;
use std::fmt::Display;
use std::sync::Arc;

pub type LoadingCallback = Arc<dyn Fn(bool) + Send + Sync>;
pub type ProgressCallback = Arc<dyn Fn(f32) + Send + Sync>;
pub type UrlCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type TitleCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type NavigationCallback = Arc<dyn Fn(NavigationState) + Send + Sync>;
/// The frame is only valid for the duration of the call.
pub type RenderCallback = Arc<dyn Fn(&Frame<'_>) + Send + Sync>;
pub type ScriptCallback = Arc<dyn Fn(&ScriptResult) + Send + Sync>;

/// Event kinds that have a callback slot
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Loading,
    Progress,
    UrlChanged,
    TitleChanged,
    NavigationState,
    RenderFrame,
    JsResult,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::Loading,
        EventKind::Progress,
        EventKind::UrlChanged,
        EventKind::TitleChanged,
        EventKind::NavigationState,
        EventKind::RenderFrame,
        EventKind::JsResult,
    ];
}

impl Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventKind::Loading => "loading",
            EventKind::Progress => "progress",
            EventKind::UrlChanged => "url-changed",
            EventKind::TitleChanged => "title-changed",
            EventKind::NavigationState => "navigation-state",
            EventKind::RenderFrame => "render-frame",
            EventKind::JsResult => "js-result",
        };
        write!(f, "{name}")
    }
}

/// A single registration slot.
pub struct Slot<T: Clone> {
    inner: RwLock<Option<T>>,
}

impl<T: Clone> Default for Slot<T> {
    fn default() -> Self {
        Self { inner: RwLock::new(None) }
    }
}

impl<T: Clone> Slot<T> {
    /// Stores `callback` (or clears the slot with `None`). Returns whether a
    /// previous callback was replaced.
    pub fn set(&self, callback: Option<T>) -> bool {
        std::mem::replace(&mut *self.inner.write(), callback).is_some()
    }

    /// Current callback. Cloned out so it can be invoked without holding the lock.
    pub fn get(&self) -> Option<T> {
        self.inner.read().clone()
    }

    pub fn is_set(&self) -> bool {
        self.inner.read().is_some()
    }
}

/// Receives every event kind through one object.
///
/// Installing an observer fills every slot of the handle; all methods default
/// to doing nothing.
pub trait EngineObserver: Send + Sync {
    fn on_loading(&self, _is_loading: bool) {}
    fn on_progress(&self, _progress: f32) {}
    fn on_url_changed(&self, _url: &str) {}
    fn on_title_changed(&self, _title: &str) {}
    fn on_navigation_state(&self, _state: NavigationState) {}
    fn on_frame(&self, _frame: &Frame<'_>) {}
    fn on_script_result(&self, _result: &ScriptResult) {}
}

/// Callback slots of one handle.
#[derive(Default)]
pub struct CallbackSlots {
    pub loading: Slot<LoadingCallback>,
    pub progress: Slot<ProgressCallback>,
    pub url: Slot<UrlCallback>,
    pub title: Slot<TitleCallback>,
    pub navigation: Slot<NavigationCallback>,
    pub render: Slot<RenderCallback>,
    pub script: Slot<ScriptCallback>,
}

impl CallbackSlots {
    pub fn is_registered(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::Loading => self.loading.is_set(),
            EventKind::Progress => self.progress.is_set(),
            EventKind::UrlChanged => self.url.is_set(),
            EventKind::TitleChanged => self.title.is_set(),
            EventKind::NavigationState => self.navigation.is_set(),
            EventKind::RenderFrame => self.render.is_set(),
            EventKind::JsResult => self.script.is_set(),
        }
    }

    /// Points every slot at `observer`.
    pub fn install_observer(&self, observer: Arc<dyn EngineObserver>) {
        let o = observer.clone();
        self.loading.set(Some(Arc::new(move |v: bool| o.on_loading(v))));
        let o = observer.clone();
        self.progress.set(Some(Arc::new(move |v: f32| o.on_progress(v))));
        let o = observer.clone();
        self.url.set(Some(Arc::new(move |v: &str| o.on_url_changed(v))));
        let o = observer.clone();
        self.title.set(Some(Arc::new(move |v: &str| o.on_title_changed(v))));
        let o = observer.clone();
        self.navigation.set(Some(Arc::new(move |v: NavigationState| o.on_navigation_state(v))));
        let o = observer.clone();
        self.render.set(Some(Arc::new(move |f: &Frame<'_>| o.on_frame(f))));
        let o = observer;
        self.script.set(Some(Arc::new(move |r: &ScriptResult| o.on_script_result(r))));
    }

    /// Empties every slot.
    pub fn clear(&self) {
        self.loading.set(None);
        self.progress.set(None);
        self.url.set(None);
        self.title.set(None);
        self.navigation.set(None);
        self.render.set(None);
        self.script.set(None);
    }
}

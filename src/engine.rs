// src/engine.rs
//! The seam to the wrapped engine: [`Engine`], [`EngineFactory`] and the value
//! types that cross it.
//!
//! The bridge never renders, lays out, runs scripts or touches the network
//! itself. All of that lives behind [`Engine`]. An engine reports what happens
//! inside it through the [`EventSink`](crate::dispatch::EventSink) it receives
//! at creation, from whatever threads it owns.
//!
//! [`headless::HeadlessEngine`] is the reference implementation.

pub mod headless;

use crate::config::EngineSettings;
use crate::cookies::Cookie;
use crate::dispatch::EventSink;
use crate::script::ScriptRequest;
use bitflags::bitflags;
use std::fmt::{Debug, Display};
use std::sync::Arc;

/// A wrapped engine instance.
///
/// Methods take `&self`; implementations synchronize internally. Every
/// navigation, input and settings call is fire-and-forget: its effects are
/// reported asynchronously through the event sink.
pub trait Engine: Send + Sync {
    /// Name of the engine implementation (for logging).
    fn name(&self) -> &str;

    fn load_url(&self, url: &str);
    fn go_back(&self);
    fn go_forward(&self);
    fn reload(&self);
    /// Advisory; a load that already committed is not undone.
    fn stop_loading(&self);

    /// Starts evaluating a script. The engine must answer through
    /// [`EventSink::script_result`] with the request's id.
    fn execute_javascript(&self, request: ScriptRequest);

    fn send_touch_event(&self, event: TouchEvent);
    fn send_key_event(&self, event: KeyEvent);
    fn set_viewport_size(&self, width: u32, height: u32);

    fn set_cookie(&self, cookie: Cookie);
    /// Cookies that apply to `domain`, in insertion order.
    fn cookies_for(&self, domain: &str) -> Vec<Cookie>;
    fn clear_cookies(&self);

    fn set_user_agent(&self, user_agent: &str);
    fn set_javascript_enabled(&self, enabled: bool);
    fn set_images_enabled(&self, enabled: bool);
    fn settings(&self) -> EngineSettings;

    /// Releases the engine's resources. Called exactly once, after the last
    /// dispatch for the handle has completed. Must not block on its own
    /// threads when called from one of them.
    fn shutdown(&self);
}

/// Creates engine instances for new handles.
pub trait EngineFactory: Send + Sync {
    fn create(&self, sink: EventSink, settings: &EngineSettings) -> anyhow::Result<Arc<dyn Engine>>;
}

impl<F> EngineFactory for F
where
    F: Fn(EventSink, &EngineSettings) -> anyhow::Result<Arc<dyn Engine>> + Send + Sync,
{
    fn create(&self, sink: EventSink, settings: &EngineSettings) -> anyhow::Result<Arc<dyn Engine>> {
        self(sink, settings)
    }
}

/// Back/forward availability after a navigation.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct NavigationState {
    pub can_go_back: bool,
    pub can_go_forward: bool,
}

/// Kind of touch event
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TouchKind {
    Down,
    Move,
    Up,
    Cancel,
}

impl TouchKind {
    /// Maps the C ABI value (0 = down, 1 = move, 2 = up, 3 = cancel).
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(TouchKind::Down),
            1 => Some(TouchKind::Move),
            2 => Some(TouchKind::Up),
            3 => Some(TouchKind::Cancel),
            _ => None,
        }
    }
}

impl Display for TouchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TouchKind::Down => write!(f, "Down"),
            TouchKind::Move => write!(f, "Move"),
            TouchKind::Up => write!(f, "Up"),
            TouchKind::Cancel => write!(f, "Cancel"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct TouchEvent {
    pub kind: TouchKind,
    pub x: f32,
    pub y: f32,
}

bitflags! {
    pub struct Modifiers: u8 {
        const SHIFT   = 0b0001;
        const CONTROL = 0b0010;
        const ALT     = 0b0100;
        const META    = 0b1000;
    }
}

impl Display for Modifiers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();

        if self.contains(Modifiers::SHIFT) {
            parts.push("Shift");
        }
        if self.contains(Modifiers::CONTROL) {
            parts.push("Control");
        }
        if self.contains(Modifiers::ALT) {
            parts.push("Alt");
        }
        if self.contains(Modifiers::META) {
            parts.push("Meta");
        }

        if parts.is_empty() {
            write!(f, "None")
        } else {
            write!(f, "{}", parts.join("+"))
        }
    }
}

/// A key press or release. `code` is the platform key code.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    pub code: i32,
    pub pressed: bool,
    pub modifiers: Modifiers,
}

impl KeyEvent {
    pub fn new(code: i32, pressed: bool) -> Self {
        Self { code, pressed, modifiers: Modifiers::empty() }
    }
}

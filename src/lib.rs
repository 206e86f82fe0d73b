pub mod bridge;
pub mod callbacks;
pub mod config;
pub mod cookies;
pub mod dispatch;
pub mod engine;
pub mod errors;
pub mod ffi;
pub mod script;

pub use bridge::{Bridge, EngineHandle, Lifecycle};
pub use callbacks::{EngineObserver, EventKind};
pub use config::{BridgeConfig, DeliveryMode, EngineSettings, ProgressPolicy};
pub use dispatch::frame::{Frame, FrameBuffer};
pub use dispatch::EventSink;
pub use engine::{Engine, EngineFactory, KeyEvent, Modifiers, NavigationState, TouchEvent, TouchKind};
pub use errors::BridgeError;
pub use script::{JsRequestId, ScriptError, ScriptResult};

//! Bridge configuration.
//!
//! [`BridgeConfig`] controls how a [`Bridge`](crate::Bridge) delivers engine
//! events to host callbacks and how long teardown may wait for in-flight
//! dispatches. [`EngineSettings`] holds the per-engine settings (user agent,
//! JavaScript, images) that every new handle starts with.
//!
//! Both come with sensible defaults, and `BridgeConfig` has a fluent
//! [`BridgeConfig::builder()`] that validates on `build()`.
//!
//! ```rust
//! use std::time::Duration;
//! use webengine_bridge::config::{BridgeConfig, DeliveryMode, ProgressPolicy};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cfg = BridgeConfig::builder()
//!     .delivery_mode(DeliveryMode::Queued)
//!     .progress_policy(ProgressPolicy::EveryUpdate)
//!     .drain_timeout(Duration::from_secs(2))
//!     .max_handles(8)
//!     .build()?;
//! assert_eq!(cfg.max_handles, 8);
//! # Ok(()) }
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_USER_AGENT: &str = "WebEngineBridge/0.1 (X11; Linux x86_64) Headless/0.1";

/// Where host callbacks are invoked.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeliveryMode {
    /// Every event is marshalled onto a single delivery worker per handle.
    /// Callbacks of one handle observe one total order and never overlap.
    #[default]
    Queued,
    /// Callbacks run directly on whichever engine thread produced the event,
    /// and script results resolved by destroy run on the destroying thread.
    /// Callbacks of one handle may overlap; the host must be reentrant-safe.
    Direct,
}

/// What happens to progress updates when delivery cannot keep pace.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProgressPolicy {
    /// A progress update that arrives while an earlier one is still queued,
    /// with no other event queued after it, replaces the queued value. The
    /// latest value is always delivered.
    #[default]
    CoalesceLatest,
    /// Every progress update is delivered.
    EveryUpdate,
}

/// Engine settings. Changes apply to subsequent loads only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// User agent string sent with requests
    pub user_agent: String,
    /// Execute JavaScript in documents loaded from now on
    pub javascript_enabled: bool,
    /// Load images in documents loaded from now on
    pub images_enabled: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            javascript_enabled: true,
            images_enabled: true,
        }
    }
}

/// Main bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Thread-origin contract for callbacks
    pub delivery_mode: DeliveryMode,
    /// Coalescing policy for progress updates
    pub progress_policy: ProgressPolicy,
    /// Upper bound for `destroy()` waiting on in-flight dispatches
    pub drain_timeout: Duration,
    /// Pending script evaluations resolve with a timeout error after this long
    pub script_timeout: Option<Duration>,
    /// Maximum number of live handles
    pub max_handles: usize,
    /// Worker threads of the delivery runtime
    pub dispatch_threads: usize,
    /// Number of recycled frame buffers kept per handle
    pub frame_pool_size: usize,
    /// Settings every new engine starts with
    pub default_settings: EngineSettings,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            delivery_mode: DeliveryMode::default(),
            progress_policy: ProgressPolicy::default(),
            drain_timeout: Duration::from_secs(5),
            script_timeout: Some(Duration::from_secs(30)),
            max_handles: 64,
            dispatch_threads: num_cpus::get().clamp(1, 4),
            frame_pool_size: 3,
            default_settings: EngineSettings::default(),
        }
    }
}

impl BridgeConfig {
    pub fn builder() -> BridgeConfigBuilder {
        BridgeConfigBuilder::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BridgeConfigBuilder {
    inner: BridgeConfig,
}

impl BridgeConfigBuilder {
    #[inline]
    fn map(mut self, f: impl FnOnce(&mut BridgeConfig)) -> Self {
        f(&mut self.inner);
        self
    }

    pub fn delivery_mode(self, mode: DeliveryMode) -> Self { self.map(|c| c.delivery_mode = mode) }
    pub fn progress_policy(self, policy: ProgressPolicy) -> Self { self.map(|c| c.progress_policy = policy) }
    pub fn drain_timeout(self, timeout: Duration) -> Self { self.map(|c| c.drain_timeout = timeout) }
    pub fn script_timeout(self, timeout: Option<Duration>) -> Self { self.map(|c| c.script_timeout = timeout) }
    pub fn max_handles(self, n: usize) -> Self { self.map(|c| c.max_handles = n) }
    pub fn dispatch_threads(self, n: usize) -> Self { self.map(|c| c.dispatch_threads = n) }
    pub fn frame_pool_size(self, n: usize) -> Self { self.map(|c| c.frame_pool_size = n) }
    pub fn user_agent<S: Into<String>>(self, ua: S) -> Self { self.map(|c| c.default_settings.user_agent = ua.into()) }
    pub fn javascript_enabled(self, on: bool) -> Self { self.map(|c| c.default_settings.javascript_enabled = on) }
    pub fn images_enabled(self, on: bool) -> Self { self.map(|c| c.default_settings.images_enabled = on) }

    /// Apply multiple changes in one go.
    pub fn with(self, f: impl FnOnce(&mut BridgeConfig)) -> Self { self.map(f) }

    /// Validate and build the final config.
    pub fn build(self) -> Result<BridgeConfig, ConfigError> {
        validate(&self.inner)?;
        Ok(self.inner)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("max_handles must be at least 1")]
    ZeroHandles,
    #[error("dispatch_threads must be at least 1")]
    ZeroThreads,
    #[error("drain_timeout must be non-zero")]
    ZeroDrainTimeout,
    #[error("script_timeout must be non-zero when set")]
    ZeroScriptTimeout,
}

pub(crate) fn validate(c: &BridgeConfig) -> Result<(), ConfigError> {
    if c.max_handles == 0 {
        return Err(ConfigError::ZeroHandles);
    }
    if c.dispatch_threads == 0 {
        return Err(ConfigError::ZeroThreads);
    }
    if c.drain_timeout.is_zero() {
        return Err(ConfigError::ZeroDrainTimeout);
    }
    if c.script_timeout.is_some_and(|t| t.is_zero()) {
        return Err(ConfigError::ZeroScriptTimeout);
    }
    Ok(())
}

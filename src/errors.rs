use std::time::Duration;

use crate::config::ConfigError;

/// Errors reported synchronously by the bridge.
///
/// Only boundary-contract violations end up here. Failures that originate in
/// the engine (navigation, script, render) travel in-band through the
/// callback of the matching event kind.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Invalid engine handle")]
    InvalidHandle,

    #[error("Engine allocation failed: {0}")]
    AllocationFailure(String),

    #[error("Buffer too small: {required} bytes required, {capacity} available")]
    BufferTooSmall { required: usize, capacity: usize },

    #[error("Timed out after {0:?} waiting for in-flight dispatches to drain")]
    Timeout(Duration),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

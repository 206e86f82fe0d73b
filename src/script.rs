//! Script evaluation requests and their exactly-once results.
//!
//! Every `execute_javascript` call gets a [`JsRequestId`] and an entry in the
//! handle's [`PendingScripts`] table. Whoever removes that entry first (the
//! engine's answer, the script timeout, or handle destruction) owns the single
//! delivery. Everyone else finds the entry gone and drops their result.

use hashbrown::HashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::fmt::Display;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Correlates one script request with its one result.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JsRequestId(Uuid);

impl JsRequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JsRequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for JsRequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the engine receives for evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptRequest {
    pub id: JsRequestId,
    pub source: String,
}

/// Failures delivered in-band through the JS-result callback.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScriptError {
    #[error("{0}")]
    Exception(String),

    #[error("JavaScript is disabled")]
    JavaScriptDisabled,

    #[error("script timed out after {0:?}")]
    TimedOut(Duration),

    #[error("handle destroyed before the script completed")]
    HandleDestroyed,

    #[error("engine internal error: {0}")]
    EngineInternal(String),
}

impl ScriptError {
    fn kind(&self) -> &'static str {
        match self {
            ScriptError::Exception(_) => "exception",
            ScriptError::JavaScriptDisabled => "disabled",
            ScriptError::TimedOut(_) => "timeout",
            ScriptError::HandleDestroyed => "destroyed",
            ScriptError::EngineInternal(_) => "internal",
        }
    }
}

pub type ScriptOutcome = Result<Value, ScriptError>;

/// The single result of one script request.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptResult {
    pub id: JsRequestId,
    pub outcome: ScriptOutcome,
}

impl ScriptResult {
    pub fn is_error(&self) -> bool {
        self.outcome.is_err()
    }

    /// String form handed to string-based consumers (the C ABI).
    ///
    /// Success is the JSON encoding of the value; failure is
    /// `{"error": "<message>", "kind": "<kind>"}`.
    pub fn to_payload(&self) -> String {
        match &self.outcome {
            Ok(value) => value.to_string(),
            Err(e) => json!({ "error": e.to_string(), "kind": e.kind() }).to_string(),
        }
    }
}

/// Per-call completion, invoked instead of the JS-result slot.
pub type ScriptCompletion = Box<dyn FnOnce(&ScriptResult) + Send>;

struct PendingScript {
    completion: Option<ScriptCompletion>,
    /// Stops the request's timeout timer
    timer: CancellationToken,
}

/// Requests that have been submitted but not yet resolved.
#[derive(Default)]
pub(crate) struct PendingScripts {
    inner: Mutex<HashMap<JsRequestId, PendingScript>>,
}

impl PendingScripts {
    pub(crate) fn register(&self, id: JsRequestId, completion: Option<ScriptCompletion>, timer: CancellationToken) {
        self.inner.lock().insert(id, PendingScript { completion, timer });
    }

    /// Claims the request and stops its timer. `None` means someone else
    /// already resolved it.
    pub(crate) fn resolve(&self, id: JsRequestId) -> Option<Option<ScriptCompletion>> {
        let pending = self.inner.lock().remove(&id)?;
        pending.timer.cancel();
        Some(pending.completion)
    }

    /// Claims every outstanding request.
    pub(crate) fn drain(&self) -> Vec<(JsRequestId, Option<ScriptCompletion>)> {
        self.inner
            .lock()
            .drain()
            .map(|(id, pending)| {
                pending.timer.cancel();
                (id, pending.completion)
            })
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

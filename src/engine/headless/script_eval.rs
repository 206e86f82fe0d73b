//! The headless engine's script vocabulary.
//!
//! There is no interpreter here. A handful of property reads and writes on the
//! current document are recognised, JSON literals evaluate to themselves and
//! `throw` raises an exception. Anything else is a `ReferenceError`.

use crate::script::ScriptError;
use serde_json::Value;

/// What a script can see of the current document.
pub(crate) struct ScriptScope<'a> {
    pub url: &'a str,
    pub title: &'a str,
    pub user_agent: &'a str,
    pub cookie: &'a str,
}

#[derive(Debug, PartialEq)]
pub(crate) struct Evaluation {
    pub value: Value,
    /// Set when the script assigned `document.title`
    pub new_title: Option<String>,
}

impl Evaluation {
    fn value(value: Value) -> Self {
        Self { value, new_title: None }
    }
}

pub(crate) fn evaluate(source: &str, scope: &ScriptScope<'_>) -> Result<Evaluation, ScriptError> {
    let expr = source.trim().trim_end_matches(';').trim();

    if let Some(thrown) = expr.strip_prefix("throw ") {
        return Err(ScriptError::Exception(format!("Uncaught {}", describe_thrown(thrown.trim()))));
    }

    if let Some(rhs) = expr.strip_prefix("document.title") {
        if let Some(rhs) = rhs.trim_start().strip_prefix('=') {
            let value = literal(rhs.trim())?;
            let title = match &value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return Ok(Evaluation { value, new_title: Some(title) });
        }
    }

    let value = match expr {
        "" | "undefined" | "void 0" => Value::Null,
        "document.title" => Value::String(scope.title.to_string()),
        "location.href" | "window.location.href" | "document.location.href" | "document.URL" => {
            Value::String(scope.url.to_string())
        }
        "navigator.userAgent" => Value::String(scope.user_agent.to_string()),
        "document.cookie" => Value::String(scope.cookie.to_string()),
        other => literal(other)?,
    };
    Ok(Evaluation::value(value))
}

fn literal(expr: &str) -> Result<Value, ScriptError> {
    serde_json::from_str(expr).map_err(|_| ScriptError::Exception(format!("ReferenceError: {expr} is not defined")))
}

fn describe_thrown(expr: &str) -> String {
    match serde_json::from_str::<Value>(expr) {
        Ok(Value::String(s)) => s,
        Ok(other) => other.to_string(),
        Err(_) => expr.to_string(),
    }
}

// src/cookies.rs
//! Cookies: [`Cookie`], [`CookieJar`] and the C-buffer copy used by `get_cookies`.
//!
//! Cookies are owned by the engine. The bridge only formats them for the host
//! and copies the formatted string into caller-provided buffers, truncating
//! safely when the buffer is too small.

mod cookie_jar;

pub use cookie_jar::CookieJar;
pub use cookie_jar::DefaultCookieJar;

use crate::errors::BridgeError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A handle to a cookie jar trait.
///
/// Take a read lock for queries and a write lock for mutations.
pub type CookieJarHandle = Arc<RwLock<dyn CookieJar + Send + Sync>>;

/// A cookie as stored by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    /// Cookie name (case-sensitive).
    pub name: String,

    /// Raw cookie value (not URL-decoded).
    pub value: String,

    /// Path scoping. Cookies set through the bridge use `"/"`.
    pub path: Option<String>,

    /// Domain the cookie belongs to, normalized to lowercase without a leading dot.
    /// The cookie matches this domain and all of its subdomains.
    pub domain: String,

    /// If `true`, cookie is sent only over HTTPS.
    pub secure: bool,

    /// If `true`, cookie is hidden from `document.cookie`.
    pub http_only: bool,
}

impl Cookie {
    /// Creates a host cookie for `domain` with the default path.
    pub fn new(domain: &str, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            path: Some("/".to_string()),
            domain: normalize_domain(domain),
            secure: false,
            http_only: false,
        }
    }

    /// Does this cookie apply to `domain`?
    pub fn matches_domain(&self, domain: &str) -> bool {
        let domain = normalize_domain(domain);
        domain == self.domain || domain.ends_with(&format!(".{}", self.domain))
    }
}

pub(crate) fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_start_matches('.').to_ascii_lowercase()
}

/// Formats cookies as a `Cookie` header value: `name=value` pairs joined by `"; "`.
pub fn format_cookie_header(cookies: &[Cookie]) -> String {
    cookies
        .iter()
        .map(|c| format!("{}={}", c.name, c.value))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Copies `src` into `buf` as a NUL-terminated string and never writes past `buf.len()`.
///
/// At most `buf.len() - 1` bytes of text are written, cut back to a UTF-8
/// character boundary, followed by a NUL. Returns the number of text bytes
/// written. When the text had to be truncated the (truncated, terminated)
/// copy is still made and [`BridgeError::BufferTooSmall`] reports the size
/// that would have fit everything. An empty buffer is left untouched.
pub fn copy_nul_terminated(src: &str, buf: &mut [u8]) -> Result<usize, BridgeError> {
    let required = src.len() + 1;
    if buf.is_empty() {
        return Err(BridgeError::BufferTooSmall { required, capacity: 0 });
    }

    let mut n = src.len().min(buf.len() - 1);
    while !src.is_char_boundary(n) {
        n -= 1;
    }

    buf[..n].copy_from_slice(&src.as_bytes()[..n]);
    buf[n] = 0;

    if n < src.len() {
        Err(BridgeError::BufferTooSmall { required, capacity: buf.len() })
    } else {
        Ok(n)
    }
}

//! Cookie jar abstraction and a simple in-memory implementation.
//!
//! A **cookie jar** holds all cookies of one engine instance. Cookies are
//! bucketed by their normalized domain. A lookup for a domain returns the
//! cookies of that domain and of every parent domain, in insertion order.
//!
//! This module is **not** internally synchronized. Use it via a
//! [`CookieJarHandle`](crate::cookies::CookieJarHandle).
use crate::cookies::{normalize_domain, Cookie};
use serde::{Deserialize, Serialize};
use std::any::Any;

/// A cookie jar keeps the cookies for one engine instance.
pub trait CookieJar: Send + Sync {
    /// Returns a type-erased reference to the jar.
    fn as_any(&self) -> &dyn Any;

    /// Stores a cookie. A cookie with the same domain, name and path is replaced.
    fn set_cookie(&mut self, cookie: Cookie);

    /// Returns all cookies that apply to `domain`, in insertion order.
    fn cookies_for(&self, domain: &str) -> Vec<Cookie>;

    /// Removes a single cookie named `name` stored for exactly `domain`.
    fn remove_cookie(&mut self, domain: &str, name: &str);

    /// Removes all cookies from the jar.
    fn clear(&mut self);

    /// Total number of cookies in the jar.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory cookie jar. Performs no persistence and no expiry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefaultCookieJar {
    /// Cookies in insertion order. Replacing a cookie keeps its position.
    entries: Vec<Cookie>,
}

impl DefaultCookieJar {
    /// Creates an empty in-memory cookie jar.
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }
}

impl CookieJar for DefaultCookieJar {
    fn as_any(&self) -> &dyn Any { self }

    fn set_cookie(&mut self, cookie: Cookie) {
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|c| c.domain == cookie.domain && c.name == cookie.name && c.path == cookie.path)
        {
            *existing = cookie;
        } else {
            self.entries.push(cookie);
        }
    }

    fn cookies_for(&self, domain: &str) -> Vec<Cookie> {
        self.entries
            .iter()
            .filter(|c| c.matches_domain(domain))
            .cloned()
            .collect()
    }

    fn remove_cookie(&mut self, domain: &str, name: &str) {
        let domain = normalize_domain(domain);
        self.entries.retain(|c| !(c.domain == domain && c.name == name));
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

impl From<DefaultCookieJar> for crate::cookies::CookieJarHandle {
    fn from(jar: DefaultCookieJar) -> Self {
        std::sync::Arc::new(parking_lot::RwLock::new(jar))
    }
}

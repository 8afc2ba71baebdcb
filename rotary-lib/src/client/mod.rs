//! Egress identities.
//!
//! A [`Client`] bundles a transport bound to one proxy (or to none), a
//! cookie jar and a few per-identity counters. Clients are created by the
//! refresh controller and never mutated once published; preserve-mode
//! refreshes produce a new value that shares the jar and counters instead.

mod cookies;
mod transport;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest_cookie_store::CookieStoreMutex;
use url::Url;

use crate::Result;

pub(crate) use transport::{ClientFactory, SlotPlan};
pub use transport::{TransportLayer, UserAgentLayer};

/// One egress identity of the pool
#[derive(Debug, Clone)]
pub struct Client {
    id: usize,
    generation: u64,
    transport: reqwest::Client,
    cookie_jar: Arc<CookieStoreMutex>,
    saved_cookies: String,
    proxy: Option<Url>,
    timeout: Duration,
    without_captcha_counter: Arc<AtomicU64>,
}

impl Client {
    /// Slot of this identity. The no-proxy client has the last slot.
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Number of the pool generation this value belongs to
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// The HTTP transport bound to this identity's proxy and cookie jar
    #[must_use]
    pub const fn transport(&self) -> &reqwest::Client {
        &self.transport
    }

    /// The cookie jar of this identity
    #[must_use]
    pub const fn cookie_jar(&self) -> &Arc<CookieStoreMutex> {
        &self.cookie_jar
    }

    /// The cookie string the identity was seeded with
    #[must_use]
    pub fn saved_cookies(&self) -> &str {
        &self.saved_cookies
    }

    /// The proxy requests are routed through, `None` for direct egress
    #[must_use]
    pub const fn proxy_url(&self) -> Option<&Url> {
        self.proxy.as_ref()
    }

    /// `host:port` of the proxy
    #[must_use]
    pub fn proxy_host(&self) -> Option<String> {
        let proxy = self.proxy.as_ref()?;
        let host = proxy.host_str()?;
        Some(match proxy.port_or_known_default() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        })
    }

    /// Timeout applied to every request of this identity
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Consecutive requests that went through without captcha intervention
    #[must_use]
    pub fn without_captcha_count(&self) -> u64 {
        self.without_captcha_counter.load(Ordering::Relaxed)
    }

    /// Count a request that needed no captcha, returning the new count
    pub fn record_without_captcha(&self) -> u64 {
        self.without_captcha_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Start counting from zero again, typically after a captcha
    pub fn reset_without_captcha(&self) {
        self.without_captcha_counter.store(0, Ordering::Relaxed);
    }

    /// The cookies this identity would send to `url`, in `Cookie`-header form
    ///
    /// # Errors
    ///
    /// Returns [`crate::ErrorKind::Cookies`] if the cookie store is poisoned
    pub fn cookie_header(&self, url: &Url) -> Result<String> {
        cookies::header_for(&self.cookie_jar, url)
    }

    /// Start building a request on this identity's transport
    pub fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        self.transport.request(method, url)
    }

    /// Start building a `GET` request on this identity's transport
    pub fn get(&self, url: Url) -> reqwest::RequestBuilder {
        self.request(reqwest::Method::GET, url)
    }
}

//! Sources of the per-identity material consumed by a refresh cycle.

use async_trait::async_trait;
use url::Url;

use crate::Result;

/// Supplies serialized cookie strings, one per identity.
///
/// Strings use the `Cookie` header form, e.g. `session=abc; theme=dark`.
#[async_trait]
pub trait CookieProvider: Send + Sync {
    /// Return exactly `n` cookie strings
    async fn cookies(&self, n: usize) -> Result<Vec<String>>;
}

/// Supplies the live proxy list when proxy rotation is enabled
#[async_trait]
pub trait ProxySource: Send + Sync {
    /// Return the current proxies, one identity is built per entry
    async fn proxies(&self) -> Result<Vec<Url>>;
}

/// Hands out the same cookie string to every identity
#[derive(Debug, Clone, Default)]
pub struct StaticCookies(pub String);

#[async_trait]
impl CookieProvider for StaticCookies {
    async fn cookies(&self, n: usize) -> Result<Vec<String>> {
        Ok(vec![self.0.clone(); n])
    }
}

/// A fixed proxy list
#[derive(Debug, Clone, Default)]
pub struct StaticProxies(pub Vec<Url>);

#[async_trait]
impl ProxySource for StaticProxies {
    async fn proxies(&self) -> Result<Vec<Url>> {
        Ok(self.0.clone())
    }
}

use std::sync::Arc;

use log::debug;
use reqwest_cookie_store::{CookieStore, CookieStoreMutex};
use url::Url;

use crate::{ErrorKind, Result};

/// Split a `Cookie`-header style string (`a=1; b=2`) into its pairs
pub(crate) fn pairs(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(';')
        .map(str::trim)
        .filter(|pair| pair.contains('='))
}

/// Create a cookie jar and seed it from `raw`.
///
/// Pairs are stored as if `origin` had set them. Without an origin the jar
/// starts out empty; the raw string stays available on the client.
///
/// # Errors
///
/// Returns [`ErrorKind::Cookies`] if a pair is rejected by the store
pub(crate) fn seed_jar(raw: &str, origin: Option<&Url>) -> Result<Arc<CookieStoreMutex>> {
    let mut store = CookieStore::default();
    if let Some(origin) = origin {
        let mut seeded = 0usize;
        for pair in pairs(raw) {
            store
                .parse(pair, origin)
                .map_err(|e| ErrorKind::Cookies(format!("Failed to seed cookie `{pair}`: {e}")))?;
            seeded += 1;
        }
        if seeded > 0 {
            debug!("Seeded {seeded} cookies for {origin}");
        }
    }
    Ok(Arc::new(CookieStoreMutex::new(store)))
}

/// Render the cookies `jar` would send to `url` in `Cookie`-header form
///
/// # Errors
///
/// Returns [`ErrorKind::Cookies`] if the cookie store is poisoned
pub(crate) fn header_for(jar: &CookieStoreMutex, url: &Url) -> Result<String> {
    let store = jar
        .lock()
        .map_err(|e| ErrorKind::Cookies(format!("Failed to lock cookie store: {e}")))?;
    let mut cookies: Vec<String> = store
        .matches(url)
        .into_iter()
        .map(|cookie| format!("{}={}", cookie.name(), cookie.value()))
        .collect();
    cookies.sort();
    Ok(cookies.join("; "))
}

use serde::Serialize;
use std::fmt;
use url::Url;

use crate::ErrorKind;
use crate::types::Result;

/// A normalized destination hostname (domain or IP address).
///
/// # Examples
///
/// ```
/// use rotary_lib::ratelimit::HostKey;
/// use url::Url;
///
/// let url = Url::parse("https://API.example.com/search?q=rust").unwrap();
/// let host_key = HostKey::try_from(&url).unwrap();
/// assert_eq!(host_key.as_str(), "api.example.com");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct HostKey(String);

impl HostKey {
    /// Get the hostname as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&Url> for HostKey {
    type Error = ErrorKind;

    fn try_from(url: &Url) -> Result<Self> {
        let host = url.host_str().ok_or(ErrorKind::InvalidUrlHost)?;
        Ok(HostKey(host.to_lowercase()))
    }
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for HostKey {
    fn from(host: &str) -> Self {
        HostKey(host.to_lowercase())
    }
}

/// Identifies one throttle: a destination host, optionally scoped to a
/// single client slot.
///
/// With a global throttle scope `client` is `None` and every identity
/// shares the state of the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ThrottleKey {
    /// Client slot, `None` for the global scope
    pub client: Option<usize>,
    /// Destination host
    pub host: HostKey,
}

impl ThrottleKey {
    /// Create a key for `host`, scoped to `client` if given
    #[must_use]
    pub const fn new(client: Option<usize>, host: HostKey) -> Self {
        Self { client, host }
    }
}

impl fmt::Display for ThrottleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.client {
            Some(client) => write!(f, "{}#{client}", self.host),
            None => write!(f, "{}", self.host),
        }
    }
}

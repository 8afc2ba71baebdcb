use serde::{Serialize, Serializer};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::ratelimit::ThrottleKey;

/// Possible errors when interacting with `rotary_lib`
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The configuration snapshot was rejected before any client got built
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No identity could be handed out, either because the pool is empty
    /// or because every candidate is banned without a chance to wait
    #[error("No clients available")]
    PoolExhausted,

    /// A sticky-identity lookup asked for a slot the current pool does not have
    #[error("No client with id {id} (pool has {size} clients)")]
    ClientIdOutOfRange {
        /// Requested slot
        id: usize,
        /// Size of the generation the lookup ran against
        size: usize,
    },

    /// A refresh cycle could not complete; the previous generation stays live
    #[error("Refresh cycle failed: {0}")]
    RefreshFailed(#[source] Box<ErrorKind>),

    /// Proxy rotation is enabled but the proxy source returned nothing
    #[error("Proxy list is empty")]
    EmptyProxyList,

    /// The cookie provider did not return one cookie string per identity
    #[error("Cookie provider returned {received} cookie strings, expected {requested}")]
    CookieCountMismatch {
        /// Number of strings requested (identities plus the no-proxy client)
        requested: usize,
        /// Number of strings actually returned
        received: usize,
    },

    /// A slot was assigned a proxy the transport cannot use
    #[error("Invalid proxy `{url}` for client {slot}")]
    InvalidProxy {
        /// The slot the proxy was meant for
        slot: usize,
        /// The rejected proxy
        url: Url,
    },

    /// The HTTP transport for a slot could not be built
    #[error("Failed to build client {slot}: {source}")]
    BuildClient {
        /// The slot that failed
        slot: usize,
        /// Underlying builder error
        #[source]
        source: reqwest::Error,
    },

    /// The worker thread building the client for a slot did not finish
    #[error("Build task for client {slot} failed: {reason}")]
    BuildTask {
        /// The slot that was being built
        slot: usize,
        /// Why the task ended
        reason: String,
    },

    /// Seeding or reading a cookie jar failed
    #[error("Cookie error: {0}")]
    Cookies(String),

    /// The caller waited `waited` for throttling capacity without being admitted
    #[error("No capacity for {host} after waiting {waited:?}")]
    AdmissionTimeout {
        /// Destination host of the request
        host: String,
        /// How long the caller was queued
        waited: Duration,
    },

    /// The rate ceiling of a throttle is reached; a slot opens after `retry_after`
    #[error("{key} is throttled, next slot in {retry_after:?}")]
    Throttled {
        /// The throttle that refused admission
        key: ThrottleKey,
        /// Time until the rate limiter has a slot again
        retry_after: Duration,
    },

    /// The throttle is banned after repeated failures
    #[error("{key} is banned{}", match .remaining {
        Some(d) => format!(" for another {d:?}"),
        None => " until the next evaluation lap".to_string(),
    })]
    Banned {
        /// The banned throttle
        key: ThrottleKey,
        /// Time until the ban can be waited out, `None` if waiting is not an option
        remaining: Option<Duration>,
    },

    /// An external collaborator required by an enabled feature is missing or unreachable
    #[error("{name} unavailable: {reason}")]
    CollaboratorUnavailable {
        /// Which collaborator failed
        name: &'static str,
        /// What went wrong
        reason: String,
    },

    /// The user-agent catalog has no record matching the request
    #[error("No user agent available{}", match .0 {
        Some(hardware_type) => format!(" for hardware type `{hardware_type}`"),
        None => String::new(),
    })]
    NoUserAgent(Option<String>),

    /// An URL with an invalid host was found
    #[error("URL is missing a host")]
    InvalidUrlHost,

    /// Network error while executing a request
    #[error("Network error: {0}")]
    NetworkRequest(#[source] reqwest::Error),

    /// The shutdown signal fired while waiting
    #[error("Requester is shutting down")]
    Shutdown,
}

impl ErrorKind {
    /// Returns the innermost error of a failed refresh cycle
    #[must_use]
    pub fn refresh_cause(&self) -> Option<&ErrorKind> {
        match self {
            Self::RefreshFailed(e) => Some(e.as_ref()),
            _ => None,
        }
    }

    /// True for per-request admission failures the caller may retry later
    #[must_use]
    pub const fn is_admission_failure(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted
                | Self::AdmissionTimeout { .. }
                | Self::Throttled { .. }
                | Self::Banned { .. }
        )
    }

    pub(crate) fn collaborator(name: &'static str, reason: impl ToString) -> Self {
        Self::CollaboratorUnavailable {
            name,
            reason: reason.to_string(),
        }
    }
}

impl PartialEq for ErrorKind {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::InvalidConfig(a), Self::InvalidConfig(b)) | (Self::Cookies(a), Self::Cookies(b)) => {
                a == b
            }
            (Self::NoUserAgent(a), Self::NoUserAgent(b)) => a == b,
            (Self::RefreshFailed(a), Self::RefreshFailed(b)) => a == b,
            (
                Self::ClientIdOutOfRange { id: i1, size: s1 },
                Self::ClientIdOutOfRange { id: i2, size: s2 },
            ) => i1 == i2 && s1 == s2,
            (
                Self::CookieCountMismatch {
                    requested: r1,
                    received: c1,
                },
                Self::CookieCountMismatch {
                    requested: r2,
                    received: c2,
                },
            ) => r1 == r2 && c1 == c2,
            (Self::InvalidProxy { slot: s1, url: u1 }, Self::InvalidProxy { slot: s2, url: u2 }) => {
                s1 == s2 && u1 == u2
            }
            (Self::BuildClient { slot: s1, .. }, Self::BuildClient { slot: s2, .. })
            | (Self::BuildTask { slot: s1, .. }, Self::BuildTask { slot: s2, .. }) => s1 == s2,
            (Self::Throttled { key: k1, .. }, Self::Throttled { key: k2, .. })
            | (Self::Banned { key: k1, .. }, Self::Banned { key: k2, .. }) => k1 == k2,
            (Self::AdmissionTimeout { host: h1, .. }, Self::AdmissionTimeout { host: h2, .. }) => {
                h1 == h2
            }
            (
                Self::CollaboratorUnavailable { name: n1, .. },
                Self::CollaboratorUnavailable { name: n2, .. },
            ) => n1 == n2,
            (Self::NetworkRequest(e1), Self::NetworkRequest(e2)) => e1.to_string() == e2.to_string(),
            (Self::PoolExhausted, Self::PoolExhausted)
            | (Self::EmptyProxyList, Self::EmptyProxyList)
            | (Self::InvalidUrlHost, Self::InvalidUrlHost)
            | (Self::Shutdown, Self::Shutdown) => true,
            _ => false,
        }
    }
}

impl Eq for ErrorKind {}

impl Serialize for ErrorKind {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

//! `rotary` hands out HTTP egress identities from a rotating pool and keeps
//! each of them below the request rate a destination host tolerates.
//!
//! An identity is an HTTP client with its own cookie jar and, optionally, its
//! own proxy. The pool is rebuilt periodically in the background while
//! callers keep using the previous generation until the new one is published.
//!
//! "Hello world" example:
//!
//! ```no_run
//! use rotary_lib::{Config, RequesterBuilder, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let requester = RequesterBuilder::builder()
//!         .config(Config::default())
//!         .build()
//!         .start()
//!         .await?;
//!
//!     let request = reqwest::Request::new(
//!         reqwest::Method::GET,
//!         "https://example.com".parse().unwrap(),
//!     );
//!     let (client, response) = requester.execute(request).await?;
//!     println!("client {}: {}", client.id(), response.status());
//!     Ok(())
//! }
//! ```
//!
//! With throttling enabled, [`Requester::get_throttled_client`] waits until
//! some identity has capacity for the destination host, and outcomes reported
//! through [`Requester::report`] steer the per-host rate up and down.
#![warn(clippy::all, clippy::pedantic)]
#![warn(
    absolute_paths_not_starting_with_crate,
    rustdoc::invalid_html_tags,
    missing_copy_implementations,
    missing_debug_implementations,
    semicolon_in_expressions_from_macros,
    unreachable_pub,
    unused_crate_dependencies,
    unused_extern_crates,
    variant_size_differences,
    clippy::missing_const_for_fn
)]
#![deny(anonymous_parameters, macro_use_extern_crate)]
#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]

// Only used in integration tests and the test-util helpers
#[cfg(test)]
use pretty_assertions as _;
#[cfg(test)]
use rstest as _;
#[cfg(test)]
use test_utils as _;
#[cfg(test)]
use toml as _;
#[cfg(test)]
use wiremock as _;

mod captcha;
mod client;
mod config;
mod metrics;
mod pool;
mod provider;
mod refresh;
mod requester;
mod shutdown;
mod types;
mod user_agent;

pub mod ratelimit;

pub use crate::{
    captcha::{CaptchaConnector, CaptchaEndpoint, CaptchaSolution, CaptchaSolver, CaptchaTask},
    client::{Client, TransportLayer, UserAgentLayer},
    config::{BanConfig, CaptchaConfig, Config, FingerprintConfig, ProxyConfig, ThrottleConfig},
    metrics::{MetricsSink, NoopMetrics},
    pool::{ClientPool, Generation},
    provider::{CookieProvider, ProxySource, StaticCookies, StaticProxies},
    ratelimit::{HostKey, ThrottleEngine, ThrottleKey, ThrottleStats, ThrottleStatsMap},
    requester::{Requester, RequesterBuilder},
    types::{ErrorKind, Outcome, Result},
    user_agent::{UserAgent, UserAgentCatalog, UserAgentSource},
};

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use reqwest::Proxy;
use reqwest_cookie_store::CookieStoreMutex;
use url::Url;

use super::{Client, cookies};
use crate::config::{Config, SUPPORTED_PROXY_SCHEMES};
use crate::user_agent::UserAgentCatalog;
use crate::{ErrorKind, Result};

/// Customizes the transport of each identity before it is built.
///
/// This is the hook for egress fingerprinting: implementations can set
/// headers, TLS options or anything else [`reqwest::ClientBuilder`] offers.
pub trait TransportLayer: Send + Sync {
    /// Apply the customization for the identity in `slot`
    fn layer(&self, builder: reqwest::ClientBuilder, slot: usize) -> reqwest::ClientBuilder;
}

/// Built-in layer that gives every identity a user agent, either a fixed
/// one or a random pick from the catalog.
#[derive(Debug, Clone)]
pub struct UserAgentLayer {
    fixed: Option<String>,
    catalog: Option<Arc<UserAgentCatalog>>,
}

impl UserAgentLayer {
    /// Always send `user_agent`
    #[must_use]
    pub fn fixed(user_agent: impl Into<String>) -> Self {
        Self {
            fixed: Some(user_agent.into()),
            catalog: None,
        }
    }

    /// Pick a random user agent from `catalog` per identity, falling back to
    /// `fallback` if the catalog is empty
    #[must_use]
    pub fn randomized(catalog: Arc<UserAgentCatalog>, fallback: Option<String>) -> Self {
        Self {
            fixed: fallback,
            catalog: Some(catalog),
        }
    }

    fn pick(&self) -> Option<String> {
        self.catalog
            .as_ref()
            .and_then(|catalog| catalog.random().ok())
            .map(|agent| agent.user_agent.clone())
            .or_else(|| self.fixed.clone())
    }
}

impl TransportLayer for UserAgentLayer {
    fn layer(&self, builder: reqwest::ClientBuilder, slot: usize) -> reqwest::ClientBuilder {
        match self.pick() {
            Some(user_agent) => {
                debug!("Client {slot} uses user agent `{user_agent}`");
                builder.user_agent(user_agent)
            }
            None => builder,
        }
    }
}

/// What a single slot of a generation should look like
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SlotPlan {
    pub(crate) id: usize,
    pub(crate) generation: u64,
    pub(crate) proxy: Option<Url>,
    pub(crate) cookies: String,
}

/// Builds [`Client`] values from the transport settings of a [`Config`]
#[derive(Clone)]
pub(crate) struct ClientFactory {
    query_timeout: Duration,
    idle_conn_timeout: Duration,
    max_idle_conns: usize,
    cookie_url: Option<Url>,
    layer: Option<Arc<dyn TransportLayer>>,
}

impl ClientFactory {
    pub(crate) fn new(config: &Config, layer: Option<Arc<dyn TransportLayer>>) -> Self {
        Self {
            query_timeout: config.query_timeout,
            idle_conn_timeout: config.idle_conn_timeout,
            max_idle_conns: config.max_idle_conns,
            cookie_url: config.cookie_url.clone(),
            layer,
        }
    }

    /// Build a brand-new identity with its own transport and cookie jar
    pub(crate) fn build(&self, plan: SlotPlan) -> Result<Client> {
        check_proxy(plan.id, plan.proxy.as_ref())?;
        let jar = cookies::seed_jar(&plan.cookies, self.cookie_url.as_ref())?;
        let transport = self.transport(plan.id, plan.proxy.as_ref(), &jar)?;

        Ok(Client {
            id: plan.id,
            generation: plan.generation,
            transport,
            cookie_jar: jar,
            saved_cookies: plan.cookies,
            proxy: plan.proxy,
            timeout: self.query_timeout,
            without_captcha_counter: Arc::default(),
        })
    }

    /// Carry `previous` into a new generation, only patching its proxy.
    ///
    /// The jar and the captcha counter are shared with `previous`. The
    /// transport is reused as long as the proxy did not change.
    pub(crate) fn patch(&self, previous: &Client, plan: SlotPlan) -> Result<Client> {
        check_proxy(plan.id, plan.proxy.as_ref())?;
        let transport = if previous.proxy == plan.proxy {
            previous.transport.clone()
        } else {
            debug!(
                "Client {}: proxy changed, rebuilding transport",
                plan.id
            );
            self.transport(plan.id, plan.proxy.as_ref(), &previous.cookie_jar)?
        };

        Ok(Client {
            id: plan.id,
            generation: plan.generation,
            transport,
            cookie_jar: Arc::clone(&previous.cookie_jar),
            saved_cookies: previous.saved_cookies.clone(),
            proxy: plan.proxy,
            timeout: self.query_timeout,
            without_captcha_counter: Arc::clone(&previous.without_captcha_counter),
        })
    }

    fn transport(
        &self,
        slot: usize,
        proxy: Option<&Url>,
        jar: &Arc<CookieStoreMutex>,
    ) -> Result<reqwest::Client> {
        let builder = reqwest::ClientBuilder::new()
            .gzip(true)
            .danger_accept_invalid_certs(true)
            .timeout(self.query_timeout)
            .connect_timeout(self.query_timeout)
            .pool_idle_timeout(self.idle_conn_timeout)
            .pool_max_idle_per_host(self.max_idle_conns)
            .cookie_provider(Arc::clone(jar));

        // System proxies are never consulted
        let builder = match proxy {
            Some(url) => builder.proxy(
                Proxy::all(url.as_str()).map_err(|source| ErrorKind::BuildClient { slot, source })?,
            ),
            None => builder.no_proxy(),
        };

        let builder = match &self.layer {
            Some(layer) => layer.layer(builder, slot),
            None => builder,
        };

        builder
            .build()
            .map_err(|source| ErrorKind::BuildClient { slot, source })
    }
}

fn check_proxy(slot: usize, proxy: Option<&Url>) -> Result<()> {
    match proxy {
        Some(url) if !SUPPORTED_PROXY_SCHEMES.contains(&url.scheme()) => {
            Err(ErrorKind::InvalidProxy {
                slot,
                url: url.clone(),
            })
        }
        _ => Ok(()),
    }
}

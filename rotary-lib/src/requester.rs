use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use rand::Rng;
use reqwest::{Request, Response};
use tokio::sync::watch;
use tokio::time::Instant;
use typed_builder::TypedBuilder;
use url::Url;

use crate::captcha::{CaptchaConnector, CaptchaSolver};
use crate::client::{Client, ClientFactory, TransportLayer, UserAgentLayer};
use crate::config::Config;
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::pool::{ClientPool, Generation};
use crate::provider::{CookieProvider, ProxySource};
use crate::ratelimit::{HostKey, ThrottleEngine};
use crate::refresh::RefreshController;
use crate::shutdown::{ShutdownSignal, pause};
use crate::types::Outcome;
use crate::user_agent::{UserAgent, UserAgentCatalog, UserAgentSource};
use crate::{ErrorKind, Result};

/// Builder for a [`Requester`].
///
/// Collaborators are only required by the features that use them. Starting
/// fails fast when an enabled feature lacks its collaborator.
///
/// # Examples
///
/// ```no_run
/// use rotary_lib::{Config, RequesterBuilder, Result};
///
/// #[tokio::main]
/// async fn main() -> Result<()> {
///     let requester = RequesterBuilder::builder()
///         .config(Config::default())
///         .build()
///         .start()
///         .await?;
///     let client = requester.get_client()?;
///     let response = client.get("https://example.com".parse().unwrap()).send().await;
///     Ok(())
/// }
/// ```
#[derive(TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
#[builder(builder_method(doc = "
Create a builder for building `RequesterBuilder`.

On the builder call, call methods with same name as its fields to set their values.

Finally, call `.build()` to create the instance of `RequesterBuilder`.
"))]
pub struct RequesterBuilder {
    /// Configuration snapshot, validated by [`RequesterBuilder::start`]
    #[builder(setter(!strip_option))]
    config: Config,

    /// Supplies one cookie string per identity on every refresh.
    /// Without it every identity starts with an empty jar.
    cookie_provider: Option<Arc<dyn CookieProvider>>,

    /// Supplies the proxy list, required when proxy rotation is enabled
    proxy_source: Option<Arc<dyn ProxySource>>,

    /// Connects to the captcha solver, required when captcha is enabled
    captcha_connector: Option<Arc<dyn CaptchaConnector>>,

    /// Receives measurements when metrics are enabled
    metrics: Option<Arc<dyn MetricsSink>>,

    /// Supplies the user-agent catalog, required when user agents are enabled
    user_agent_source: Option<Arc<dyn UserAgentSource>>,

    /// Customizes each identity's transport. With fingerprinting enabled and
    /// no layer given, a [`UserAgentLayer`] is used.
    transport_layer: Option<Arc<dyn TransportLayer>>,

    /// Stops background loops and waiting callers once it turns `true`
    shutdown: Option<watch::Receiver<bool>>,
}

impl RequesterBuilder {
    /// Validate the configuration, connect the collaborators, build the
    /// first client generation and start the background loops.
    ///
    /// No background task is spawned unless every step succeeds.
    ///
    /// # Errors
    ///
    /// Returns an `Err` if:
    /// - the configuration is invalid
    /// - an enabled feature lacks its collaborator, or the collaborator is unreachable
    /// - the first client generation cannot be built
    pub async fn start(self) -> Result<Requester> {
        let Self {
            config,
            cookie_provider,
            proxy_source,
            captcha_connector,
            metrics,
            user_agent_source,
            transport_layer,
            shutdown,
        } = self;

        config.validate()?;
        if config.proxy.enabled && proxy_source.is_none() {
            return Err(ErrorKind::collaborator(
                "proxy source",
                "proxy rotation is enabled but no proxy source was supplied",
            ));
        }

        let metrics: Arc<dyn MetricsSink> = match metrics {
            Some(metrics) if config.enable_metrics => metrics,
            _ => Arc::new(NoopMetrics),
        };

        let captcha = if config.captcha.enabled {
            Some(connect_captcha(&config, captcha_connector).await?)
        } else {
            None
        };

        let user_agents = if config.enable_user_agents {
            let source = user_agent_source.ok_or_else(|| {
                ErrorKind::collaborator(
                    "user agent source",
                    "user agents are enabled but no source was supplied",
                )
            })?;
            Some(Arc::new(UserAgentCatalog::load(source.as_ref()).await?))
        } else {
            None
        };

        let layer = transport_layer.or_else(|| fingerprint_layer(&config, user_agents.as_ref()));
        let factory = ClientFactory::new(&config, layer);
        let controller = Arc::new(RefreshController::new(
            &config,
            factory,
            cookie_provider,
            proxy_source,
        ));

        let pool = Arc::new(ClientPool::new(controller.initial().await?));
        let size = pool.size();
        if config.randomize_round_robin_start && size > 0 {
            pool.seed_counter(rand::thread_rng().gen_range(0..size as u64));
        }

        let (stop, stop_rx) = watch::channel(false);
        let signal = ShutdownSignal::new(stop_rx, shutdown);
        let throttle = Arc::new(
            ThrottleEngine::new(config.throttle.clone(), Arc::clone(&metrics))
                .with_shutdown(signal.clone()),
        );

        tokio::spawn(Arc::clone(&controller).run(Arc::clone(&pool), signal.clone()));
        if config.throttle.enabled {
            tokio::spawn(Arc::clone(&throttle).run(signal.clone()));
        }
        info!("Requester started with {size} clients");

        Ok(Requester {
            config,
            pool,
            controller,
            throttle,
            metrics,
            captcha,
            user_agents,
            shutdown: signal,
            stop,
        })
    }
}

async fn connect_captcha(
    config: &Config,
    connector: Option<Arc<dyn CaptchaConnector>>,
) -> Result<Arc<dyn CaptchaSolver>> {
    let endpoint = &config.captcha.solver;
    let connector = connector.ok_or_else(|| {
        ErrorKind::collaborator(
            "captcha solver",
            "captcha is enabled but no connector was supplied",
        )
    })?;

    match tokio::time::timeout(endpoint.timeout, connector.connect(endpoint)).await {
        Ok(Ok(solver)) => {
            debug!("Connected to captcha solver at {}", endpoint.address());
            Ok(solver)
        }
        Ok(Err(e)) => Err(ErrorKind::collaborator(
            "captcha solver",
            format!("can't connect to {}: {e}", endpoint.address()),
        )),
        Err(_) => Err(ErrorKind::collaborator(
            "captcha solver",
            format!(
                "connecting to {} timed out after {:?}",
                endpoint.address(),
                endpoint.timeout
            ),
        )),
    }
}

fn fingerprint_layer(
    config: &Config,
    user_agents: Option<&Arc<UserAgentCatalog>>,
) -> Option<Arc<dyn TransportLayer>> {
    let fingerprint = &config.fingerprint;
    if !fingerprint.enabled {
        return None;
    }
    let layer = if fingerprint.randomize {
        let fallback = Some(fingerprint.user_agent.clone()).filter(|ua| !ua.is_empty());
        UserAgentLayer::randomized(user_agents.cloned().unwrap_or_default(), fallback)
    } else {
        UserAgentLayer::fixed(fingerprint.user_agent.clone())
    };
    Some(Arc::new(layer))
}

/// Hands out egress identities from a rotating pool, gated by the adaptive
/// throttling engine.
///
/// Dropping the requester stops its background loops.
pub struct Requester {
    config: Config,
    pool: Arc<ClientPool>,
    controller: Arc<RefreshController>,
    throttle: Arc<ThrottleEngine>,
    metrics: Arc<dyn MetricsSink>,
    captcha: Option<Arc<dyn CaptchaSolver>>,
    user_agents: Option<Arc<UserAgentCatalog>>,
    shutdown: ShutdownSignal,
    stop: watch::Sender<bool>,
}

impl fmt::Debug for Requester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Requester")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .field("throttle", &self.throttle)
            .finish_non_exhaustive()
    }
}

impl Requester {
    /// Next client in round-robin order, ignoring throttles
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::PoolExhausted`] if the pool has no proxied clients
    pub fn get_client(&self) -> Result<Arc<Client>> {
        self.pool.select()
    }

    /// Next client in round-robin order whose throttle for `url` admits a
    /// request right now.
    ///
    /// Every client of the pool is tried once per lap. If none is admitted,
    /// the caller sleeps until the earliest client may have capacity again.
    /// Without throttling this is [`Requester::get_client`].
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::AdmissionTimeout`] after `wait_client_timeout`,
    /// [`ErrorKind::PoolExhausted`] when every client is banned without an
    /// option to wait, and [`ErrorKind::Shutdown`] on shutdown
    pub async fn get_throttled_client(&self, url: &Url) -> Result<Arc<Client>> {
        if !self.config.throttle.enabled {
            return self.get_client();
        }

        let host = HostKey::try_from(url)?;
        let started = Instant::now();
        let deadline = started + self.config.throttle.wait_client_timeout;
        let mut shutdown = self.shutdown.clone();

        loop {
            let mut earliest: Option<Duration> = None;
            for _ in 0..self.pool.size().max(1) {
                let client = self.pool.select()?;
                match self.throttle.try_admit(client.id(), url) {
                    Ok(()) => return Ok(client),
                    Err(
                        ErrorKind::Throttled { retry_after, .. }
                        | ErrorKind::Banned {
                            remaining: Some(retry_after),
                            ..
                        },
                    ) => {
                        earliest = Some(earliest.map_or(retry_after, |e| e.min(retry_after)));
                    }
                    Err(ErrorKind::Banned { remaining: None, .. }) => {}
                    Err(e) => return Err(e),
                }
            }

            let Some(wait) = earliest else {
                return Err(ErrorKind::PoolExhausted);
            };
            let now = Instant::now();
            if now >= deadline {
                return Err(ErrorKind::AdmissionTimeout {
                    host: host.to_string(),
                    waited: now - started,
                });
            }
            pause(Some(&mut shutdown), (now + wait).min(deadline)).await?;
        }
    }

    /// Client at slot `id`, for workflows that stick to one identity
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::ClientIdOutOfRange`] if the pool has no such slot
    pub fn get_client_by_id(&self, id: usize) -> Result<Arc<Client>> {
        self.pool.select_by_id(id)
    }

    /// The designated client without proxy
    #[must_use]
    pub fn get_client_no_proxy(&self) -> Arc<Client> {
        self.pool.no_proxy_client()
    }

    /// The client without proxy, if its throttle for `url` admits a request
    /// right now
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Throttled`] or [`ErrorKind::Banned`] if it does not
    pub fn get_throttled_client_no_proxy(&self, url: &Url) -> Result<Arc<Client>> {
        let client = self.pool.no_proxy_client();
        if self.config.throttle.enabled {
            self.throttle.try_admit(client.id(), url)?;
        }
        Ok(client)
    }

    /// Wait until `client` may send a request to `url`
    ///
    /// # Errors
    ///
    /// See [`ThrottleEngine::admit`]
    pub async fn admit(&self, client: &Client, url: &Url) -> Result<()> {
        if !self.config.throttle.enabled {
            return Ok(());
        }
        self.throttle.admit(client.id(), url).await
    }

    /// Report how a request of `client` to `url` went
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidUrlHost`] if `url` has no host
    pub fn report(&self, client: &Client, url: &Url, outcome: Outcome) -> Result<()> {
        if !self.config.throttle.enabled {
            return Ok(());
        }
        self.throttle.report(client.id(), url, outcome)
    }

    /// Send `request` through the next admitted client, reporting the outcome
    ///
    /// # Errors
    ///
    /// Returns admission failures as in [`Requester::get_throttled_client`]
    /// and [`ErrorKind::NetworkRequest`] if the request itself fails
    pub async fn execute(&self, request: Request) -> Result<(Arc<Client>, Response)> {
        let client = self.get_throttled_client(request.url()).await?;
        let response = self.dispatch(&client, request).await?;
        Ok((client, response))
    }

    /// Send `request` through `client`, waiting for admission first
    ///
    /// # Errors
    ///
    /// Returns admission failures as in [`Requester::admit`] and
    /// [`ErrorKind::NetworkRequest`] if the request itself fails
    pub async fn execute_on(&self, client: &Client, request: Request) -> Result<Response> {
        self.admit(client, request.url()).await?;
        self.dispatch(client, request).await
    }

    async fn dispatch(&self, client: &Client, request: Request) -> Result<Response> {
        let url = request.url().clone();
        let started = Instant::now();
        let result = client.transport().execute(request).await;
        let outcome = Outcome::from_result(&result);

        self.metrics.record_request(
            client.id(),
            url.host_str().unwrap_or_default(),
            outcome,
            started.elapsed(),
        );
        // The response is the caller's either way
        if let Err(e) = self.report(client, &url, outcome) {
            warn!("{url}: outcome of client {} not recorded: {e}", client.id());
        }
        debug!("{url} via client {}: {outcome:?}", client.id());

        result.map_err(ErrorKind::NetworkRequest)
    }

    /// Number of proxied clients in the current generation
    #[must_use]
    pub fn clients_count(&self) -> usize {
        self.pool.size()
    }

    /// True if identities are sized and routed by the proxy list
    #[must_use]
    pub const fn is_proxy_enabled(&self) -> bool {
        self.config.proxy.enabled
    }

    /// The connected captcha solver, if captcha is enabled
    #[must_use]
    pub fn captcha_solver(&self) -> Option<Arc<dyn CaptchaSolver>> {
        self.captcha.clone()
    }

    /// How many solving attempts callers should make per challenge
    #[must_use]
    pub const fn captcha_attempts(&self) -> u32 {
        self.config.captcha.attempts
    }

    /// Forward a handled captcha to the metrics sink
    pub fn record_captcha(&self, solved: bool) {
        self.metrics.record_captcha(solved);
    }

    /// A random user agent from the catalog
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::NoUserAgent`] if the catalog is empty or disabled
    pub fn user_agent(&self) -> Result<UserAgent> {
        self.catalog()?.random().cloned()
    }

    /// A random user agent of the given hardware type
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::NoUserAgent`] if no record has that hardware type
    pub fn user_agent_for_hardware(&self, hardware_type: &str) -> Result<UserAgent> {
        self.catalog()
            .map_err(|_| ErrorKind::NoUserAgent(Some(hardware_type.to_string())))?
            .random_for_hardware(hardware_type)
            .cloned()
    }

    fn catalog(&self) -> Result<&UserAgentCatalog> {
        self.user_agents
            .as_deref()
            .ok_or(ErrorKind::NoUserAgent(None))
    }

    /// The throttling engine, e.g. for [`ThrottleEngine::set_rps`] or statistics
    #[must_use]
    pub fn throttle(&self) -> &ThrottleEngine {
        &self.throttle
    }

    /// The current client generation
    #[must_use]
    pub fn generation(&self) -> Arc<Generation> {
        self.pool.snapshot()
    }

    /// Run a refresh cycle right away instead of waiting for the next tick
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::RefreshFailed`] if the cycle failed; the pool
    /// keeps serving the previous generation
    pub async fn refresh(&self) -> Result<()> {
        self.controller.refresh(&self.pool).await
    }

    /// Stop the background loops and fail waiting callers with
    /// [`ErrorKind::Shutdown`]
    pub fn shutdown(&self) {
        // Receivers only go away together with the loops
        let _ = self.stop.send(true);
    }

    /// The configuration the requester runs with
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }
}

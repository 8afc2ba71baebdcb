//! Static configuration snapshot consumed by the requester.
//!
//! Every field has a default, so a partial TOML file deserializes into a
//! complete [`Config`]. [`Config::validate`] runs before any network client
//! is constructed.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::{ErrorKind, Result};

/// Default timeout of a single request
const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(20);
/// Default time an idle pooled connection is kept open
const DEFAULT_IDLE_CONN_TIMEOUT: Duration = Duration::from_secs(90);
/// Default number of idle connections kept per identity and host
const DEFAULT_MAX_IDLE_CONNS: usize = 100;
/// Default number of proxied identities
const DEFAULT_CLIENTS_COUNT: usize = 1;
/// Default interval between two refresh cycles
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(600);

/// Proxy schemes the transport knows how to dial
pub(crate) const SUPPORTED_PROXY_SCHEMES: &[&str] = &["http", "https", "socks5", "socks5h"];

/// Top-level requester configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Timeout of a whole request, also used as connect timeout
    #[serde(with = "humantime_serde")]
    pub query_timeout: Duration,

    /// How long an idle pooled connection is kept
    #[serde(with = "humantime_serde")]
    pub idle_conn_timeout: Duration,

    /// Maximum idle connections kept per identity and host
    pub max_idle_conns: usize,

    /// Forward request, captcha and throttle measurements to the metrics sink
    pub enable_metrics: bool,

    /// Number of proxied identities when proxy rotation is disabled
    pub default_clients_count: usize,

    /// Interval between two refresh cycles
    #[serde(with = "humantime_serde")]
    pub clients_refresh_interval: Duration,

    /// Keep transports and cookie jars across refreshes, only patching proxies
    pub preserve_clients_on_refresh: bool,

    /// Single upstream proxy (usually a local Tor SOCKS port) used by every
    /// proxied identity when proxy rotation is disabled
    pub tor_proxy: Option<Url>,

    /// Load the user-agent catalog at startup
    pub enable_user_agents: bool,

    /// Start the round-robin counter at a random slot
    pub randomize_round_robin_start: bool,

    /// Origin the provider's cookie strings belong to.
    ///
    /// Without it, cookie strings are kept on each client verbatim but not
    /// loaded into the cookie jar.
    pub cookie_url: Option<Url>,

    /// Adaptive per-host throttling
    pub throttle: ThrottleConfig,

    /// Captcha solver connection
    pub captcha: CaptchaConfig,

    /// Rotating proxy list
    pub proxy: ProxyConfig,

    /// Per-identity fingerprint customization
    pub fingerprint: FingerprintConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            idle_conn_timeout: DEFAULT_IDLE_CONN_TIMEOUT,
            max_idle_conns: DEFAULT_MAX_IDLE_CONNS,
            enable_metrics: false,
            default_clients_count: DEFAULT_CLIENTS_COUNT,
            clients_refresh_interval: DEFAULT_REFRESH_INTERVAL,
            preserve_clients_on_refresh: false,
            tor_proxy: None,
            enable_user_agents: false,
            randomize_round_robin_start: false,
            cookie_url: None,
            throttle: ThrottleConfig::default(),
            captcha: CaptchaConfig::default(),
            proxy: ProxyConfig::default(),
            fingerprint: FingerprintConfig::default(),
        }
    }
}

/// Throttling engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThrottleConfig {
    /// Gate requests through the throttling engine
    pub enabled: bool,

    /// Keep one throttle per (client, host) instead of one per host
    pub per_client: bool,

    /// Longest time a caller is queued waiting for capacity
    #[serde(with = "humantime_serde")]
    pub wait_client_timeout: Duration,

    /// Throttles without activity for this long are evicted
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// Length of one evaluation lap
    #[serde(with = "humantime_serde")]
    pub lap_interval: Duration,

    /// Lower bound and initial value of the per-throttle rate
    pub min_rps: u32,

    /// Upper bound of the per-throttle rate
    pub max_rps: u32,

    /// Step of an automatic increase
    pub inc_rps: u32,

    /// Step of an automatic decrease
    pub dec_rps: u32,

    /// Disable the feedback loop, rates change only through `set_rps`
    pub manual_mode: bool,

    /// Clean evaluation laps required before an increase
    pub laps_without_fails_before_increase: u32,

    /// Consecutive successes required before an increase
    pub success_before_increase: u32,

    /// Failures required before a decrease
    pub fails_before_decrease: u32,

    /// Temporary bans after repeated failures
    pub ban_domains: BanConfig,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            per_client: true,
            wait_client_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            lap_interval: Duration::from_secs(1),
            min_rps: 1,
            max_rps: 10,
            inc_rps: 1,
            dec_rps: 1,
            manual_mode: false,
            laps_without_fails_before_increase: 0,
            success_before_increase: 10,
            fails_before_decrease: 1,
            ban_domains: BanConfig::default(),
        }
    }
}

/// Ban policy of the throttling engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BanConfig {
    /// Ban throttles after repeated failures
    pub enabled: bool,

    /// How long a ban lasts
    #[serde(with = "humantime_serde")]
    pub duration: Duration,

    /// Consecutive failures that trigger a ban
    pub fails_before_ban: u32,

    /// Let callers wait for a ban to run out instead of failing right away
    pub wait_for_unban: bool,
}

impl Default for BanConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            duration: Duration::from_secs(60),
            fails_before_ban: 5,
            wait_for_unban: true,
        }
    }
}

/// Captcha solver settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptchaConfig {
    /// Connect to the solver at startup
    pub enabled: bool,

    /// Where the solver listens
    pub solver: CaptchaEndpoint,

    /// How many solving attempts callers should make per challenge
    pub attempts: u32,
}

/// Network endpoint of the captcha solver
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptchaEndpoint {
    /// Solver host
    pub host: String,
    /// Solver port
    pub port: u16,
    /// Connection timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl CaptchaEndpoint {
    /// `host:port` form of the endpoint
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Rotating proxy list settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    /// Size the pool by the proxy list and give every identity its own proxy
    pub enabled: bool,
    /// Host of the proxy list service
    pub host: String,
    /// Port of the proxy list service
    pub port: u16,
    /// Timeout when talking to the proxy list service
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Name of the proxy list to fetch
    pub list: String,
}

/// Fingerprint customization applied to each identity's transport
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FingerprintConfig {
    /// Customize the transport of each identity
    pub enabled: bool,
    /// Pick a random fingerprint and user agent per identity
    pub randomize: bool,
    /// Fixed JA3 fingerprint, handed to the transport layer
    pub ja3: String,
    /// Fixed user agent
    pub user_agent: String,
}

impl Config {
    /// Check the configuration for missing or contradicting values
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidConfig`] naming the first offending field
    pub fn validate(&self) -> Result<()> {
        ensure(!self.query_timeout.is_zero(), "query_timeout is empty")?;

        // The engine exists even with throttling off, so its bounds must hold
        self.throttle.validate()?;

        ensure(
            self.default_clients_count >= 1,
            "default_clients_count less than 1",
        )?;
        ensure(
            !self.clients_refresh_interval.is_zero(),
            "clients_refresh_interval is empty",
        )?;
        ensure(self.max_idle_conns != 0, "max_idle_conns is empty")?;
        ensure(
            !self.idle_conn_timeout.is_zero(),
            "idle_conn_timeout is empty",
        )?;

        if let Some(tor) = &self.tor_proxy {
            ensure(
                SUPPORTED_PROXY_SCHEMES.contains(&tor.scheme()),
                "tor_proxy has an unsupported scheme",
            )?;
        }

        if self.proxy.enabled {
            ensure(!self.proxy.host.is_empty(), "proxy.host is empty")?;
            ensure(self.proxy.port >= 1, "proxy.port is empty or less than 1")?;
            ensure(
                self.proxy.timeout >= Duration::from_secs(1),
                "proxy.timeout is empty or less than 1s",
            )?;
            ensure(!self.proxy.list.is_empty(), "proxy.list is empty")?;
        }

        if self.captcha.enabled {
            ensure(!self.captcha.solver.host.is_empty(), "captcha.solver.host is empty")?;
            ensure(self.captcha.solver.port != 0, "captcha.solver.port is empty")?;
            ensure(
                !self.captcha.solver.timeout.is_zero(),
                "captcha.solver.timeout is empty",
            )?;
        }

        if self.fingerprint.enabled && !self.fingerprint.randomize {
            ensure(!self.fingerprint.ja3.is_empty(), "fingerprint.ja3 is empty")?;
            ensure(
                !self.fingerprint.user_agent.is_empty(),
                "fingerprint.user_agent is empty",
            )?;
        }

        Ok(())
    }
}

impl ThrottleConfig {
    fn validate(&self) -> Result<()> {
        ensure(
            !self.wait_client_timeout.is_zero(),
            "throttle.wait_client_timeout is empty",
        )?;
        ensure(!self.idle_timeout.is_zero(), "throttle.idle_timeout is empty")?;
        ensure(!self.lap_interval.is_zero(), "throttle.lap_interval is empty")?;
        ensure(self.min_rps >= 1, "throttle.min_rps less than 1")?;
        ensure(self.max_rps >= 1, "throttle.max_rps less than 1")?;
        ensure(
            self.min_rps <= self.max_rps,
            "throttle.min_rps greater than throttle.max_rps",
        )?;
        ensure(self.inc_rps >= 1, "throttle.inc_rps less than 1")?;
        ensure(self.dec_rps >= 1, "throttle.dec_rps less than 1")?;
        ensure(
            self.success_before_increase >= 1,
            "throttle.success_before_increase less than 1",
        )?;
        ensure(
            self.fails_before_decrease >= 1,
            "throttle.fails_before_decrease less than 1",
        )?;
        if self.ban_domains.enabled {
            ensure(
                !self.ban_domains.duration.is_zero(),
                "throttle.ban_domains.duration is empty",
            )?;
            ensure(
                self.ban_domains.fails_before_ban != 0,
                "throttle.ban_domains.fails_before_ban is empty",
            )?;
        }
        Ok(())
    }

    /// Clamp a rate into `[min_rps, max_rps]`
    #[must_use]
    pub fn clamp_rps(&self, rps: u32) -> u32 {
        rps.clamp(self.min_rps, self.max_rps.max(self.min_rps))
    }
}

fn ensure(condition: bool, message: &str) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(ErrorKind::InvalidConfig(message.to_string()))
    }
}

use crate::verbosity::Verbosity;
use anyhow::{Context, Result};
use clap::Parser;
use const_format::{concatcp, formatcp};
use rotary_lib::Config;
use std::path::{Path, PathBuf};
use std::{fs, time::Duration};
use strum::{Display, EnumString, VariantNames};
use url::Url;

pub(crate) const ROTARY_CONFIG_FILE: &str = "rotary.toml";

const DEFAULT_MAX_CONCURRENCY: usize = 16;

// clap requires `&str` type values for defaults
const MAX_CONCURRENCY_STR: &str = concatcp!(DEFAULT_MAX_CONCURRENCY);
// We want to show the default config file, but also be able to check if the
// user has provided a custom one. Only a missing custom file is an error.
const HELP_MSG_CONFIG_FILE: &str = formatcp!(
    "Configuration file to use\n\n[default: {}]",
    ROTARY_CONFIG_FILE,
);

/// Format of the throttling statistics printed after a run
#[derive(Debug, Default, Clone, Copy, Display, EnumString, VariantNames, PartialEq, Eq)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub(crate) enum StatsFormat {
    /// One line per throttle
    #[default]
    Compact,
    /// A JSON document keyed by throttle
    Json,
}

/// rotary dispatches HTTP requests through a rotating pool of egress
/// identities, each with its own cookie jar and optional proxy, while
/// throttling the request rate per destination host.
///
/// rotary is powered by rotary-lib.
#[derive(Parser, Debug)]
#[command(version, about, next_display_order = None)]
pub(crate) struct RotaryOptions {
    /// URLs to request
    #[arg(name = "urls", required = true)]
    pub(crate) urls: Vec<Url>,

    /// Configuration file to use
    #[arg(short, long = "config")]
    #[arg(help = HELP_MSG_CONFIG_FILE)]
    pub(crate) config_file: Option<PathBuf>,

    #[command(flatten)]
    pub(crate) verbose: Verbosity,

    /// File with one cookie string per line, assigned to the identities in turn.
    /// The file is read again on every pool refresh.
    #[arg(long, value_name = "FILE")]
    pub(crate) cookies: Option<PathBuf>,

    /// File with one proxy URL per line, required when proxy rotation is enabled.
    /// The file is read again on every pool refresh.
    #[arg(long, value_name = "FILE")]
    pub(crate) proxies: Option<PathBuf>,

    /// JSON file with user-agent records, required when user agents are enabled
    #[arg(long, value_name = "FILE")]
    pub(crate) user_agents: Option<PathBuf>,

    /// Request every URL this many times
    #[arg(long, default_value = "1")]
    pub(crate) repeat: usize,

    /// Maximum number of requests in flight
    #[arg(long, default_value = MAX_CONCURRENCY_STR)]
    pub(crate) max_concurrency: usize,

    /// Enable adaptive per-host throttling, overriding the configuration file
    #[arg(long)]
    pub(crate) throttle: bool,

    /// Maximum requests per second and host when throttling, overriding the
    /// configuration file
    #[arg(long)]
    pub(crate) max_rps: Option<u32>,

    /// Print throttling statistics after the run
    #[arg(long)]
    pub(crate) stats: bool,

    /// Format of the throttling statistics
    #[arg(long, default_value_t)]
    pub(crate) format: StatsFormat,

    /// Give up on a request after this many seconds, overriding the
    /// configuration file
    #[arg(short, long, value_parser = parse_secs)]
    pub(crate) timeout: Option<Duration>,
}

fn parse_secs(s: &str) -> Result<Duration, std::num::ParseIntError> {
    s.parse().map(Duration::from_secs)
}

impl RotaryOptions {
    /// Load the configuration file, if any, and apply the command-line
    /// overrides on top of it
    pub(crate) fn load_config(&self) -> Result<Config> {
        let mut config = if let Some(path) = &self.config_file {
            load_from_file(path).with_context(|| {
                format!("Cannot load configuration file `{}`", path.display())
            })?
        } else {
            // Without an explicit file, the default one is used if it exists.
            // An invalid default file is still an error.
            let default_config = PathBuf::from(ROTARY_CONFIG_FILE);
            if default_config.is_file() {
                load_from_file(&default_config).with_context(|| {
                    format!(
                        "Cannot load default configuration file `{}`",
                        default_config.display()
                    )
                })?
            } else {
                Config::default()
            }
        };

        if self.throttle {
            config.throttle.enabled = true;
        }
        if let Some(max_rps) = self.max_rps {
            config.throttle.max_rps = max_rps;
        }
        if let Some(timeout) = self.timeout {
            config.query_timeout = timeout;
        }
        Ok(config)
    }
}

/// Load configuration from a file
pub(crate) fn load_from_file(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)?;
    toml::from_str(&contents).with_context(|| "Failed to parse configuration file")
}

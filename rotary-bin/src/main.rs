//! `rotary` sends HTTP requests through a rotating pool of egress identities.
//!
//! Each identity is an HTTP client with its own cookie jar and, when proxy
//! rotation is enabled, its own proxy. With throttling enabled, requests to a
//! host are kept below an adaptive per-second ceiling.
//!
//! Request a page through the default pool:
//! ```sh
//! rotary https://example.com/
//! ```
//!
//! Rotate through proxies and seed every identity from a cookie file:
//! ```sh
//! rotary --config rotary.toml --proxies proxies.txt --cookies cookies.txt https://example.com/
//! ```
//!
//! Hammer a host with throttling and print the throttle statistics:
//! ```sh
//! rotary --throttle --max-rps 5 --repeat 50 --stats https://example.com/
//! ```
#![warn(clippy::all, clippy::pedantic)]
#![warn(
    absolute_paths_not_starting_with_crate,
    rustdoc::invalid_html_tags,
    missing_copy_implementations,
    missing_debug_implementations,
    semicolon_in_expressions_from_macros,
    unreachable_pub,
    unused_extern_crates,
    variant_size_differences,
    clippy::missing_const_for_fn
)]
#![deny(anonymous_parameters, macro_use_extern_crate)]
#![deny(missing_docs)]

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use formatters::log::init_logging;
use futures::{StreamExt, stream};
use log::{error, info, warn};
use reqwest::{Method, Request};
use rotary_lib::{CookieProvider, Requester, RequesterBuilder, StaticCookies};
use tokio::sync::watch;
use url::Url;

mod formatters;
mod options;
mod sources;
mod verbosity;

use crate::formatters::stats::RunSummary;
use crate::options::{ROTARY_CONFIG_FILE, RotaryOptions};
use crate::sources::{CookieFile, LogMetrics, ProxyFile, UserAgentFile};

/// A C-like enum that can be cast to `i32` and used as process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitCode {
    Success = 0,
    // NOTE: exit code 1 is used for any `Result::Err` bubbled up to `main()`
    #[allow(unused)]
    UnexpectedFailure = 1,
    RequestFailure = 2,
    ConfigFile = 3,
}

fn main() -> Result<()> {
    // std::process::exit doesn't run destructors, so the actual work happens
    // in another function
    let exit_code = run_main()?;
    std::process::exit(exit_code);
}

/// Load the configuration, set up the runtime and run the requests
fn run_main() -> Result<i32> {
    let opts = RotaryOptions::parse();
    init_logging(&opts.verbose);

    let config = match opts.load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Error while loading config: {e:?}\nSee `{ROTARY_CONFIG_FILE}` in the README");
            return Ok(ExitCode::ConfigFile as i32);
        }
    };
    if let Err(e) = config.validate() {
        error!("{e}");
        return Ok(ExitCode::ConfigFile as i32);
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(&opts, config))
}

async fn start(opts: &RotaryOptions, config: rotary_lib::Config) -> Result<Requester> {
    let cookies: Arc<dyn CookieProvider> = match &opts.cookies {
        Some(path) => Arc::new(CookieFile(path.clone())),
        None => Arc::new(StaticCookies::default()),
    };
    let proxies = opts.proxies.clone().map(ProxyFile);
    if config.proxy.enabled && proxies.is_none() {
        warn!("Proxy rotation is enabled but `--proxies` was not given");
    }

    let (shutdown, signal) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            let _ = shutdown.send(true);
        }
    });

    let builder = RequesterBuilder::builder()
        .config(config)
        .cookie_provider(cookies)
        .metrics(Arc::new(LogMetrics))
        .user_agent_source(Arc::new(UserAgentFile(opts.user_agents.clone())))
        .shutdown(signal);
    let requester = match proxies {
        Some(proxies) => builder.proxy_source(Arc::new(proxies)).build(),
        None => builder.build(),
    }
    .start()
    .await?;
    Ok(requester)
}

/// Send every request and print the results
async fn run(opts: &RotaryOptions, config: rotary_lib::Config) -> Result<i32> {
    let requester = start(opts, config)
        .await
        .context("Cannot start requester")?;

    let urls: Vec<Url> = (0..opts.repeat)
        .flat_map(|_| opts.urls.iter().cloned())
        .collect();
    let requests = urls.len();

    let results: Vec<bool> = stream::iter(urls)
        .map(|url| send(&requester, url))
        .buffer_unordered(opts.max_concurrency.max(1))
        .collect()
        .await;
    let succeeded = results.iter().filter(|ok| **ok).count();

    if opts.stats {
        let summary = RunSummary {
            requests,
            succeeded,
            failed: requests - succeeded,
            clients: requester.clients_count(),
            generation: requester.generation().number(),
            throttles: requester.throttle().stats(),
        };
        print!("{}", formatters::stats::format(&summary, opts.format)?);
    }

    requester.shutdown();
    let exit_code = if succeeded == requests {
        ExitCode::Success
    } else {
        ExitCode::RequestFailure
    };
    Ok(exit_code as i32)
}

/// Send one GET request, returning whether it succeeded
async fn send(requester: &Requester, url: Url) -> bool {
    match requester.execute(Request::new(Method::GET, url.clone())).await {
        Ok((client, response)) => {
            let status = response.status();
            let via = client
                .proxy_host()
                .map_or_else(|| "direct".to_string(), |proxy| format!("via {proxy}"));
            println!("[{}] {url} (client {}, {via})", status.as_u16(), client.id());
            status.is_success()
        }
        Err(e) => {
            println!("[ERR] {url}: {e}");
            false
        }
    }
}

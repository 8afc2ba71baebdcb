//! Builds client generations and keeps the pool fresh.
//!
//! Every cycle fetches the material for the next generation (proxy list and
//! cookie strings), builds all slots in parallel on blocking worker threads
//! and publishes the result only if every slot succeeded. A failed cycle
//! leaves the live pool untouched.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{StreamExt, stream};
use log::{debug, error, info, warn};
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use url::Url;

use crate::client::{Client, ClientFactory, SlotPlan};
use crate::config::Config;
use crate::pool::{ClientPool, Generation};
use crate::provider::{CookieProvider, ProxySource};
use crate::shutdown::ShutdownSignal;
use crate::{ErrorKind, Result};

/// Creates and replaces the generations served by a [`ClientPool`]
pub(crate) struct RefreshController {
    factory: ClientFactory,
    cookies: Option<Arc<dyn CookieProvider>>,
    proxies: Option<Arc<dyn ProxySource>>,
    proxy_rotation: bool,
    default_clients_count: usize,
    tor_proxy: Option<Url>,
    preserve: bool,
    interval: Duration,
    next_generation: AtomicU64,
    /// Held for a whole cycle so generations are published in numbering order
    cycle: Mutex<()>,
}

impl RefreshController {
    pub(crate) fn new(
        config: &Config,
        factory: ClientFactory,
        cookies: Option<Arc<dyn CookieProvider>>,
        proxies: Option<Arc<dyn ProxySource>>,
    ) -> Self {
        Self {
            factory,
            cookies,
            proxies,
            proxy_rotation: config.proxy.enabled,
            default_clients_count: config.default_clients_count,
            tor_proxy: config.tor_proxy.clone(),
            preserve: config.preserve_clients_on_refresh,
            interval: config.clients_refresh_interval,
            next_generation: AtomicU64::new(0),
            cycle: Mutex::new(()),
        }
    }

    /// Build the first generation
    pub(crate) async fn initial(&self) -> Result<Generation> {
        self.build_generation(None)
            .await
            .map_err(|e| ErrorKind::RefreshFailed(Box::new(e)))
    }

    /// Run one refresh cycle against `pool`, publishing on success
    pub(crate) async fn refresh(&self, pool: &ClientPool) -> Result<()> {
        let _cycle = self.cycle.lock().await;
        let previous = pool.snapshot();
        let generation = self
            .build_generation(Some(&previous))
            .await
            .map_err(|e| ErrorKind::RefreshFailed(Box::new(e)))?;

        let (number, size) = (generation.number(), generation.len());
        pool.replace(generation);
        info!("Published client generation {number} with {size} clients");
        Ok(())
    }

    /// Refresh `pool` every `clients_refresh_interval` until `shutdown` fires.
    /// Failed cycles are logged and retried on the next tick.
    pub(crate) async fn run(self: Arc<Self>, pool: Arc<ClientPool>, mut shutdown: ShutdownSignal) {
        let mut interval = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("Started client refresh loop");

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                () = shutdown.fired() => break,
            }
            tokio::select! {
                result = self.refresh(&pool) => {
                    if let Err(e) = result {
                        error!("{e}");
                    }
                }
                () = shutdown.fired() => break,
            }
        }
        debug!("Client refresh loop stopped");
    }

    async fn build_generation(&self, previous: Option<&Generation>) -> Result<Generation> {
        let number = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let plans = self.plan(number).await?;
        let count = plans.len() - 1;

        let parallelism = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
        let mut results: Vec<(usize, Result<Client>)> = stream::iter(plans)
            .map(|plan| {
                let factory = self.factory.clone();
                let carried = self.carried_client(previous, plan.id, count);
                async move {
                    let slot = plan.id;
                    let result = tokio::task::spawn_blocking(move || match carried {
                        Some(previous) => factory.patch(&previous, plan),
                        None => factory.build(plan),
                    })
                    .await
                    .unwrap_or_else(|e| {
                        Err(ErrorKind::BuildTask {
                            slot,
                            reason: e.to_string(),
                        })
                    });
                    (slot, result)
                }
            })
            .buffer_unordered(parallelism)
            .collect()
            .await;
        results.sort_by_key(|(slot, _)| *slot);

        let failed = results.iter().filter(|(_, result)| result.is_err()).count();
        if failed > 0 {
            warn!("{failed} of {} clients failed to build", results.len());
        }

        // Sorted by slot, so the first error belongs to the lowest failing slot
        let mut clients = results
            .into_iter()
            .map(|(_, result)| result.map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        let no_proxy = clients.pop().ok_or(ErrorKind::PoolExhausted)?;

        Ok(Generation::new(number, clients, no_proxy))
    }

    /// In preserve mode, the client of the previous generation to carry
    /// into `slot`. The last slot carries the previous no-proxy client.
    fn carried_client(
        &self,
        previous: Option<&Generation>,
        slot: usize,
        count: usize,
    ) -> Option<Arc<Client>> {
        if !self.preserve {
            return None;
        }
        let previous = previous?;
        if slot == count {
            Some(Arc::clone(previous.no_proxy()))
        } else {
            previous.clients().get(slot).cloned()
        }
    }

    /// Fetch the material of the next generation and assign it to slots
    async fn plan(&self, number: u64) -> Result<Vec<SlotPlan>> {
        let proxies = if self.proxy_rotation {
            let source = self
                .proxies
                .as_ref()
                .ok_or_else(|| ErrorKind::collaborator("proxy source", "not configured"))?;
            let proxies = source.proxies().await?;
            if proxies.is_empty() {
                return Err(ErrorKind::EmptyProxyList);
            }
            Some(proxies)
        } else {
            None
        };
        let count = proxies.as_ref().map_or(self.default_clients_count, Vec::len);

        // One extra string seeds the no-proxy client
        let requested = count + 1;
        let cookies = match &self.cookies {
            Some(provider) => {
                let cookies = provider.cookies(requested).await?;
                if cookies.len() != requested {
                    return Err(ErrorKind::CookieCountMismatch {
                        requested,
                        received: cookies.len(),
                    });
                }
                info!("Got {requested} new cookies");
                cookies
            }
            None => vec![String::new(); requested],
        };

        Ok(cookies
            .into_iter()
            .enumerate()
            .map(|(id, cookies)| {
                let proxy = if id == count {
                    None
                } else {
                    match &proxies {
                        Some(proxies) => proxies.get(id).cloned(),
                        None => self.tor_proxy.clone(),
                    }
                };
                SlotPlan {
                    id,
                    generation: number,
                    proxy,
                    cookies,
                }
            })
            .collect())
    }
}

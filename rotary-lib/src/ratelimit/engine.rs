use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, info, warn};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::{Instant, MissedTickBehavior};
use url::Url;

use super::state::{Admission, ThrottleState};
use super::{HostKey, ThrottleKey, ThrottleStats, ThrottleStatsMap};
use crate::config::ThrottleConfig;
use crate::metrics::MetricsSink;
use crate::shutdown::{ShutdownSignal, pause};
use crate::types::Outcome;
use crate::{ErrorKind, Result};

/// Admission state of one key plus the number of callers queued on it
#[derive(Debug)]
struct Throttle {
    state: Mutex<ThrottleState>,
    pending: AtomicUsize,
    leases: AtomicUsize,
}

impl Throttle {
    fn new(config: &ThrottleConfig) -> Self {
        Self {
            state: Mutex::new(ThrottleState::new(config, Instant::now())),
            pending: AtomicUsize::new(0),
            leases: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ThrottleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// A throttle in use by a caller. Evaluation laps never evict a leased
/// throttle, so the caller's admissions and outcomes stay with the throttle
/// the map serves.
///
/// Leases must be taken while the map entry is held, which orders them
/// against the shard lock `retain` takes.
#[derive(Debug)]
struct Lease {
    throttle: Arc<Throttle>,
}

impl Lease {
    fn new(throttle: &Arc<Throttle>) -> Self {
        throttle.leases.fetch_add(1, Ordering::AcqRel);
        Self {
            throttle: Arc::clone(throttle),
        }
    }
}

impl Deref for Lease {
    type Target = Throttle;

    fn deref(&self) -> &Throttle {
        &self.throttle
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.throttle.leases.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Counts a caller as queued on a throttle for as long as it lives
struct PendingGuard<'a> {
    throttle: &'a Throttle,
    key: &'a ThrottleKey,
    metrics: &'a dyn MetricsSink,
}

impl<'a> PendingGuard<'a> {
    fn enter(throttle: &'a Throttle, key: &'a ThrottleKey, metrics: &'a dyn MetricsSink) -> Self {
        let pending = throttle.pending.fetch_add(1, Ordering::AcqRel) + 1;
        metrics.set_throttle_queue(key, pending);
        Self {
            throttle,
            key,
            metrics,
        }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let pending = self.throttle.pending.fetch_sub(1, Ordering::AcqRel) - 1;
        self.metrics.set_throttle_queue(self.key, pending);
    }
}

/// Gates requests per (client, destination host) with a feedback-controlled
/// rate and a failure-triggered ban.
///
/// Throttles are created lazily on the first admission or reported outcome
/// for a key. The evaluation lap, driven by [`ThrottleEngine::lap`], closes
/// the running lap of every throttle, lifts elapsed bans and evicts throttles
/// that saw no activity for `idle_timeout`.
///
/// Each throttle is guarded by its own mutex, so admissions for different
/// keys never contend on a shared lock.
pub struct ThrottleEngine {
    config: ThrottleConfig,
    throttles: DashMap<ThrottleKey, Arc<Throttle>>,
    metrics: Arc<dyn MetricsSink>,
    shutdown: Option<ShutdownSignal>,
}

impl fmt::Debug for ThrottleEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottleEngine")
            .field("config", &self.config)
            .field("throttles", &self.throttles.len())
            .finish_non_exhaustive()
    }
}

impl ThrottleEngine {
    /// Create an engine without any throttle
    #[must_use]
    pub fn new(config: ThrottleConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            config,
            throttles: DashMap::new(),
            metrics,
            shutdown: None,
        }
    }

    /// Let waiting callers give up when `shutdown` fires
    pub(crate) fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// The configuration the engine runs with
    #[must_use]
    pub const fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// The throttle key a request of `client` to `url` is gated by
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidUrlHost`] if `url` has no host
    pub fn key(&self, client: usize, url: &Url) -> Result<ThrottleKey> {
        let host = HostKey::try_from(url)?;
        Ok(ThrottleKey::new(self.config.per_client.then_some(client), host))
    }

    /// Admit a request right away or fail without waiting
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Throttled`] when the rate ceiling is reached and
    /// [`ErrorKind::Banned`] while the throttle is banned
    pub fn try_admit(&self, client: usize, url: &Url) -> Result<()> {
        let key = self.key(client, url)?;
        let throttle = self.throttle(&key);
        let admission = throttle.lock().try_admit(Instant::now(), &self.config);
        match admission {
            Admission::Admitted => Ok(()),
            Admission::Wait(retry_after) => Err(ErrorKind::Throttled { key, retry_after }),
            Admission::Banned(remaining) => Err(ErrorKind::Banned { key, remaining }),
        }
    }

    /// Admit a request, queueing for up to `wait_client_timeout` until the
    /// throttle has capacity.
    ///
    /// A ban that can be waited out and ends before the deadline is waited
    /// out, any other ban rejects immediately.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::AdmissionTimeout`] when no capacity opened in
    /// time, [`ErrorKind::Banned`] for bans that cannot be waited out and
    /// [`ErrorKind::Shutdown`] when the requester shuts down meanwhile
    pub async fn admit(&self, client: usize, url: &Url) -> Result<()> {
        let key = self.key(client, url)?;
        let throttle = self.throttle(&key);
        let started = Instant::now();
        let deadline = started + self.config.wait_client_timeout;
        let _pending = PendingGuard::enter(&throttle, &key, self.metrics.as_ref());
        let mut shutdown = self.shutdown.clone();

        loop {
            let now = Instant::now();
            let admission = throttle.lock().try_admit(now, &self.config);
            let wait = match admission {
                Admission::Admitted => return Ok(()),
                Admission::Wait(wait) => wait,
                Admission::Banned(Some(remaining)) if now + remaining <= deadline => remaining,
                Admission::Banned(remaining) => {
                    return Err(ErrorKind::Banned {
                        key: key.clone(),
                        remaining,
                    });
                }
            };

            if now >= deadline {
                return Err(ErrorKind::AdmissionTimeout {
                    host: key.host.to_string(),
                    waited: now - started,
                });
            }
            debug!("{key}: queued for {wait:?}");
            pause(shutdown.as_mut(), (now + wait).min(deadline)).await?;
        }
    }

    /// Feed the outcome of a request back into the throttle of its key
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidUrlHost`] if `url` has no host
    pub fn report(&self, client: usize, url: &Url, outcome: Outcome) -> Result<()> {
        let key = self.key(client, url)?;
        let throttle = self.throttle(&key);
        let feedback = throttle.lock().record(outcome, Instant::now(), &self.config);

        if let Some(rps) = feedback.rps {
            debug!("{key}: rate changed to {rps} rps after {outcome:?}");
            self.metrics.set_throttle_rps(&key, rps);
        }
        if feedback.banned {
            warn!(
                "{key}: banned for {:?} after {} consecutive failures",
                self.config.ban_domains.duration, self.config.ban_domains.fails_before_ban
            );
        }
        Ok(())
    }

    /// Run one evaluation lap over all throttles
    pub fn lap(&self) {
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout;
        let mut evicted = 0usize;

        self.throttles.retain(|key, throttle| {
            let mut state = throttle.lock();
            if state.lap(now).unbanned {
                info!("{key}: ban lifted");
            }
            let keep = throttle.leases.load(Ordering::Acquire) > 0
                || throttle.pending() > 0
                || state.is_banned()
                || !state.is_idle(now, idle_timeout);
            if !keep {
                evicted += 1;
            }
            keep
        });

        if evicted > 0 {
            debug!("Evicted {evicted} idle throttles");
        }
    }

    /// Run evaluation laps every `lap_interval` until `shutdown` fires
    pub(crate) async fn run(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        let mut interval = tokio::time::interval(self.config.lap_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => self.lap(),
                () = shutdown.fired() => break,
            }
        }
        debug!("Throttle evaluation loop stopped");
    }

    /// Set the rate of a throttle, clamped into `[min_rps, max_rps]`.
    ///
    /// This is the only way rates change in manual mode. Returns the rate
    /// that was applied.
    pub fn set_rps(&self, key: &ThrottleKey, rps: u32) -> u32 {
        let throttle = self.throttle(key);
        let applied = throttle.lock().set_rps(rps, &self.config);
        debug!("{key}: rate set to {applied} rps");
        self.metrics.set_throttle_rps(key, applied);
        applied
    }

    /// Statistics of a single throttle, if it exists
    #[must_use]
    pub fn stats_for(&self, key: &ThrottleKey) -> Option<ThrottleStats> {
        let throttle = self.throttles.get(key).map(|t| Arc::clone(t.value()))?;
        let stats = throttle.lock().stats(Instant::now(), throttle.pending());
        Some(stats)
    }

    /// Statistics of every live throttle
    #[must_use]
    pub fn stats(&self) -> ThrottleStatsMap {
        let now = Instant::now();
        self.throttles
            .iter()
            .map(|entry| {
                let throttle = entry.value();
                let stats = throttle.lock().stats(now, throttle.pending());
                (entry.key().clone(), stats)
            })
            .collect()
    }

    /// Number of live throttles
    #[must_use]
    pub fn len(&self) -> usize {
        self.throttles.len()
    }

    /// True if no throttle is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.throttles.is_empty()
    }

    /// Lease the throttle of `key`, creating it on first use
    fn throttle(&self, key: &ThrottleKey) -> Lease {
        if let Some(throttle) = self.throttles.get(key) {
            return Lease::new(throttle.value());
        }

        // Another caller may have created it in the meantime
        let (throttle, created) = match self.throttles.entry(key.clone()) {
            Entry::Occupied(entry) => (Lease::new(entry.get()), false),
            Entry::Vacant(entry) => {
                let throttle = Arc::new(Throttle::new(&self.config));
                let lease = Lease::new(&throttle);
                entry.insert(throttle);
                (lease, true)
            }
        };

        if created {
            let rps = throttle.lock().current_rps();
            debug!("{key}: new throttle at {rps} rps");
            self.metrics.set_throttle_rps(key, rps);
        }
        throttle
    }
}

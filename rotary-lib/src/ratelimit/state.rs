use governor::clock::Clock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::time::Duration;
use tokio::time::Instant;

use super::clock::TokioClock;
use super::stats::ThrottleStats;
use crate::config::ThrottleConfig;
use crate::types::Outcome;

type Limiter =
    RateLimiter<NotKeyed, InMemoryState, TokioClock, NoOpMiddleware<<TokioClock as Clock>::Instant>>;

/// Result of an admission check against one throttle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// The request was admitted and took a slot of the rate limiter
    Admitted,
    /// The rate limiter is exhausted, a slot opens after the given duration
    Wait(Duration),
    /// The throttle is banned. `Some` carries the time left when the ban can
    /// be waited out, `None` means only an evaluation lap lifts it.
    Banned(Option<Duration>),
}

/// What a reported outcome changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Feedback {
    /// New rate, if the outcome moved it
    pub(crate) rps: Option<u32>,
    /// The outcome triggered a ban
    pub(crate) banned: bool,
}

/// What an evaluation lap changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct LapReport {
    /// An elapsed ban was lifted
    pub(crate) unbanned: bool,
}

/// Feedback-controlled admission state of one throttle.
///
/// Ban and activity bookkeeping take the current instant explicitly. The
/// rate limiter reads the tokio clock, so both follow a paused runtime.
#[derive(Debug)]
pub(crate) struct ThrottleState {
    current_rps: u32,
    successes_since_increase: u32,
    failures_since_decrease: u32,
    ban_failures: u32,
    laps_without_failures: u32,
    failures_this_lap: u32,
    banned_until: Option<Instant>,
    clock: TokioClock,
    limiter: Limiter,
    last_activity: Instant,
    admitted: u64,
    successes: u64,
    failures: u64,
}

impl ThrottleState {
    pub(crate) fn new(config: &ThrottleConfig, now: Instant) -> Self {
        let current_rps = config.clamp_rps(config.min_rps);
        let clock = TokioClock::new(now);
        Self {
            current_rps,
            successes_since_increase: 0,
            failures_since_decrease: 0,
            ban_failures: 0,
            laps_without_failures: 0,
            failures_this_lap: 0,
            banned_until: None,
            clock,
            limiter: limiter(current_rps, clock),
            last_activity: now,
            admitted: 0,
            successes: 0,
            failures: 0,
        }
    }

    pub(crate) const fn current_rps(&self) -> u32 {
        self.current_rps
    }

    pub(crate) const fn is_banned(&self) -> bool {
        self.banned_until.is_some()
    }

    /// Check for capacity and, if there is some, record an admission
    pub(crate) fn try_admit(&mut self, now: Instant, config: &ThrottleConfig) -> Admission {
        if let Some(until) = self.banned_until {
            if !config.ban_domains.wait_for_unban {
                return Admission::Banned(None);
            }
            if now < until {
                return Admission::Banned(Some(until - now));
            }
            self.clear_ban();
        }

        if let Err(not_until) = self.limiter.check() {
            return Admission::Wait(not_until.wait_time_from(self.clock.now()));
        }

        self.admitted += 1;
        self.last_activity = now;
        Admission::Admitted
    }

    /// Feed the outcome of a request back into the rate controller
    pub(crate) fn record(
        &mut self,
        outcome: Outcome,
        now: Instant,
        config: &ThrottleConfig,
    ) -> Feedback {
        self.last_activity = now;
        match outcome {
            Outcome::Success => self.on_success(config),
            Outcome::Failure => self.on_failure(now, config),
        }
    }

    fn on_success(&mut self, config: &ThrottleConfig) -> Feedback {
        self.successes += 1;
        self.successes_since_increase = self.successes_since_increase.saturating_add(1);
        self.failures_since_decrease = 0;
        self.ban_failures = 0;

        let mut feedback = Feedback::default();
        if !config.manual_mode
            && self.successes_since_increase >= config.success_before_increase
            && self.laps_without_failures >= config.laps_without_fails_before_increase
        {
            self.successes_since_increase = 0;
            let rps = self
                .current_rps
                .saturating_add(config.inc_rps)
                .min(config.max_rps);
            feedback.rps = self.apply_rps(rps);
        }
        feedback
    }

    fn on_failure(&mut self, now: Instant, config: &ThrottleConfig) -> Feedback {
        self.failures += 1;
        self.failures_since_decrease = self.failures_since_decrease.saturating_add(1);
        self.failures_this_lap = self.failures_this_lap.saturating_add(1);
        // A failure invalidates any increase that was building up
        self.laps_without_failures = 0;
        self.successes_since_increase = 0;

        let mut feedback = Feedback::default();
        if !config.manual_mode && self.failures_since_decrease >= config.fails_before_decrease {
            self.failures_since_decrease = 0;
            let rps = self
                .current_rps
                .saturating_sub(config.dec_rps)
                .max(config.min_rps);
            feedback.rps = self.apply_rps(rps);
        }

        let ban = &config.ban_domains;
        if ban.enabled && self.banned_until.is_none() {
            self.ban_failures = self.ban_failures.saturating_add(1);
            if self.ban_failures >= ban.fails_before_ban {
                self.banned_until = Some(now + ban.duration);
                feedback.banned = true;
            }
        }
        feedback
    }

    /// Close the running evaluation lap
    pub(crate) fn lap(&mut self, now: Instant) -> LapReport {
        if self.failures_this_lap == 0 {
            self.laps_without_failures = self.laps_without_failures.saturating_add(1);
        } else {
            self.laps_without_failures = 0;
        }
        self.failures_this_lap = 0;

        let mut report = LapReport::default();
        if self.banned_until.is_some_and(|until| now >= until) {
            self.clear_ban();
            report.unbanned = true;
        }
        report
    }

    /// Set the rate directly, clamped into the configured bounds.
    /// Returns the rate that was applied.
    pub(crate) fn set_rps(&mut self, rps: u32, config: &ThrottleConfig) -> u32 {
        let rps = config.clamp_rps(rps);
        self.apply_rps(rps);
        rps
    }

    pub(crate) fn is_idle(&self, now: Instant, idle_timeout: Duration) -> bool {
        now.duration_since(self.last_activity) >= idle_timeout
    }

    pub(crate) fn stats(&self, now: Instant, pending: usize) -> ThrottleStats {
        ThrottleStats {
            current_rps: self.current_rps,
            banned: self.is_banned(),
            ban_remaining: self
                .banned_until
                .map(|until| until.saturating_duration_since(now)),
            pending,
            admitted: self.admitted,
            successes: self.successes,
            failures: self.failures,
        }
    }

    fn apply_rps(&mut self, rps: u32) -> Option<u32> {
        if rps == self.current_rps {
            return None;
        }
        self.current_rps = rps;
        self.limiter = limiter(rps, self.clock);
        // Start drained, the new rate applies without an initial burst
        let _ = self.limiter.check_n(nonzero(rps));
        Some(rps)
    }

    fn clear_ban(&mut self) {
        self.banned_until = None;
        self.ban_failures = 0;
        self.failures_since_decrease = 0;
        self.successes_since_increase = 0;
    }
}

/// A limiter admitting `rps` requests per second, never fewer than one
fn limiter(rps: u32, clock: TokioClock) -> Limiter {
    RateLimiter::direct_with_clock(Quota::per_second(nonzero(rps)), clock)
}

fn nonzero(rps: u32) -> NonZeroU32 {
    NonZeroU32::new(rps).unwrap_or(NonZeroU32::MIN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BanConfig;
    use pretty_assertions::assert_eq;

    fn config() -> ThrottleConfig {
        ThrottleConfig {
            enabled: true,
            min_rps: 2,
            max_rps: 5,
            inc_rps: 1,
            dec_rps: 2,
            success_before_increase: 3,
            fails_before_decrease: 1,
            laps_without_fails_before_increase: 0,
            ..ThrottleConfig::default()
        }
    }

    fn ban_config(wait_for_unban: bool) -> ThrottleConfig {
        ThrottleConfig {
            ban_domains: BanConfig {
                enabled: true,
                duration: Duration::from_secs(30),
                fails_before_ban: 2,
                wait_for_unban,
            },
            ..config()
        }
    }

    #[test]
    fn test_starts_at_min_rps() {
        let state = ThrottleState::new(&config(), Instant::now());
        assert_eq!(state.current_rps(), 2);
        assert!(!state.is_banned());
    }

    #[tokio::test(start_paused = true)]
    async fn test_limiter_caps_admissions() {
        let config = config();
        let now = Instant::now();
        let mut state = ThrottleState::new(&config, now);

        assert_eq!(state.try_admit(now, &config), Admission::Admitted);
        assert_eq!(state.try_admit(now, &config), Admission::Admitted);

        // The burst of two is spent, the next slot opens half a second later
        assert_eq!(
            state.try_admit(now, &config),
            Admission::Wait(Duration::from_millis(500))
        );

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(state.try_admit(Instant::now(), &config), Admission::Admitted);
        assert_eq!(state.stats(Instant::now(), 0).admitted, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_change_starts_without_burst() {
        let config = ThrottleConfig {
            success_before_increase: 1,
            ..config()
        };
        let now = Instant::now();
        let mut state = ThrottleState::new(&config, now);

        assert_eq!(state.record(Outcome::Success, now, &config).rps, Some(3));
        // The new limiter starts drained and refills at the new rate
        assert!(matches!(
            state.try_admit(now, &config),
            Admission::Wait(wait) if wait > Duration::ZERO && wait < Duration::from_millis(500)
        ));

        tokio::time::advance(Duration::from_secs(1)).await;
        let later = Instant::now();
        for _ in 0..3 {
            assert_eq!(state.try_admit(later, &config), Admission::Admitted);
        }
        assert!(matches!(state.try_admit(later, &config), Admission::Wait(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_rate_still_admits() {
        let config = ThrottleConfig {
            min_rps: 0,
            max_rps: 0,
            ..config()
        };
        let now = Instant::now();
        let mut state = ThrottleState::new(&config, now);

        assert_eq!(state.try_admit(now, &config), Admission::Admitted);
        assert_eq!(
            state.try_admit(now, &config),
            Admission::Wait(Duration::from_secs(1))
        );
    }

    #[test]
    fn test_increase_after_successes() {
        let config = config();
        let now = Instant::now();
        let mut state = ThrottleState::new(&config, now);

        assert_eq!(state.record(Outcome::Success, now, &config).rps, None);
        assert_eq!(state.record(Outcome::Success, now, &config).rps, None);
        assert_eq!(state.record(Outcome::Success, now, &config).rps, Some(3));
        assert_eq!(state.current_rps(), 3);
    }

    #[test]
    fn test_increase_capped_at_max() {
        let config = ThrottleConfig {
            success_before_increase: 1,
            inc_rps: 10,
            ..config()
        };
        let now = Instant::now();
        let mut state = ThrottleState::new(&config, now);

        assert_eq!(state.record(Outcome::Success, now, &config).rps, Some(5));
        // Already at the ceiling, nothing changes
        assert_eq!(state.record(Outcome::Success, now, &config).rps, None);
        assert_eq!(state.current_rps(), 5);
    }

    #[test]
    fn test_increase_waits_for_clean_laps() {
        let config = ThrottleConfig {
            success_before_increase: 1,
            laps_without_fails_before_increase: 2,
            ..config()
        };
        let now = Instant::now();
        let mut state = ThrottleState::new(&config, now);

        assert_eq!(state.record(Outcome::Success, now, &config).rps, None);
        state.lap(now);
        assert_eq!(state.record(Outcome::Success, now, &config).rps, None);
        state.lap(now);
        assert_eq!(state.record(Outcome::Success, now, &config).rps, Some(3));
    }

    #[test]
    fn test_failure_decreases_to_floor() {
        let config = ThrottleConfig {
            success_before_increase: 1,
            ..config()
        };
        let now = Instant::now();
        let mut state = ThrottleState::new(&config, now);
        state.set_rps(5, &config);

        assert_eq!(state.record(Outcome::Failure, now, &config).rps, Some(3));
        assert_eq!(state.record(Outcome::Failure, now, &config).rps, Some(2));
        assert_eq!(state.record(Outcome::Failure, now, &config).rps, None);
        assert_eq!(state.current_rps(), 2);
    }

    #[test]
    fn test_failure_resets_pending_increase() {
        let config = config();
        let now = Instant::now();
        let mut state = ThrottleState::new(&config, now);

        state.record(Outcome::Success, now, &config);
        state.record(Outcome::Success, now, &config);
        state.record(Outcome::Failure, now, &config);
        // The success streak starts over
        assert_eq!(state.record(Outcome::Success, now, &config).rps, None);
        assert_eq!(state.record(Outcome::Success, now, &config).rps, None);
        assert_eq!(state.record(Outcome::Success, now, &config).rps, Some(3));
    }

    #[test]
    fn test_failed_lap_resets_clean_laps() {
        let config = ThrottleConfig {
            success_before_increase: 1,
            laps_without_fails_before_increase: 1,
            fails_before_decrease: 100,
            ..config()
        };
        let now = Instant::now();
        let mut state = ThrottleState::new(&config, now);

        state.record(Outcome::Failure, now, &config);
        state.lap(now);
        assert_eq!(state.record(Outcome::Success, now, &config).rps, None);
        state.lap(now);
        assert_eq!(state.record(Outcome::Success, now, &config).rps, Some(3));
    }

    #[test]
    fn test_manual_mode_ignores_feedback() {
        let config = ThrottleConfig {
            manual_mode: true,
            success_before_increase: 1,
            ..config()
        };
        let now = Instant::now();
        let mut state = ThrottleState::new(&config, now);

        assert_eq!(state.record(Outcome::Success, now, &config).rps, None);
        assert_eq!(state.record(Outcome::Failure, now, &config).rps, None);
        assert_eq!(state.set_rps(4, &config), 4);
        assert_eq!(state.set_rps(40, &config), 5);
        assert_eq!(state.set_rps(0, &config), 2);
    }

    #[test]
    fn test_ban_waits_out() {
        let config = ban_config(true);
        let now = Instant::now();
        let mut state = ThrottleState::new(&config, now);

        assert!(!state.record(Outcome::Failure, now, &config).banned);
        assert!(state.record(Outcome::Failure, now, &config).banned);
        assert!(state.is_banned());

        let later = now + Duration::from_secs(10);
        assert_eq!(
            state.try_admit(later, &config),
            Admission::Banned(Some(Duration::from_secs(20)))
        );

        // Elapsed ban is lifted by the admission itself
        let after = now + Duration::from_secs(30);
        assert_eq!(state.try_admit(after, &config), Admission::Admitted);
        assert!(!state.is_banned());
    }

    #[test]
    fn test_ban_without_wait_needs_lap() {
        let config = ban_config(false);
        let now = Instant::now();
        let mut state = ThrottleState::new(&config, now);

        state.record(Outcome::Failure, now, &config);
        state.record(Outcome::Failure, now, &config);

        let after = now + Duration::from_secs(31);
        assert_eq!(state.try_admit(after, &config), Admission::Banned(None));

        // A lap before the ban ran out keeps it
        assert!(!state.lap(now + Duration::from_secs(5)).unbanned);
        assert!(state.lap(after).unbanned);
        assert_eq!(state.try_admit(after, &config), Admission::Admitted);
    }

    #[test]
    fn test_success_resets_ban_tally() {
        let config = ban_config(true);
        let now = Instant::now();
        let mut state = ThrottleState::new(&config, now);

        state.record(Outcome::Failure, now, &config);
        state.record(Outcome::Success, now, &config);
        assert!(!state.record(Outcome::Failure, now, &config).banned);
        assert!(state.record(Outcome::Failure, now, &config).banned);
    }

    #[test]
    fn test_rate_never_leaves_bounds() {
        let config = ThrottleConfig {
            success_before_increase: 1,
            ..config()
        };
        let now = Instant::now();
        let mut state = ThrottleState::new(&config, now);

        for i in 0..50 {
            let outcome = if i % 3 == 0 {
                Outcome::Failure
            } else {
                Outcome::Success
            };
            state.record(outcome, now, &config);
            assert!((config.min_rps..=config.max_rps).contains(&state.current_rps()));
        }
    }

    #[test]
    fn test_idle_and_stats() {
        let config = config();
        let now = Instant::now();
        let mut state = ThrottleState::new(&config, now);
        state.try_admit(now, &config);
        state.record(Outcome::Success, now, &config);

        assert!(!state.is_idle(now + Duration::from_secs(1), Duration::from_secs(5)));
        assert!(state.is_idle(now + Duration::from_secs(5), Duration::from_secs(5)));

        let stats = state.stats(now, 3);
        assert_eq!(stats.admitted, 1);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.ban_remaining, None);
    }
}

//! Metrics collaborator.
//!
//! The requester only reports measurements; registering and exporting them
//! is up to the [`MetricsSink`] implementation. Every method has a no-op
//! default, so sinks implement just what they care about.

use std::time::Duration;

use crate::ratelimit::ThrottleKey;
use crate::types::Outcome;

/// Receives request, captcha and throttle measurements
pub trait MetricsSink: Send + Sync {
    /// A request dispatched through [`crate::Requester::execute`] completed
    fn record_request(&self, _client: usize, _host: &str, _outcome: Outcome, _elapsed: Duration) {}

    /// A captcha challenge was handled by the caller
    fn record_captcha(&self, _solved: bool) {}

    /// The rate of a throttle changed
    fn set_throttle_rps(&self, _key: &ThrottleKey, _rps: u32) {}

    /// The number of callers queued on a throttle changed
    fn set_throttle_queue(&self, _key: &ThrottleKey, _pending: usize) {}
}

/// Sink used when metrics are disabled
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

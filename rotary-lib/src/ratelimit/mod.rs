//! Adaptive per-host throttling.
//!
//! Requests are gated per destination host, optionally per client slot as
//! well. Each throttle is a governor rate limiter admitting `current_rps`
//! requests per second, rebuilt whenever the outcomes callers report move
//! that ceiling.
//!
//! # Architecture
//!
//! - [`HostKey`]: a normalized destination hostname
//! - [`ThrottleKey`]: a host, optionally scoped to one client slot
//! - [`ThrottleEngine`]: owns the throttles, runs the evaluation lap
//! - [`ThrottleStats`]: point-in-time statistics of one throttle

mod clock;
mod engine;
mod key;
mod state;
mod stats;

pub use engine::ThrottleEngine;
pub use key::{HostKey, ThrottleKey};
pub use stats::{ThrottleStats, ThrottleStatsMap};

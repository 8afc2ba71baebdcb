use governor::clock::Clock;
use governor::nanos::Nanos;
use tokio::time::Instant;

/// Rate limiter clock that reads the tokio timer.
///
/// Instants are measured from the moment the clock was created, so a paused
/// runtime drives the limiter the same way it drives `tokio::time::sleep`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TokioClock {
    origin: Instant,
}

impl TokioClock {
    pub(crate) const fn new(origin: Instant) -> Self {
        Self { origin }
    }
}

impl Clock for TokioClock {
    type Instant = Nanos;

    fn now(&self) -> Nanos {
        Nanos::from(Instant::now().saturating_duration_since(self.origin))
    }
}

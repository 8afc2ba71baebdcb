use tokio::sync::watch;
use tokio::time::Instant;

use crate::{ErrorKind, Result};

/// Stop signal observed by background loops and waiting callers.
///
/// Fires when the owning requester sets or drops its sender, or when the
/// optional caller-supplied receiver turns `true`.
#[derive(Debug, Clone)]
pub(crate) struct ShutdownSignal {
    internal: watch::Receiver<bool>,
    external: Option<watch::Receiver<bool>>,
}

impl ShutdownSignal {
    pub(crate) const fn new(
        internal: watch::Receiver<bool>,
        external: Option<watch::Receiver<bool>>,
    ) -> Self {
        Self { internal, external }
    }

    pub(crate) fn is_set(&self) -> bool {
        *self.internal.borrow()
            || self.internal.has_changed().is_err()
            || self.external.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once the signal fires
    pub(crate) async fn fired(&mut self) {
        match &mut self.external {
            Some(external) => {
                tokio::select! {
                    // A dropped internal sender counts as a stop request
                    _ = stop_requested(&mut self.internal) => {}
                    true = stop_requested(external) => {}
                }
            }
            None => {
                stop_requested(&mut self.internal).await;
            }
        }
    }

    /// Sleep until `deadline`, failing early with [`ErrorKind::Shutdown`]
    pub(crate) async fn sleep_until(&mut self, deadline: Instant) -> Result<()> {
        if self.is_set() {
            return Err(ErrorKind::Shutdown);
        }
        tokio::select! {
            () = tokio::time::sleep_until(deadline) => Ok(()),
            () = self.fired() => Err(ErrorKind::Shutdown),
        }
    }
}

/// Resolves to `true` once the channel carries `true`, or to `false` when
/// the sender is gone
async fn stop_requested(rx: &mut watch::Receiver<bool>) -> bool {
    rx.wait_for(|stop| *stop).await.is_ok()
}

/// Sleep until `deadline`, observing `shutdown` if there is one
pub(crate) async fn pause(shutdown: Option<&mut ShutdownSignal>, deadline: Instant) -> Result<()> {
    match shutdown {
        Some(signal) => signal.sleep_until(deadline).await,
        None => {
            tokio::time::sleep_until(deadline).await;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes_without_signal() {
        let (_tx, rx) = watch::channel(false);
        let mut signal = ShutdownSignal::new(rx, None);
        let deadline = Instant::now() + Duration::from_secs(5);
        assert_eq!(signal.sleep_until(deadline).await, Ok(()));
        assert!(Instant::now() >= deadline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_internal_signal_interrupts_sleep() {
        let (tx, rx) = watch::channel(false);
        let mut signal = ShutdownSignal::new(rx, None);
        let start = Instant::now();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            tx.send(true).unwrap();
        });

        let result = signal.sleep_until(start + Duration::from_secs(60)).await;
        assert_eq!(result, Err(ErrorKind::Shutdown));
        assert!(Instant::now() < start + Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_dropped_sender_counts_as_shutdown() {
        let (tx, rx) = watch::channel(false);
        let signal = ShutdownSignal::new(rx, None);
        drop(tx);
        assert!(signal.is_set());
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_signal() {
        let (_tx, rx) = watch::channel(false);
        let (ext_tx, ext_rx) = watch::channel(false);
        let mut signal = ShutdownSignal::new(rx, Some(ext_rx));
        assert!(!signal.is_set());

        ext_tx.send(true).unwrap();
        assert!(signal.is_set());
        let deadline = Instant::now() + Duration::from_secs(60);
        assert_eq!(signal.sleep_until(deadline).await, Err(ErrorKind::Shutdown));
    }
}

//! Job-scoped cancellation.
//!
//! One [`CancelGate`] per job reaches every suspension point: the backoff
//! gate, the token bucket, network reads, retry sleeps, and the worker
//! queue. Clones are cheap and all observe the same trip, so no background
//! task outlives its owning job. Tests drive their own gates.

use std::time::Duration;
use tokio::sync::watch;

/// Cancellation gate shared by every task of one job.
///
/// Built on a `watch` channel so a waiter that registers after the trip
/// still observes it; there is no missed-wakeup window.
#[derive(Debug, Clone)]
pub struct CancelGate {
    signal: watch::Sender<bool>,
}

impl Default for CancelGate {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelGate {
    /// Create an open gate.
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self { signal }
    }

    /// Trip the gate. Idempotent; every clone observes it.
    pub fn cancel(&self) {
        self.signal.send_replace(true);
    }

    /// Whether the gate has been tripped.
    pub fn is_cancelled(&self) -> bool {
        *self.signal.borrow()
    }

    /// Resolve once the gate trips. Returns immediately if it already has.
    pub async fn cancelled(&self) {
        let mut rx = self.signal.subscribe();
        // wait_for errs only when the sender is dropped, which cannot
        // happen while `self` borrows it.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Sleep that loses to cancellation: `true` when the full duration
    /// elapsed, `false` when the gate tripped first.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.cancelled() => false,
        }
    }
}

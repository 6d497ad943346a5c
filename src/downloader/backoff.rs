//! Global backoff coordination against throttling signals.
//!
//! When any worker receives a throttling or overload response it trips a
//! shared quiet-until timestamp; every worker consults [`BackoffCoordinator::wait`]
//! before starting a network request, so the whole pool retreats together
//! instead of hammering an archive that is already pushing back. The quiet
//! interval is randomized to avoid synchronized retry storms.

use super::cancel::CancelGate;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

/// Minimum quiet interval after a trip.
pub const BACKOFF_MIN: Duration = Duration::from_secs(30);

/// Maximum quiet interval after a trip.
pub const BACKOFF_MAX: Duration = Duration::from_secs(60);

const WAIT_POLL: Duration = Duration::from_millis(500);

/// Why a worker tripped the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TripReason {
    /// HTTP 429.
    Throttled,
    /// HTTP 503.
    Overloaded,
}

impl TripReason {
    /// Short label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            TripReason::Throttled => "throttled",
            TripReason::Overloaded => "overloaded",
        }
    }
}

/// Shared quiet-until gate, one per job.
#[derive(Default)]
pub struct BackoffCoordinator {
    quiet_until: Mutex<Option<Instant>>,
    trips: AtomicU64,
}

impl BackoffCoordinator {
    /// Create an idle coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the gate. The new quiet-until stamp is `now + rand(30..=60s)`,
    /// kept only if later than the current one, so simultaneous trips take
    /// the max instead of stacking.
    pub fn trip(&self, reason: TripReason) -> Duration {
        let jitter = rand::thread_rng().gen_range(BACKOFF_MIN..=BACKOFF_MAX);
        let candidate = Instant::now() + jitter;

        let mut quiet = self.quiet_until.lock().expect("backoff lock poisoned");
        let extended = match *quiet {
            Some(current) if current >= candidate => false,
            _ => {
                *quiet = Some(candidate);
                true
            }
        };
        drop(quiet);

        if extended {
            self.trips.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_backoff_trip(reason.as_str());
            warn!(
                reason = reason.as_str(),
                quiet_secs = jitter.as_secs(),
                "global backoff tripped"
            );
        }
        jitter
    }

    /// Remaining quiet time, if the gate is currently closed.
    pub fn remaining(&self) -> Option<Duration> {
        let quiet = self.quiet_until.lock().expect("backoff lock poisoned");
        quiet.and_then(|until| until.checked_duration_since(Instant::now()))
    }

    /// Total number of effective trips so far.
    pub fn trip_count(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }

    /// Block until the quiet period has passed. Returns `false` if the job
    /// was cancelled first.
    pub async fn wait(&self, cancel: &CancelGate) -> bool {
        loop {
            let remaining = match self.remaining() {
                None => return true,
                Some(r) => r,
            };
            if cancel.is_cancelled() || !cancel.sleep(remaining.min(WAIT_POLL)).await {
                return false;
            }
        }
    }
}

//! Token-bucket bandwidth governor shared by all workers.
//!
//! Every worker calls [`RateGovernor::consume`] before handing a chunk to
//! disk, so admission is per-byte rather than per-request and the configured
//! rate is distributed smoothly across the pool. Burst is capped at one
//! second of the configured rate.

use super::cancel::CancelGate;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const REFILL_POLL: Duration = Duration::from_millis(10);

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Process-wide token bucket. A rate of 0 disables the governor entirely.
pub struct RateGovernor {
    rate_bps: u64,
    bucket: Mutex<Bucket>,
}

impl RateGovernor {
    /// Create a governor for `rate_bps` bytes per second.
    pub fn new(rate_bps: u64) -> Self {
        Self {
            rate_bps,
            bucket: Mutex::new(Bucket {
                tokens: 0.0,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Whether any limiting is configured.
    pub fn is_limited(&self) -> bool {
        self.rate_bps > 0
    }

    /// The configured rate in bytes per second.
    pub fn rate_bps(&self) -> u64 {
        self.rate_bps
    }

    /// Consume `n` tokens, waiting for refill when the bucket runs dry.
    ///
    /// A request larger than the bucket capacity is admitted in
    /// capacity-sized pieces, so a single oversized chunk cannot wedge the
    /// caller. Returns `false` when the job was cancelled while waiting;
    /// callers abandon the transfer in that case.
    pub async fn consume(&self, n: usize, cancel: &CancelGate) -> bool {
        if self.rate_bps == 0 {
            return true;
        }

        let mut remaining = n as f64;
        while remaining > 0.0 {
            let piece = remaining.min(self.rate_bps as f64);
            if self.try_take(piece) {
                remaining -= piece;
                continue;
            }
            if cancel.is_cancelled() || !cancel.sleep(REFILL_POLL).await {
                return false;
            }
        }
        true
    }

    fn try_take(&self, needed: f64) -> bool {
        let mut bucket = self.bucket.lock().expect("governor lock poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_bps as f64)
            .min(self.rate_bps as f64);
        bucket.last_refill = now;

        if bucket.tokens >= needed {
            bucket.tokens -= needed;
            true
        } else {
            false
        }
    }
}

//! Engine events, progress snapshots, and throughput tracking.

use crate::store::ProgressCounts;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// Engine constructed, nothing running.
    Idle,
    /// Resolver still enumerating manifests.
    Resolving,
    /// Workers draining the queue.
    Downloading,
    /// Queue drained; persisting final aggregates.
    Finalizing,
    /// Job over (complete, cancelled, or aborted).
    Stopped,
}

/// Point-in-time view of a running or stored job.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    /// Lifecycle state at capture time.
    pub state: EngineState,
    /// Total file rows known so far.
    pub total_files: u64,
    /// Files done.
    pub done: u64,
    /// Files failed.
    pub failed: u64,
    /// Files currently claimed.
    pub in_progress: u64,
    /// Files waiting.
    pub pending: u64,
    /// Files skipped.
    pub skipped: u64,
    /// Bytes persisted across all files.
    pub bytes_downloaded: u64,
    /// Worker target at capture time.
    pub current_workers: u32,
    /// Rolling one-second throughput.
    pub bytes_per_sec: u64,
    /// Seconds to completion at current throughput, if estimable.
    pub eta_seconds: Option<u64>,
    /// Remaining global quiet period, if the backoff gate is closed.
    pub quiet_remaining_secs: Option<u64>,
    /// Files sitting in the work queue.
    pub queue_depth: u64,
}

impl Snapshot {
    /// Build a snapshot from store aggregates plus live runtime readings.
    pub fn from_counts(
        state: EngineState,
        counts: &ProgressCounts,
        current_workers: u32,
        bytes_per_sec: u64,
        quiet_remaining_secs: Option<u64>,
        queue_depth: u64,
    ) -> Self {
        let outstanding_bytes = estimate_outstanding(counts);
        let eta_seconds = match (outstanding_bytes, bytes_per_sec) {
            (Some(bytes), rate) if rate > 0 => Some(bytes / rate),
            _ => None,
        };

        Self {
            state,
            total_files: counts.total,
            done: counts.done,
            failed: counts.failed,
            in_progress: counts.in_progress,
            pending: counts.pending,
            skipped: counts.skipped,
            bytes_downloaded: counts.bytes_downloaded,
            current_workers,
            bytes_per_sec,
            eta_seconds,
            quiet_remaining_secs,
            queue_depth,
        }
    }

    /// Whether every file reached a terminal status.
    pub fn is_settled(&self) -> bool {
        self.pending == 0 && self.in_progress == 0
    }
}

// Bytes remaining is unknowable without per-file sizes in the snapshot;
// approximate with average completed-file size times outstanding count.
fn estimate_outstanding(counts: &ProgressCounts) -> Option<u64> {
    let finished = counts.done + counts.skipped;
    let outstanding = counts.pending + counts.in_progress;
    if finished == 0 || outstanding == 0 {
        return None;
    }
    Some(counts.bytes_downloaded / finished * outstanding)
}

/// Events published over the engine's broadcast channel. Collaborators use
/// these both as a metrics sink (periodic [`Snapshot`]s) and a log sink
/// (item/file outcomes, backoff trips).
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Lifecycle transition.
    StateChanged(EngineState),
    /// An item's manifest resolved into file rows.
    ItemResolved {
        /// Archive identifier.
        identifier: String,
        /// Files that survived the filter pipeline.
        files: u64,
    },
    /// An item's manifest fetch failed terminally.
    ItemFailed {
        /// Archive identifier.
        identifier: String,
        /// Error description.
        error: String,
    },
    /// A file reached a terminal status.
    FileFinished {
        /// Archive identifier.
        identifier: String,
        /// Remote file name.
        remote_name: String,
        /// Terminal status label.
        status: &'static str,
        /// Error label when failed.
        error: Option<&'static str>,
    },
    /// A worker tripped the global backoff gate.
    BackoffTripped {
        /// Quiet interval applied.
        quiet_secs: u64,
    },
    /// Periodic progress snapshot (once per second while running).
    Metrics(Snapshot),
}

/// Rolling throughput counter shared by all workers.
#[derive(Debug)]
pub struct TransferStats {
    total_bytes: AtomicU64,
    rate_bps: AtomicU64,
    window: Mutex<SpeedWindow>,
}

#[derive(Debug)]
struct SpeedWindow {
    bytes: u64,
    started: Instant,
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferStats {
    /// Create a zeroed counter.
    pub fn new() -> Self {
        Self {
            total_bytes: AtomicU64::new(0),
            rate_bps: AtomicU64::new(0),
            window: Mutex::new(SpeedWindow {
                bytes: 0,
                started: Instant::now(),
            }),
        }
    }

    /// Record `n` transferred bytes, folding the one-second window into the
    /// published rate as it fills.
    pub fn record(&self, n: u64) {
        self.total_bytes.fetch_add(n, Ordering::Relaxed);

        let mut window = self.window.lock().expect("stats lock poisoned");
        window.bytes += n;
        let elapsed = window.started.elapsed().as_secs_f64();
        if elapsed >= 1.0 {
            self.rate_bps
                .store((window.bytes as f64 / elapsed) as u64, Ordering::Relaxed);
            window.bytes = 0;
            window.started = Instant::now();
        }
    }

    /// Rolling one-second throughput in bytes per second.
    pub fn bytes_per_sec(&self) -> u64 {
        self.rate_bps.load(Ordering::Relaxed)
    }

    /// Total bytes recorded this session.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }
}

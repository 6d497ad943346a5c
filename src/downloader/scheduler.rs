//! Bounded worker pool with dynamic scaling.
//!
//! The pool spawns `worker_ceiling` tasks up front; how many of them may
//! pull work at once is the scaling target, published over a watch channel.
//! Under dynamic scaling the target starts at one, grows by one after every
//! run of five consecutive successes, and shrinks by one (floor one) on any
//! non-skip failure or backoff trip, so pool pressure follows what the
//! archive will actually tolerate.

use super::cancel::CancelGate;
use crate::downloader::config::SCALE_UP_STREAK;
use crate::fetcher::{FetchReport, FileFetcher};
use crate::store::{FileStatus, StoreError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Create the work queue: an unbounded id channel with a shared depth
/// counter so metrics can read queue pressure without draining it.
pub fn work_queue() -> (WorkSender, WorkReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicU64::new(0));
    (
        WorkSender {
            tx,
            depth: depth.clone(),
        },
        WorkReceiver { rx, depth },
    )
}

/// Producer half of the work queue.
#[derive(Clone)]
pub struct WorkSender {
    tx: mpsc::UnboundedSender<i64>,
    depth: Arc<AtomicU64>,
}

impl WorkSender {
    /// Enqueue a file id. Returns `false` once the pool is gone.
    pub fn push(&self, file_id: i64) -> bool {
        if self.tx.send(file_id).is_ok() {
            self.depth.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Shared handle to the live queue depth.
    pub fn depth_handle(&self) -> Arc<AtomicU64> {
        self.depth.clone()
    }
}

/// Consumer half of the work queue.
pub struct WorkReceiver {
    rx: mpsc::UnboundedReceiver<i64>,
    depth: Arc<AtomicU64>,
}

impl WorkReceiver {
    async fn recv(&mut self) -> Option<i64> {
        let id = self.rx.recv().await;
        if id.is_some() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
        id
    }
}

struct ScaleState {
    current: u32,
    streak: u32,
}

/// Scaling target shared between the pool and its workers.
pub struct ScalingPolicy {
    dynamic: bool,
    ceiling: u32,
    state: Mutex<ScaleState>,
    tx: watch::Sender<u32>,
}

impl ScalingPolicy {
    /// Target starts at one under dynamic scaling, else at the ceiling.
    pub fn new(ceiling: u32, dynamic: bool) -> Self {
        let ceiling = ceiling.max(1);
        let initial = if dynamic { 1 } else { ceiling };
        let (tx, _) = watch::channel(initial);
        Self {
            dynamic,
            ceiling,
            state: Mutex::new(ScaleState {
                current: initial,
                streak: 0,
            }),
            tx,
        }
    }

    /// Configured worker ceiling.
    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    /// Current scaling target.
    pub fn current(&self) -> u32 {
        *self.tx.borrow()
    }

    /// Watch the scaling target for changes.
    pub fn subscribe(&self) -> watch::Receiver<u32> {
        self.tx.subscribe()
    }

    /// Record a successful outcome; after a full streak the target grows.
    pub fn record_success(&self) {
        if !self.dynamic {
            return;
        }
        let mut state = self.state.lock().expect("scaling lock poisoned");
        state.streak += 1;
        if state.streak >= SCALE_UP_STREAK {
            state.streak = 0;
            if state.current < self.ceiling {
                state.current += 1;
                let _ = self.tx.send(state.current);
                info!(workers = state.current, "scaling worker pool up");
            }
        }
    }

    /// Record a failure or backoff trip; the target shrinks (floor one)
    /// and the success streak resets.
    pub fn record_failure(&self) {
        if !self.dynamic {
            return;
        }
        let mut state = self.state.lock().expect("scaling lock poisoned");
        state.streak = 0;
        if state.current > 1 {
            state.current -= 1;
            let _ = self.tx.send(state.current);
            warn!(workers = state.current, "scaling worker pool down");
        }
    }
}

/// Bounded concurrent executor over the work queue.
pub struct WorkerPool {
    fetcher: Arc<FileFetcher>,
    policy: Arc<ScalingPolicy>,
    cancel: CancelGate,
}

impl WorkerPool {
    /// Bundle the fetcher and scaling policy for one job.
    pub fn new(fetcher: Arc<FileFetcher>, policy: Arc<ScalingPolicy>, cancel: CancelGate) -> Self {
        Self {
            fetcher,
            policy,
            cancel,
        }
    }

    /// Run workers until the queue closes and drains (or cancellation).
    ///
    /// Every file outcome is forwarded over `report_tx`. A state store
    /// failure in any worker is fatal: it cancels the job and propagates.
    pub async fn run(
        &self,
        queue: WorkReceiver,
        report_tx: mpsc::UnboundedSender<FetchReport>,
    ) -> Result<(), StoreError> {
        let queue = Arc::new(tokio::sync::Mutex::new(queue));
        // watch rather than Notify: a parked worker that registers after the
        // drain signal still observes the version bump.
        let (closed_tx, closed_rx) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);

        let mut handles = Vec::with_capacity(self.policy.ceiling() as usize);
        for index in 0..self.policy.ceiling() {
            let fetcher = self.fetcher.clone();
            let policy = self.policy.clone();
            let cancel = self.cancel.clone();
            let queue = queue.clone();
            let closed_tx = closed_tx.clone();
            let closed_rx = closed_rx.clone();
            let report_tx = report_tx.clone();

            handles.push(tokio::spawn(async move {
                let result = worker_loop(
                    index,
                    fetcher,
                    policy,
                    cancel.clone(),
                    queue,
                    closed_tx,
                    closed_rx,
                    report_tx,
                )
                .await;
                if result.is_err() {
                    // A store failure is unrecoverable for the whole job.
                    cancel.cancel();
                }
                result
            }));
        }
        drop(report_tx);

        let mut fatal = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => fatal = fatal.or(Some(e)),
                Err(join_err) => {
                    fatal = fatal.or(Some(StoreError::Corrupt(format!(
                        "worker task panicked: {join_err}"
                    ))))
                }
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    index: u32,
    fetcher: Arc<FileFetcher>,
    policy: Arc<ScalingPolicy>,
    cancel: CancelGate,
    queue: Arc<tokio::sync::Mutex<WorkReceiver>>,
    closed_tx: Arc<watch::Sender<bool>>,
    mut closed_rx: watch::Receiver<bool>,
    report_tx: mpsc::UnboundedSender<FetchReport>,
) -> Result<(), StoreError> {
    let mut scale_rx = policy.subscribe();

    loop {
        if cancel.is_cancelled() || *closed_rx.borrow_and_update() {
            break;
        }

        // Workers above the current target park until scaled up.
        if index >= *scale_rx.borrow_and_update() {
            tokio::select! {
                _ = scale_rx.changed() => {}
                _ = closed_rx.changed() => {}
                _ = cancel.cancelled() => break,
            }
            continue;
        }

        let next = {
            let mut rx = queue.lock().await;
            tokio::select! {
                id = rx.recv() => id,
                _ = cancel.cancelled() => break,
            }
        };

        let Some(file_id) = next else {
            // Queue closed and drained: wake parked peers so they exit too.
            let _ = closed_tx.send(true);
            debug!(worker = index, "queue drained, worker exiting");
            break;
        };

        let report = fetcher.fetch_file(file_id).await?;

        if report.cancelled {
            let _ = report_tx.send(report);
            break;
        }

        if report.tripped_backoff {
            policy.record_failure();
        } else {
            match report.status {
                FileStatus::Done => policy.record_success(),
                FileStatus::Failed => policy.record_failure(),
                _ => {}
            }
        }
        let _ = report_tx.send(report);
    }

    Ok(())
}

//! Top-level job controller.
//!
//! Owns the lifecycle `idle → resolving → downloading → finalizing →
//! stopped`, wires the resolver and worker pool to the shared coordinators,
//! rebuilds the queue from the store on resume, and publishes a metrics
//! snapshot every second over a broadcast channel.

use super::backoff::BackoffCoordinator;
use super::cancel::CancelGate;
use super::config::EngineConfig;
use super::events::{EngineEvent, EngineState, Snapshot, TransferStats};
use super::governor::RateGovernor;
use super::scheduler::{work_queue, ScalingPolicy, WorkSender, WorkerPool};
use super::EngineError;
use crate::auth::Credentials;
use crate::fetcher::{ArchiveClient, FetchReport, FileFetcher};
use crate::input;
use crate::metrics;
use crate::resolver::{FileFilter, ManifestResolver};
use crate::store::{FileStatus, ItemStatus, JobRecord, StateStore, StoreError, STATE_FILE_NAME};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const METRICS_INTERVAL: Duration = Duration::from_secs(1);

/// Overrides a collaborator may apply when resuming a persisted job.
#[derive(Debug, Clone, Default)]
pub struct EngineOverrides {
    /// Replace the persisted worker ceiling.
    pub worker_ceiling: Option<u32>,
    /// Replace the persisted bandwidth ceiling.
    pub bandwidth_ceiling_bps: Option<u64>,
    /// Replace the persisted sync flag.
    pub sync: Option<bool>,
    /// Replace the persisted dynamic-scaling flag.
    pub dynamic: Option<bool>,
    /// Credentials file for this session (never persisted).
    pub auth_path: Option<std::path::PathBuf>,
    /// Endpoint override for this session (test fixtures).
    pub endpoints: Option<super::config::ArchiveEndpoints>,
}

/// Entry points of the download engine.
pub struct DownloadEngine;

/// Handle to a running job.
pub struct EngineHandle {
    cancel: CancelGate,
    events: broadcast::Sender<EngineEvent>,
    join: JoinHandle<Result<Snapshot, EngineError>>,
}

impl EngineHandle {
    /// Subscribe to the engine's event stream (metrics and log sink).
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Request cancellation; workers release their files and drain.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// The job's cancel gate, for wiring external signals.
    pub fn cancel_handle(&self) -> CancelGate {
        self.cancel.clone()
    }

    /// Wait for the job to finish and return its final snapshot.
    pub async fn wait(self) -> Result<Snapshot, EngineError> {
        self.join
            .await
            .map_err(|e| EngineError::Panicked(e.to_string()))?
    }
}

impl DownloadEngine {
    /// Start a new job (or pick an existing one back up under the same
    /// output root): persists the job and its items, then begins resolving
    /// and downloading concurrently.
    pub async fn start(config: EngineConfig) -> Result<EngineHandle, EngineError> {
        Self::start_with_cancel(config, CancelGate::new()).await
    }

    /// [`DownloadEngine::start`] with an externally owned cancel gate.
    pub async fn start_with_cancel(
        config: EngineConfig,
        cancel: CancelGate,
    ) -> Result<EngineHandle, EngineError> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.output_root)
            .await
            .map_err(|e| {
                EngineError::Store(StoreError::Corrupt(format!(
                    "cannot create output root: {e}"
                )))
            })?;

        let store = StateStore::open_in_root(&config.output_root).await?;
        let job = job_record(&config);
        store.upsert_job(&job).await?;

        if let Some(items_path) = &config.items_path {
            let identifiers = input::load_identifiers(items_path)?;
            info!(count = identifiers.len(), "enumerated item identifiers");
            for identifier in &identifiers {
                store.insert_item(&job.id, identifier).await?;
            }
        }

        // Stale claims from a crashed session are reclaimed up front so the
        // queue rebuild sees them as pending.
        let reclaimed = store.reclaim_in_progress(&job.id).await?;
        if reclaimed > 0 {
            info!(reclaimed, "reclaimed stale in-progress files");
        }

        Self::spawn(config, store, job, cancel)
    }

    /// Resume the job persisted under `output_root`, applying overrides.
    pub async fn resume(
        output_root: &Path,
        overrides: EngineOverrides,
    ) -> Result<EngineHandle, EngineError> {
        Self::resume_with_cancel(output_root, overrides, CancelGate::new()).await
    }

    /// [`DownloadEngine::resume`] with an externally owned cancel gate.
    pub async fn resume_with_cancel(
        output_root: &Path,
        overrides: EngineOverrides,
        cancel: CancelGate,
    ) -> Result<EngineHandle, EngineError> {
        if !output_root.join(STATE_FILE_NAME).exists() {
            return Err(EngineError::NoJob(output_root.to_path_buf()));
        }

        let store = StateStore::open_in_root(output_root).await?;
        let job_id = JobRecord::derive_id(output_root);
        let mut job = store
            .load_job(&job_id)
            .await?
            .ok_or_else(|| EngineError::NoJob(output_root.to_path_buf()))?;

        if let Some(ceiling) = overrides.worker_ceiling {
            job.worker_ceiling = ceiling;
        }
        if let Some(rate) = overrides.bandwidth_ceiling_bps {
            job.bandwidth_ceiling_bps = rate;
        }
        if let Some(sync) = overrides.sync {
            job.sync_existing = sync;
        }
        if let Some(dynamic) = overrides.dynamic {
            job.dynamic_scaling = dynamic;
        }

        let mut config = config_from_job(&job);
        config.auth_path = overrides.auth_path;
        if let Some(endpoints) = overrides.endpoints {
            config.endpoints = endpoints;
        }
        config.validate()?;
        store.upsert_job(&job).await?;

        let reclaimed = store.reclaim_in_progress(&job.id).await?;
        if reclaimed > 0 {
            info!(reclaimed, "reclaimed stale in-progress files");
        }

        Self::spawn(config, store, job, cancel)
    }

    /// Offline snapshot of the job persisted under `output_root`.
    pub async fn status(output_root: &Path) -> Result<Snapshot, EngineError> {
        if !output_root.join(STATE_FILE_NAME).exists() {
            return Err(EngineError::NoJob(output_root.to_path_buf()));
        }

        let store = StateStore::open_in_root(output_root).await?;
        let job_id = JobRecord::derive_id(output_root);
        if store.load_job(&job_id).await?.is_none() {
            return Err(EngineError::NoJob(output_root.to_path_buf()));
        }

        let counts = store.progress_snapshot(&job_id).await?;
        let state = if counts.is_drained() {
            EngineState::Stopped
        } else {
            EngineState::Idle
        };
        Ok(Snapshot::from_counts(state, &counts, 0, 0, None, 0))
    }

    fn spawn(
        config: EngineConfig,
        store: StateStore,
        job: JobRecord,
        cancel: CancelGate,
    ) -> Result<EngineHandle, EngineError> {
        let credentials = config
            .auth_path
            .as_deref()
            .map(Credentials::load)
            .transpose()?;
        let client = Arc::new(ArchiveClient::new(
            config.endpoints.clone(),
            credentials.as_ref(),
        )?);
        let filter = FileFilter::new(
            config.metadata_only,
            config.normalized_extensions(),
            config.name_regex.as_deref(),
        )
        .map_err(super::ConfigError::from)?;

        let governor = Arc::new(RateGovernor::new(job.bandwidth_ceiling_bps));
        let backoff = Arc::new(BackoffCoordinator::new());
        let stats = Arc::new(TransferStats::new());
        let policy = Arc::new(ScalingPolicy::new(job.worker_ceiling, job.dynamic_scaling));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let fetcher = Arc::new(FileFetcher::new(
            client.clone(),
            store.clone(),
            governor,
            backoff.clone(),
            cancel.clone(),
            stats.clone(),
            job.sync_existing,
            config.max_attempts,
        ));
        let resolver = ManifestResolver::new(
            client,
            store.clone(),
            backoff.clone(),
            cancel.clone(),
            filter,
            config.output_root.clone(),
            config.max_attempts,
        );
        let pool = WorkerPool::new(fetcher, policy.clone(), cancel.clone());

        let runner = JobRunner {
            store,
            job,
            resolver,
            pool,
            policy,
            backoff,
            stats,
            cancel: cancel.clone(),
            events: events.clone(),
        };
        let join = tokio::spawn(runner.run());

        Ok(EngineHandle {
            cancel,
            events,
            join,
        })
    }
}

fn job_record(config: &EngineConfig) -> JobRecord {
    JobRecord {
        id: JobRecord::derive_id(&config.output_root),
        output_root: config.output_root.clone(),
        name_regex: config.name_regex.clone(),
        extensions: config.normalized_extensions(),
        metadata_only: config.metadata_only,
        sync_existing: config.sync,
        dynamic_scaling: config.dynamic,
        worker_ceiling: config.worker_ceiling,
        bandwidth_ceiling_bps: config.bandwidth_ceiling_bps,
    }
}

fn config_from_job(job: &JobRecord) -> EngineConfig {
    let mut config = EngineConfig::new(job.output_root.clone());
    config.worker_ceiling = job.worker_ceiling;
    config.bandwidth_ceiling_bps = job.bandwidth_ceiling_bps;
    config.sync = job.sync_existing;
    config.dynamic = job.dynamic_scaling;
    config.metadata_only = job.metadata_only;
    config.name_regex = job.name_regex.clone();
    config.extension_whitelist = job.extensions.clone();
    config
}

struct JobRunner {
    store: StateStore,
    job: JobRecord,
    resolver: ManifestResolver,
    pool: WorkerPool,
    policy: Arc<ScalingPolicy>,
    backoff: Arc<BackoffCoordinator>,
    stats: Arc<TransferStats>,
    cancel: CancelGate,
    events: broadcast::Sender<EngineEvent>,
}

impl JobRunner {
    async fn run(self) -> Result<Snapshot, EngineError> {
        let state = Arc::new(Mutex::new(EngineState::Idle));
        set_state(&state, &self.events, EngineState::Resolving);

        let (work_tx, work_rx) = work_queue();
        let depth = work_tx.depth_handle();
        let (report_tx, report_rx) = mpsc::unbounded_channel();

        let resolver_task = tokio::spawn(resolve_all(
            self.resolver,
            self.store.clone(),
            self.job.id.clone(),
            work_tx,
            self.cancel.clone(),
            self.events.clone(),
            state.clone(),
        ));

        let report_task = tokio::spawn(forward_reports(
            report_rx,
            self.events.clone(),
            self.backoff.clone(),
        ));

        let metrics_task = tokio::spawn(publish_metrics(
            self.store.clone(),
            self.job.id.clone(),
            state.clone(),
            self.policy.clone(),
            self.backoff.clone(),
            self.stats.clone(),
            depth,
            self.events.clone(),
            self.cancel.clone(),
        ));

        // Workers drain files as soon as each item resolves; the pool
        // returns when the queue is closed and empty (or on cancellation).
        let pool_result = self.pool.run(work_rx, report_tx).await;

        let resolver_result = resolver_task
            .await
            .map_err(|e| EngineError::Panicked(e.to_string()))?;

        set_state(&state, &self.events, EngineState::Finalizing);
        metrics_task.abort();
        let _ = report_task.await;

        // Surface fatal errors only after the tasks have unwound.
        pool_result?;
        resolver_result?;

        // Final aggregates come straight from the store; the job row's
        // timestamp marks the finalize.
        self.store.upsert_job(&self.job).await?;
        let counts = self.store.progress_snapshot(&self.job.id).await?;
        let snapshot = Snapshot::from_counts(
            EngineState::Stopped,
            &counts,
            self.policy.current(),
            0,
            None,
            0,
        );

        set_state(&state, &self.events, EngineState::Stopped);
        info!(
            done = snapshot.done,
            failed = snapshot.failed,
            pending = snapshot.pending,
            bytes = snapshot.bytes_downloaded,
            "job finished"
        );
        Ok(snapshot)
    }
}

fn set_state(
    state: &Arc<Mutex<EngineState>>,
    events: &broadcast::Sender<EngineEvent>,
    value: EngineState,
) {
    *state.lock().expect("state lock poisoned") = value;
    let _ = events.send(EngineEvent::StateChanged(value));
}

/// Rebuild the queue from persisted pending files, then resolve the
/// remaining items, enqueueing each item's files as soon as they persist.
async fn resolve_all(
    resolver: ManifestResolver,
    store: StateStore,
    job_id: String,
    work_tx: WorkSender,
    cancel: CancelGate,
    events: broadcast::Sender<EngineEvent>,
    state: Arc<Mutex<EngineState>>,
) -> Result<(), EngineError> {
    let backlog = store.pending_files(&job_id).await?;
    if !backlog.is_empty() {
        info!(files = backlog.len(), "rebuilt queue from state store");
    }
    for file_id in backlog {
        work_tx.push(file_id);
    }

    let items = store.list_items(&job_id).await?;
    for item in items {
        if cancel.is_cancelled() {
            break;
        }
        // Already-resolved items contributed to the backlog above; failed
        // items stay failed until the operator clears them.
        if !matches!(item.status, ItemStatus::Pending | ItemStatus::Resolving) {
            continue;
        }

        match resolver.resolve_item(item.id, &item.identifier).await {
            Ok(file_ids) => {
                let resolved = store
                    .list_items(&job_id)
                    .await?
                    .into_iter()
                    .find(|i| i.id == item.id)
                    .map(|i| i.status == ItemStatus::Resolved)
                    .unwrap_or(false);
                metrics::record_item_outcome(resolved);
                if resolved {
                    let _ = events.send(EngineEvent::ItemResolved {
                        identifier: item.identifier.clone(),
                        files: file_ids.len() as u64,
                    });
                } else {
                    let _ = events.send(EngineEvent::ItemFailed {
                        identifier: item.identifier.clone(),
                        error: "manifest fetch failed".to_string(),
                    });
                }
                for file_id in file_ids {
                    work_tx.push(file_id);
                }
            }
            Err(e) => {
                error!(identifier = %item.identifier, error = %e, "fatal store error during resolution");
                cancel.cancel();
                return Err(e.into());
            }
        }
    }

    // Dropping the last sender closes the queue; workers exit when drained.
    drop(work_tx);
    if !cancel.is_cancelled() {
        set_state(&state, &events, EngineState::Downloading);
    }
    Ok(())
}

/// Translate fetch reports into engine events.
async fn forward_reports(
    mut report_rx: mpsc::UnboundedReceiver<FetchReport>,
    events: broadcast::Sender<EngineEvent>,
    backoff: Arc<BackoffCoordinator>,
) {
    while let Some(report) = report_rx.recv().await {
        if report.tripped_backoff {
            let quiet_secs = backoff.remaining().map(|d| d.as_secs()).unwrap_or(0);
            let _ = events.send(EngineEvent::BackoffTripped { quiet_secs });
        }
        if report.cancelled || report.status == FileStatus::Pending {
            continue;
        }
        let _ = events.send(EngineEvent::FileFinished {
            identifier: report.identifier,
            remote_name: report.remote_name,
            status: report.status.as_str(),
            error: report.error.map(|k| k.as_str()),
        });
    }
}

/// Publish a snapshot once per second until aborted.
#[allow(clippy::too_many_arguments)]
async fn publish_metrics(
    store: StateStore,
    job_id: String,
    state: Arc<Mutex<EngineState>>,
    policy: Arc<ScalingPolicy>,
    backoff: Arc<BackoffCoordinator>,
    stats: Arc<TransferStats>,
    depth: Arc<AtomicU64>,
    events: broadcast::Sender<EngineEvent>,
    cancel: CancelGate,
) {
    let mut ticker = tokio::time::interval(METRICS_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let counts = match store.progress_snapshot(&job_id).await {
            Ok(counts) => counts,
            Err(e) => {
                warn!(error = %e, "metrics snapshot query failed");
                continue;
            }
        };

        let current_state = *state.lock().expect("state lock poisoned");
        let queue_depth = depth.load(Ordering::Relaxed);
        let bytes_per_sec = stats.bytes_per_sec();
        let snapshot = Snapshot::from_counts(
            current_state,
            &counts,
            policy.current(),
            bytes_per_sec,
            backoff.remaining().map(|d| d.as_secs()),
            queue_depth,
        );

        metrics::record_engine_gauges(queue_depth, policy.current(), bytes_per_sec);
        let _ = events.send(EngineEvent::Metrics(snapshot));

        if cancel.is_cancelled() {
            // One last snapshot after cancellation, then stop publishing.
            break;
        }
    }
}

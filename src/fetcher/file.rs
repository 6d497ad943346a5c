//! Single-file download protocol: claim, preflight, byte-level resume,
//! token-governed streaming with a running digest, and atomic finalization.

use super::{status_error, ArchiveClient, ErrorKind, FetchError};
use crate::downloader::backoff::{BackoffCoordinator, TripReason};
use crate::downloader::cancel::CancelGate;
use crate::downloader::config::{
    calculate_backoff, CHECKPOINT_INTERVAL, CHECKPOINT_INTERVAL_BYTES, DOWNLOAD_CHUNK_SIZE,
};
use crate::downloader::events::TransferStats;
use crate::downloader::governor::RateGovernor;
use crate::metrics::FileMetrics;
use crate::store::{FileOutcome, FileRecord, FileStatus, StateStore, StoreError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Outcome of one [`FileFetcher::fetch_file`] call, reported to the
/// scheduler for scaling decisions and to the event stream.
#[derive(Debug, Clone)]
pub struct FetchReport {
    /// File row id.
    pub file_id: i64,
    /// Owning item identifier.
    pub identifier: String,
    /// Remote file name.
    pub remote_name: String,
    /// Terminal status written to the store (or `Pending` when released
    /// back due to cancellation).
    pub status: FileStatus,
    /// Failure classification when terminal.
    pub error: Option<ErrorKind>,
    /// Whether this fetch tripped the global backoff gate.
    pub tripped_backoff: bool,
    /// Whether the fetch was abandoned by cancellation.
    pub cancelled: bool,
}

/// Downloads one file at a time on behalf of a worker. All coordinators are
/// injected so tests can substitute deterministic instances.
pub struct FileFetcher {
    client: Arc<ArchiveClient>,
    store: StateStore,
    governor: Arc<RateGovernor>,
    backoff: Arc<BackoffCoordinator>,
    cancel: CancelGate,
    stats: Arc<TransferStats>,
    sync_existing: bool,
    max_attempts: u32,
}

impl FileFetcher {
    /// Bundle the shared collaborators of a job.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<ArchiveClient>,
        store: StateStore,
        governor: Arc<RateGovernor>,
        backoff: Arc<BackoffCoordinator>,
        cancel: CancelGate,
        stats: Arc<TransferStats>,
        sync_existing: bool,
        max_attempts: u32,
    ) -> Self {
        Self {
            client,
            store,
            governor,
            backoff,
            cancel,
            stats,
            sync_existing,
            max_attempts,
        }
    }

    /// Fetch one file to its destination.
    ///
    /// Transient failures are recovered here with per-file exponential
    /// backoff up to the attempt ceiling; terminal outcomes are written to
    /// the store. Only store failures propagate as errors - they are fatal
    /// for the whole job.
    pub async fn fetch_file(&self, file_id: i64) -> Result<FetchReport, StoreError> {
        let file_metrics = FileMetrics::start();

        if !self.store.claim_file(file_id).await? {
            debug!(file_id, "file already claimed, skipping");
            file_metrics.record_skipped();
            return Ok(FetchReport {
                file_id,
                identifier: String::new(),
                remote_name: String::new(),
                status: FileStatus::Skipped,
                error: None,
                tripped_backoff: false,
                cancelled: false,
            });
        }

        let file = self.store.load_file(file_id).await?;
        let part_path = part_path_for(&file.local_path);

        if let Some(parent) = file.local_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return self
                    .finish_failed(&file, &part_path, ErrorKind::Io, None, file.attempts + 1, e.to_string())
                    .await;
            }
        }

        if self.sync_existing && self.preflight_existing(&file).await {
            info!(
                identifier = %file.identifier,
                name = %file.remote_name,
                "existing file verified, skipping transfer"
            );
            let bytes = length_of(&file.local_path).await;
            self.store
                .release_file(
                    file.id,
                    &FileOutcome {
                        status: FileStatus::Done,
                        bytes_downloaded: bytes,
                        attempts: file.attempts,
                        last_error: None,
                        http_status: None,
                    },
                )
                .await?;
            return Ok(self.report(&file, FileStatus::Done, None, false, false));
        }

        let mut attempts = file.attempts;
        let mut tripped = false;
        let mut auth_retried = false;

        loop {
            attempts += 1;
            match self.attempt_transfer(&file, &part_path).await {
                Ok(bytes) => {
                    info!(
                        identifier = %file.identifier,
                        name = %file.remote_name,
                        bytes,
                        attempts,
                        "file complete"
                    );
                    file_metrics.record_done();
                    self.store
                        .release_file(
                            file.id,
                            &FileOutcome {
                                status: FileStatus::Done,
                                bytes_downloaded: bytes,
                                attempts,
                                last_error: None,
                                http_status: None,
                            },
                        )
                        .await?;
                    return Ok(self.report(&file, FileStatus::Done, None, tripped, false));
                }
                Err(FetchError::Cancelled) => {
                    let bytes = length_of(&part_path).await;
                    self.store
                        .release_file(
                            file.id,
                            &FileOutcome {
                                status: FileStatus::Pending,
                                bytes_downloaded: bytes,
                                attempts,
                                last_error: None,
                                http_status: None,
                            },
                        )
                        .await?;
                    return Ok(self.report(&file, FileStatus::Pending, None, tripped, true));
                }
                Err(FetchError::Store(e)) => return Err(e),
                Err(err) => {
                    let kind = err.kind();
                    let http_status = err.http_status();

                    if matches!(kind, ErrorKind::Throttled | ErrorKind::Overloaded) {
                        tripped = true;
                    }

                    // One immediate retry when the archive rejects freshly
                    // loaded credentials; terminal otherwise.
                    if kind == ErrorKind::Auth && self.client.has_credentials() && !auth_retried {
                        auth_retried = true;
                        warn!(
                            identifier = %file.identifier,
                            name = %file.remote_name,
                            "auth rejected, retrying once with credentials"
                        );
                        continue;
                    }

                    if kind.is_retryable() && attempts < self.max_attempts {
                        warn!(
                            identifier = %file.identifier,
                            name = %file.remote_name,
                            attempt = attempts,
                            max_attempts = self.max_attempts,
                            error = %err,
                            "transfer attempt failed, will retry"
                        );
                        // The global quiet period already paces throttle
                        // retries; everything else gets per-file backoff.
                        if !matches!(kind, ErrorKind::Throttled | ErrorKind::Overloaded)
                            && !self.sleep_backoff(attempts).await
                        {
                            let bytes = length_of(&part_path).await;
                            self.store
                                .release_file(
                                    file.id,
                                    &FileOutcome {
                                        status: FileStatus::Pending,
                                        bytes_downloaded: bytes,
                                        attempts,
                                        last_error: None,
                                        http_status: None,
                                    },
                                )
                                .await?;
                            return Ok(self.report(&file, FileStatus::Pending, None, tripped, true));
                        }
                        continue;
                    }

                    file_metrics.record_failed(kind.as_str());
                    return self
                        .finish_failed(&file, &part_path, kind, http_status, attempts, err.to_string())
                        .await
                        .map(|mut report| {
                            report.tripped_backoff = tripped;
                            report
                        });
                }
            }
        }
    }

    /// One transfer attempt: resume probe, gated request, governed stream,
    /// verification, atomic rename. Returns the final byte count.
    async fn attempt_transfer(&self, file: &FileRecord, part_path: &Path) -> Result<u64, FetchError> {
        if !self.backoff.wait(&self.cancel).await {
            return Err(FetchError::Cancelled);
        }

        let mut resume_from = length_of(part_path).await;

        // A partial at or past the remote size either finalizes here or is
        // discarded; there is nothing left to request.
        if file.size > 0 && resume_from >= file.size {
            if resume_from == file.size && self.verify_on_disk(file, part_path).await {
                tokio::fs::rename(part_path, &file.local_path).await?;
                return Ok(resume_from);
            }
            tokio::fs::remove_file(part_path).await.ok();
            resume_from = 0;
        }

        if resume_from > 0 {
            info!(
                identifier = %file.identifier,
                name = %file.remote_name,
                resume_from,
                "resuming partial transfer"
            );
        }

        let url = self.client.download_url(&file.identifier, &file.remote_name);
        let mut response = self.client.get_file(&url, Some(resume_from)).await?;
        let status = response.status();

        match status.as_u16() {
            206 => {}
            200 => {
                if resume_from > 0 {
                    warn!(
                        name = %file.remote_name,
                        "server ignored range request, restarting from zero"
                    );
                    tokio::fs::remove_file(part_path).await.ok();
                    resume_from = 0;
                }
            }
            416 => {
                tokio::fs::remove_file(part_path).await.ok();
                return Err(status_error(status, "partial exceeds remote size"));
            }
            429 => {
                self.backoff.trip(TripReason::Throttled);
                return Err(status_error(status, "archive throttled the request"));
            }
            503 => {
                self.backoff.trip(TripReason::Overloaded);
                return Err(status_error(status, "archive reported overload"));
            }
            _ => return Err(status_error(status, "payload request rejected")),
        }

        // The digest must cover the whole object, so a resumed transfer
        // re-hashes the existing partial once before new bytes arrive.
        let mut digest = md5::Context::new();
        if resume_from > 0 {
            hash_into(part_path, &mut digest).await?;
        }

        let mut out = if resume_from > 0 {
            OpenOptions::new().append(true).open(part_path).await?
        } else {
            File::create(part_path).await?
        };

        let mut on_disk = resume_from;
        let mut since_checkpoint = 0u64;
        let mut last_checkpoint = Instant::now();

        loop {
            let next = tokio::select! {
                chunk = response.chunk() => chunk,
                _ = self.cancel.cancelled() => {
                    out.flush().await.ok();
                    self.store.checkpoint_bytes(file.id, on_disk).await?;
                    return Err(FetchError::Cancelled);
                }
            };

            let chunk = match next {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    // Dropped connection: keep the partial for the next
                    // attempt's resume probe.
                    out.flush().await.ok();
                    self.store.checkpoint_bytes(file.id, on_disk).await?;
                    return Err(FetchError::Network(e.to_string()));
                }
            };

            if !self.governor.consume(chunk.len(), &self.cancel).await {
                out.flush().await.ok();
                self.store.checkpoint_bytes(file.id, on_disk).await?;
                return Err(FetchError::Cancelled);
            }

            out.write_all(&chunk).await?;
            digest.consume(&chunk);
            self.stats.record(chunk.len() as u64);
            on_disk += chunk.len() as u64;
            since_checkpoint += chunk.len() as u64;

            if since_checkpoint >= CHECKPOINT_INTERVAL_BYTES
                || last_checkpoint.elapsed() >= CHECKPOINT_INTERVAL
            {
                self.store.checkpoint_bytes(file.id, on_disk).await?;
                since_checkpoint = 0;
                last_checkpoint = Instant::now();
            }
        }

        out.flush().await?;
        drop(out);

        if file.size > 0 && on_disk != file.size {
            tokio::fs::remove_file(part_path).await.ok();
            return Err(FetchError::Integrity(format!(
                "received {on_disk} of {} bytes",
                file.size
            )));
        }

        if let Some(expected) = file.expected_md5.as_deref().filter(|m| !m.is_empty()) {
            let actual = format!("{:x}", digest.compute());
            if !actual.eq_ignore_ascii_case(expected) {
                tokio::fs::remove_file(part_path).await.ok();
                return Err(FetchError::Integrity(format!(
                    "digest mismatch: {actual} != {expected}"
                )));
            }
        }

        tokio::fs::rename(part_path, &file.local_path).await?;
        Ok(on_disk)
    }

    /// Sync-mode preflight: an existing final object passing the strongest
    /// available check (digest, then size, then bare existence) stands in
    /// for a transfer. Read errors fail open into a re-download.
    async fn preflight_existing(&self, file: &FileRecord) -> bool {
        if tokio::fs::metadata(&file.local_path).await.is_err() {
            return false;
        }
        if let Some(expected) = file.expected_md5.as_deref().filter(|m| !m.is_empty()) {
            return match md5_of(&file.local_path).await {
                Ok(actual) => actual.eq_ignore_ascii_case(expected),
                Err(_) => false,
            };
        }
        if file.size > 0 {
            return length_of(&file.local_path).await == file.size;
        }
        true
    }

    /// Verify a complete-looking partial against the published digest.
    async fn verify_on_disk(&self, file: &FileRecord, path: &Path) -> bool {
        match file.expected_md5.as_deref().filter(|m| !m.is_empty()) {
            None => true,
            Some(expected) => match md5_of(path).await {
                Ok(actual) => actual.eq_ignore_ascii_case(expected),
                Err(_) => false,
            },
        }
    }

    async fn finish_failed(
        &self,
        file: &FileRecord,
        part_path: &Path,
        kind: ErrorKind,
        http_status: Option<u16>,
        attempts: u32,
        detail: String,
    ) -> Result<FetchReport, StoreError> {
        warn!(
            identifier = %file.identifier,
            name = %file.remote_name,
            kind = kind.as_str(),
            attempts,
            detail,
            "file failed terminally"
        );
        let bytes = length_of(part_path).await;
        self.store
            .release_file(
                file.id,
                &FileOutcome {
                    status: FileStatus::Failed,
                    bytes_downloaded: bytes,
                    attempts,
                    last_error: Some(kind.as_str().to_string()),
                    http_status,
                },
            )
            .await?;
        Ok(self.report(file, FileStatus::Failed, Some(kind), false, false))
    }

    async fn sleep_backoff(&self, attempt: u32) -> bool {
        let delay = calculate_backoff(attempt.saturating_sub(1));
        debug!(attempt, delay_ms = delay.as_millis() as u64, "per-file retry backoff");
        self.cancel.sleep(delay).await
    }

    fn report(
        &self,
        file: &FileRecord,
        status: FileStatus,
        error: Option<ErrorKind>,
        tripped: bool,
        cancelled: bool,
    ) -> FetchReport {
        FetchReport {
            file_id: file.id,
            identifier: file.identifier.clone(),
            remote_name: file.remote_name.clone(),
            status,
            error,
            tripped_backoff: tripped,
            cancelled,
        }
    }
}

/// Partial object path: `<name>.part` next to the final object.
pub fn part_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

async fn length_of(path: &Path) -> u64 {
    tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

async fn hash_into(path: &Path, digest: &mut md5::Context) -> Result<(), FetchError> {
    let mut file = File::open(path).await?;
    let mut buffer = vec![0u8; DOWNLOAD_CHUNK_SIZE];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        digest.consume(&buffer[..read]);
    }
    Ok(())
}

/// MD5 hex digest of a file on disk.
pub async fn md5_of(path: &Path) -> Result<String, FetchError> {
    let mut digest = md5::Context::new();
    hash_into(path, &mut digest).await?;
    Ok(format!("{:x}", digest.compute()))
}

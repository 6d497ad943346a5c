//! Manifest resolution: one item identifier in, filtered file rows out.
//!
//! The resolver fetches the archive's metadata document, runs every listed
//! file through the filter pipeline, and persists surviving rows before any
//! fetch begins, so the queue can always be rebuilt from the store.

pub mod filter;

pub use filter::{sanitize_name, FileFilter};

use crate::downloader::backoff::{BackoffCoordinator, TripReason};
use crate::downloader::cancel::CancelGate;
use crate::downloader::config::calculate_backoff;
use crate::fetcher::{ArchiveClient, ErrorKind, FetchError};
use crate::store::{ItemStatus, StateStore, StoreError};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Metadata document of one item, reduced to the fields the engine needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ItemManifest {
    /// Files listed for the item.
    #[serde(default)]
    pub files: Vec<ManifestFile>,
}

/// One file entry of a manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestFile {
    /// Remote logical name.
    #[serde(default)]
    pub name: String,
    /// Size in bytes; the archive serializes this as a string on older
    /// items, so both forms are accepted. 0 = unknown.
    #[serde(default, deserialize_with = "de_size")]
    pub size: u64,
    /// Published MD5 hex digest, if any.
    #[serde(default)]
    pub md5: Option<String>,
}

fn de_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeField {
        Number(u64),
        Text(String),
    }

    match Option::<SizeField>::deserialize(deserializer)? {
        None => Ok(0),
        Some(SizeField::Number(n)) => Ok(n),
        Some(SizeField::Text(s)) => s
            .parse::<u64>()
            .map_err(|_| D::Error::custom(format!("invalid size: {s}"))),
    }
}

/// Resolves item manifests into persisted file rows.
pub struct ManifestResolver {
    client: Arc<ArchiveClient>,
    store: StateStore,
    backoff: Arc<BackoffCoordinator>,
    cancel: CancelGate,
    filter: FileFilter,
    output_root: PathBuf,
    max_attempts: u32,
}

impl ManifestResolver {
    /// Bundle the shared collaborators of a job.
    pub fn new(
        client: Arc<ArchiveClient>,
        store: StateStore,
        backoff: Arc<BackoffCoordinator>,
        cancel: CancelGate,
        filter: FileFilter,
        output_root: PathBuf,
        max_attempts: u32,
    ) -> Self {
        Self {
            client,
            store,
            backoff,
            cancel,
            filter,
            output_root,
            max_attempts,
        }
    }

    /// Resolve one item and persist its surviving files.
    ///
    /// Returns the file row ids ready for the queue. A terminal manifest
    /// failure marks the item `failed` and returns an empty list; a
    /// cancellation leaves the item `pending` for the next session.
    pub async fn resolve_item(
        &self,
        item_id: i64,
        identifier: &str,
    ) -> Result<Vec<i64>, StoreError> {
        self.store
            .set_item_status(item_id, ItemStatus::Resolving, None)
            .await?;
        info!(identifier, "resolving item manifest");

        let manifest = match self.fetch_manifest(identifier).await {
            Ok(manifest) => manifest,
            Err(FetchError::Cancelled) => {
                self.store
                    .set_item_status(item_id, ItemStatus::Pending, None)
                    .await?;
                return Ok(Vec::new());
            }
            Err(err) => {
                warn!(identifier, error = %err, "manifest resolution failed");
                self.store
                    .set_item_status(item_id, ItemStatus::Failed, Some(&err.to_string()))
                    .await?;
                return Ok(Vec::new());
            }
        };

        let item_dir = self.output_root.join(identifier);
        let mut file_ids = Vec::new();
        for entry in &manifest.files {
            if !self.filter.retains(&entry.name) {
                continue;
            }
            let local_path = item_dir.join(sanitize_name(&entry.name));
            let file_id = self
                .store
                .insert_file(
                    item_id,
                    &entry.name,
                    entry.size,
                    entry.md5.as_deref().filter(|m| !m.is_empty()),
                    &local_path,
                )
                .await?;
            file_ids.push(file_id);
        }

        self.store
            .set_item_status(item_id, ItemStatus::Resolved, None)
            .await?;
        info!(
            identifier,
            listed = manifest.files.len(),
            retained = file_ids.len(),
            "item resolved"
        );
        Ok(file_ids)
    }

    /// Fetch the metadata document, retrying transient failures with
    /// exponential backoff and yielding to the global quiet period on
    /// throttling signals.
    async fn fetch_manifest(&self, identifier: &str) -> Result<ItemManifest, FetchError> {
        let url = self.client.metadata_url(identifier);
        let mut attempt = 0u32;

        loop {
            if !self.backoff.wait(&self.cancel).await {
                return Err(FetchError::Cancelled);
            }

            attempt += 1;
            match self.client.get_json::<ItemManifest>(&url).await {
                Ok(manifest) => return Ok(manifest),
                Err(err) => {
                    let kind = err.kind();
                    match kind {
                        ErrorKind::Throttled => {
                            self.backoff.trip(TripReason::Throttled);
                        }
                        ErrorKind::Overloaded => {
                            self.backoff.trip(TripReason::Overloaded);
                        }
                        _ => {}
                    }

                    if !kind.is_retryable() || attempt >= self.max_attempts {
                        return Err(err);
                    }

                    debug!(
                        identifier,
                        attempt,
                        error = %err,
                        "manifest fetch failed, retrying"
                    );
                    if !matches!(kind, ErrorKind::Throttled | ErrorKind::Overloaded)
                        && !self.cancel.sleep(calculate_backoff(attempt - 1)).await
                    {
                        return Err(FetchError::Cancelled);
                    }
                }
            }
        }
    }
}

//! Engine configuration and retry constants

use std::path::PathBuf;
use std::time::Duration;

/// Maximum number of attempts per file before it is marked failed.
pub const MAX_ATTEMPTS: u32 = 5;

/// Initial per-file retry backoff in milliseconds.
pub const INITIAL_BACKOFF_MS: u64 = 2_000;

/// Maximum per-file retry backoff in milliseconds.
pub const MAX_BACKOFF_MS: u64 = 60_000;

/// Read granularity of the download stream.
pub const DOWNLOAD_CHUNK_SIZE: usize = 128 * 1024;

/// Persist the byte counter after this many new bytes.
pub const CHECKPOINT_INTERVAL_BYTES: u64 = 8 * 1024 * 1024;

/// Persist the byte counter after this much wall time, whichever is sooner.
pub const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(5);

/// TCP connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Per-read inactivity timeout.
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum redirects followed per request.
pub const MAX_REDIRECTS: usize = 10;

/// Upper bound on the configured worker ceiling.
pub const WORKER_CEILING_MAX: u32 = 64;

/// Consecutive successes required before the pool scales up by one.
pub const SCALE_UP_STREAK: u32 = 5;

/// Calculate exponential per-file retry backoff.
pub fn calculate_backoff(attempt: u32) -> Duration {
    let delay_ms = INITIAL_BACKOFF_MS.saturating_mul(2u64.saturating_pow(attempt));
    Duration::from_millis(delay_ms.min(MAX_BACKOFF_MS))
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Items list path is missing or unreadable.
    #[error("items file not readable: {}", .0.display())]
    ItemsUnreadable(PathBuf),

    /// Worker ceiling outside the accepted range.
    #[error("worker ceiling must be between 1 and {WORKER_CEILING_MAX}, got {0}")]
    WorkerCeiling(u32),

    /// Filename regex failed to compile.
    #[error("invalid name regex: {0}")]
    InvalidRegex(#[from] regex::Error),
}

/// Remote endpoints the engine talks to. Overridable for tests against a
/// local fixture server.
#[derive(Debug, Clone)]
pub struct ArchiveEndpoints {
    /// Base URL of the metadata service.
    pub metadata_base: String,
    /// Base URL of the download service.
    pub download_base: String,
}

impl Default for ArchiveEndpoints {
    fn default() -> Self {
        Self {
            metadata_base: "https://archive.org/metadata".to_string(),
            download_base: "https://archive.org/download".to_string(),
        }
    }
}

/// Engine configuration supplied by a collaborator (CLI, UI, embedder).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Items list to enumerate on start. Optional: resumed jobs already
    /// carry their items in the store.
    pub items_path: Option<PathBuf>,
    /// Output root directory; the state store lives inside it.
    pub output_root: PathBuf,
    /// Maximum concurrent workers, 1..=64.
    pub worker_ceiling: u32,
    /// Bandwidth ceiling in bytes/sec, 0 = unlimited.
    pub bandwidth_ceiling_bps: u64,
    /// Skip files already present and verified on disk.
    pub sync: bool,
    /// Start with one worker and scale on observed behavior.
    pub dynamic: bool,
    /// Retain only manifest/metadata files.
    pub metadata_only: bool,
    /// Optional filename regex filter.
    pub name_regex: Option<String>,
    /// Extension whitelist, matched case-insensitively.
    pub extension_whitelist: Vec<String>,
    /// Optional path to a credentials file.
    pub auth_path: Option<PathBuf>,
    /// Attempts per file before terminal failure.
    pub max_attempts: u32,
    /// Remote endpoints.
    pub endpoints: ArchiveEndpoints,
}

impl EngineConfig {
    /// Build a configuration with engine defaults for `output_root`.
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            items_path: None,
            output_root: output_root.into(),
            worker_ceiling: 4,
            bandwidth_ceiling_bps: 0,
            sync: false,
            dynamic: true,
            metadata_only: false,
            name_regex: None,
            extension_whitelist: Vec::new(),
            auth_path: None,
            max_attempts: MAX_ATTEMPTS,
            endpoints: ArchiveEndpoints::default(),
        }
    }

    /// Validate ranges and compile-time invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_ceiling == 0 || self.worker_ceiling > WORKER_CEILING_MAX {
            return Err(ConfigError::WorkerCeiling(self.worker_ceiling));
        }
        if let Some(items_path) = &self.items_path {
            if std::fs::metadata(items_path).is_err() {
                return Err(ConfigError::ItemsUnreadable(items_path.clone()));
            }
        }
        if let Some(pattern) = &self.name_regex {
            regex::Regex::new(pattern)?;
        }
        Ok(())
    }

    /// Extension whitelist lowered for case-insensitive matching.
    pub fn normalized_extensions(&self) -> Vec<String> {
        self.extension_whitelist
            .iter()
            .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect()
    }
}

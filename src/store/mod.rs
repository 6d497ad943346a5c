//! Durable job state persisted in a single SQLite file.
//!
//! The store is the single source of truth for a job: the in-memory queue is
//! only a cache over file rows, and every interface (CLI, library embedder,
//! headless container) rebuilds its view from here. Write-ahead journaling
//! lets one writer and many readers coexist, and the `pending → in_progress`
//! claim is a single conditional `UPDATE` so two workers can never hold the
//! same file.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// File name of the durable store inside the output root.
pub const STATE_FILE_NAME: &str = "downloader_state.db";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    output_root TEXT NOT NULL,
    name_regex TEXT,
    extensions TEXT,
    metadata_only INTEGER NOT NULL DEFAULT 0,
    sync_existing INTEGER NOT NULL DEFAULT 0,
    dynamic_scaling INTEGER NOT NULL DEFAULT 1,
    worker_ceiling INTEGER NOT NULL,
    bandwidth_ceiling_bps INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL REFERENCES jobs(id),
    identifier TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    error TEXT,
    UNIQUE(job_id, identifier)
);

CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    item_id INTEGER NOT NULL REFERENCES items(id),
    remote_name TEXT NOT NULL,
    size INTEGER NOT NULL DEFAULT 0,
    expected_md5 TEXT,
    local_path TEXT NOT NULL,
    bytes_downloaded INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    http_status INTEGER,
    UNIQUE(item_id, remote_name)
);

CREATE INDEX IF NOT EXISTS idx_items_job ON items(job_id);
CREATE INDEX IF NOT EXISTS idx_files_item ON files(item_id);
CREATE INDEX IF NOT EXISTS idx_files_status ON files(status);
"#;

/// Errors surfaced by the state store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying database error (includes disk-full conditions).
    #[error("state store error: {0}")]
    Database(#[from] sqlx::Error),

    /// The store file failed its integrity check; the engine refuses to run.
    #[error("state store corrupt: {0}")]
    Corrupt(String),

    /// A row that must exist was not found.
    #[error("missing row: {0}")]
    MissingRow(String),
}

/// Resolution status of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    /// Not yet resolved.
    Pending,
    /// Manifest fetch in flight.
    Resolving,
    /// Manifest fetched and file rows persisted.
    Resolved,
    /// Manifest fetch failed terminally.
    Failed,
}

impl ItemStatus {
    /// Stable string form stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Resolving => "resolving",
            ItemStatus::Resolved => "resolved",
            ItemStatus::Failed => "failed",
        }
    }
}

impl FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ItemStatus::Pending),
            "resolving" => Ok(ItemStatus::Resolving),
            "resolved" => Ok(ItemStatus::Resolved),
            "failed" => Ok(ItemStatus::Failed),
            _ => Err(format!("unknown item status: {s}")),
        }
    }
}

/// Transfer status of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    /// Waiting in the queue.
    Pending,
    /// Claimed by exactly one worker.
    InProgress,
    /// On disk, size and digest verified where known.
    Done,
    /// Terminal failure after exhausting recovery.
    Failed,
    /// Skipped without transfer (sync-mode hit).
    Skipped,
}

impl FileStatus {
    /// Stable string form stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::InProgress => "in_progress",
            FileStatus::Done => "done",
            FileStatus::Failed => "failed",
            FileStatus::Skipped => "skipped",
        }
    }
}

impl FromStr for FileStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(FileStatus::Pending),
            "in_progress" => Ok(FileStatus::InProgress),
            "done" => Ok(FileStatus::Done),
            "failed" => Ok(FileStatus::Failed),
            "skipped" => Ok(FileStatus::Skipped),
            _ => Err(format!("unknown file status: {s}")),
        }
    }
}

/// Persisted job configuration.
#[derive(Debug, Clone)]
pub struct JobRecord {
    /// Stable id derived from the canonical output root.
    pub id: String,
    /// Output root directory.
    pub output_root: PathBuf,
    /// Optional filename regex filter.
    pub name_regex: Option<String>,
    /// Lowercased extension whitelist, empty = all.
    pub extensions: Vec<String>,
    /// Retain only manifest/metadata files.
    pub metadata_only: bool,
    /// Skip files already present and verified on disk.
    pub sync_existing: bool,
    /// Dynamic worker scaling enabled.
    pub dynamic_scaling: bool,
    /// Maximum concurrent workers.
    pub worker_ceiling: u32,
    /// Bandwidth ceiling in bytes/sec, 0 = unlimited.
    pub bandwidth_ceiling_bps: u64,
}

impl JobRecord {
    /// Derive the stable job id from an output root path.
    ///
    /// The path is canonicalized when possible so `./out` and `out` map to
    /// the same job across restarts and interfaces.
    pub fn derive_id(output_root: &Path) -> String {
        let canonical = output_root
            .canonicalize()
            .unwrap_or_else(|_| output_root.to_path_buf());
        format!("{:x}", md5::compute(canonical.to_string_lossy().as_bytes()))
    }
}

/// One archive item within a job.
#[derive(Debug, Clone)]
pub struct ItemRecord {
    /// Row id.
    pub id: i64,
    /// Archive identifier.
    pub identifier: String,
    /// Resolution status.
    pub status: ItemStatus,
    /// Manifest-fetch error, if the item failed.
    pub error: Option<String>,
}

/// One remote file belonging to an item.
#[derive(Debug, Clone)]
pub struct FileRecord {
    /// Row id.
    pub id: i64,
    /// Owning item row id.
    pub item_id: i64,
    /// Identifier of the owning item (for URL construction).
    pub identifier: String,
    /// Logical name on the remote side.
    pub remote_name: String,
    /// Remote size in bytes, 0 = unknown.
    pub size: u64,
    /// Expected MD5 hex digest published by the archive, if any.
    pub expected_md5: Option<String>,
    /// Destination path of the final object.
    pub local_path: PathBuf,
    /// Bytes persisted so far.
    pub bytes_downloaded: u64,
    /// Transfer status.
    pub status: FileStatus,
    /// Attempts consumed.
    pub attempts: u32,
    /// Classification of the most recent failure, if any.
    pub last_error: Option<String>,
    /// Terminal HTTP status, if the last failure came from a response.
    pub http_status: Option<u16>,
}

/// Terminal values written back when a worker returns a file.
#[derive(Debug, Clone)]
pub struct FileOutcome {
    /// New status.
    pub status: FileStatus,
    /// Bytes on disk at release time.
    pub bytes_downloaded: u64,
    /// Attempts consumed so far.
    pub attempts: u32,
    /// Error classification string, if any.
    pub last_error: Option<String>,
    /// Terminal HTTP status, if the failure came from a response.
    pub http_status: Option<u16>,
}

/// Aggregate progress counts for a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressCounts {
    /// All file rows.
    pub total: u64,
    /// Files done.
    pub done: u64,
    /// Files failed.
    pub failed: u64,
    /// Files claimed by a worker.
    pub in_progress: u64,
    /// Files waiting.
    pub pending: u64,
    /// Files skipped.
    pub skipped: u64,
    /// Sum of bytes downloaded across all files.
    pub bytes_downloaded: u64,
}

impl ProgressCounts {
    /// Whether no transferable work remains.
    pub fn is_drained(&self) -> bool {
        self.pending == 0 && self.in_progress == 0
    }
}

/// Handle to the SQLite-backed state store.
#[derive(Clone)]
pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    /// Open (and create if absent) the store at `path`, enable WAL
    /// journaling, and verify integrity. A failed integrity check is fatal.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Corrupt(format!("cannot create state dir: {e}")))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let check: String = sqlx::query_scalar("PRAGMA quick_check")
            .fetch_one(&pool)
            .await?;
        if check != "ok" {
            return Err(StoreError::Corrupt(check));
        }

        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&pool).await?;
        }

        Ok(Self { pool })
    }

    /// Convenience constructor for the store inside an output root.
    pub async fn open_in_root(output_root: &Path) -> Result<Self, StoreError> {
        Self::open(&output_root.join(STATE_FILE_NAME)).await
    }

    /// Insert or update the job row.
    pub async fn upsert_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        let now = chrono::Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            INSERT INTO jobs (id, output_root, name_regex, extensions, metadata_only,
                              sync_existing, dynamic_scaling, worker_ceiling,
                              bandwidth_ceiling_bps, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name_regex = excluded.name_regex,
                extensions = excluded.extensions,
                metadata_only = excluded.metadata_only,
                sync_existing = excluded.sync_existing,
                dynamic_scaling = excluded.dynamic_scaling,
                worker_ceiling = excluded.worker_ceiling,
                bandwidth_ceiling_bps = excluded.bandwidth_ceiling_bps,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&job.id)
        .bind(job.output_root.to_string_lossy().to_string())
        .bind(&job.name_regex)
        .bind(job.extensions.join(","))
        .bind(job.metadata_only as i64)
        .bind(job.sync_existing as i64)
        .bind(job.dynamic_scaling as i64)
        .bind(job.worker_ceiling as i64)
        .bind(job.bandwidth_ceiling_bps as i64)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Load a job row by id, if present.
    pub async fn load_job(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, output_root, name_regex, extensions, metadata_only, sync_existing,
                    dynamic_scaling, worker_ceiling, bandwidth_ceiling_bps
             FROM jobs WHERE id = ?",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| {
            let extensions: String = r.get("extensions");
            JobRecord {
                id: r.get("id"),
                output_root: PathBuf::from(r.get::<String, _>("output_root")),
                name_regex: r.get("name_regex"),
                extensions: extensions
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
                metadata_only: r.get::<i64, _>("metadata_only") != 0,
                sync_existing: r.get::<i64, _>("sync_existing") != 0,
                dynamic_scaling: r.get::<i64, _>("dynamic_scaling") != 0,
                worker_ceiling: r.get::<i64, _>("worker_ceiling") as u32,
                bandwidth_ceiling_bps: r.get::<i64, _>("bandwidth_ceiling_bps") as u64,
            }
        }))
    }

    /// Insert an item if absent and return its row id.
    pub async fn insert_item(&self, job_id: &str, identifier: &str) -> Result<i64, StoreError> {
        sqlx::query("INSERT OR IGNORE INTO items (job_id, identifier) VALUES (?, ?)")
            .bind(job_id)
            .bind(identifier)
            .execute(&self.pool)
            .await?;

        let id: i64 =
            sqlx::query_scalar("SELECT id FROM items WHERE job_id = ? AND identifier = ?")
                .bind(job_id)
                .bind(identifier)
                .fetch_one(&self.pool)
                .await?;
        Ok(id)
    }

    /// List all items of a job in insertion order.
    pub async fn list_items(&self, job_id: &str) -> Result<Vec<ItemRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, identifier, status, error FROM items WHERE job_id = ? ORDER BY id ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                let status: String = r.get("status");
                Ok(ItemRecord {
                    id: r.get("id"),
                    identifier: r.get("identifier"),
                    status: status.parse().map_err(StoreError::Corrupt)?,
                    error: r.get("error"),
                })
            })
            .collect()
    }

    /// Transition an item's resolution status.
    pub async fn set_item_status(
        &self,
        item_id: i64,
        status: ItemStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE items SET status = ?, error = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(error)
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Insert a file row if absent and return its id. Re-resolving an item
    /// is idempotent: an existing row (and its progress) is left untouched.
    pub async fn insert_file(
        &self,
        item_id: i64,
        remote_name: &str,
        size: u64,
        expected_md5: Option<&str>,
        local_path: &Path,
    ) -> Result<i64, StoreError> {
        sqlx::query(
            "INSERT OR IGNORE INTO files (item_id, remote_name, size, expected_md5, local_path)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(item_id)
        .bind(remote_name)
        .bind(size as i64)
        .bind(expected_md5)
        .bind(local_path.to_string_lossy().to_string())
        .execute(&self.pool)
        .await?;

        let id: i64 =
            sqlx::query_scalar("SELECT id FROM files WHERE item_id = ? AND remote_name = ?")
                .bind(item_id)
                .bind(remote_name)
                .fetch_one(&self.pool)
                .await?;
        Ok(id)
    }

    /// List file rows of an item in manifest order.
    pub async fn list_files(&self, item_id: i64) -> Result<Vec<FileRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT f.id, f.item_id, i.identifier, f.remote_name, f.size, f.expected_md5,
                    f.local_path, f.bytes_downloaded, f.status, f.attempts, f.last_error,
                    f.http_status
             FROM files f JOIN items i ON i.id = f.item_id
             WHERE f.item_id = ? ORDER BY f.id ASC",
        )
        .bind(item_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::file_from_row).collect()
    }

    /// Load one file row by id.
    pub async fn load_file(&self, file_id: i64) -> Result<FileRecord, StoreError> {
        let row = sqlx::query(
            "SELECT f.id, f.item_id, i.identifier, f.remote_name, f.size, f.expected_md5,
                    f.local_path, f.bytes_downloaded, f.status, f.attempts, f.last_error,
                    f.http_status
             FROM files f JOIN items i ON i.id = f.item_id
             WHERE f.id = ?",
        )
        .bind(file_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::MissingRow(format!("file {file_id}")))?;

        Self::file_from_row(row)
    }

    fn file_from_row(r: sqlx::sqlite::SqliteRow) -> Result<FileRecord, StoreError> {
        let status: String = r.get("status");
        Ok(FileRecord {
            id: r.get("id"),
            item_id: r.get("item_id"),
            identifier: r.get("identifier"),
            remote_name: r.get("remote_name"),
            size: r.get::<i64, _>("size") as u64,
            expected_md5: r.get("expected_md5"),
            local_path: PathBuf::from(r.get::<String, _>("local_path")),
            bytes_downloaded: r.get::<i64, _>("bytes_downloaded") as u64,
            status: status.parse().map_err(StoreError::Corrupt)?,
            attempts: r.get::<i64, _>("attempts") as u32,
            last_error: r.get("last_error"),
            http_status: r.get::<Option<i64>, _>("http_status").map(|s| s as u16),
        })
    }

    /// Conditionally claim a file for exclusive transfer.
    ///
    /// Expressed as a single compare-and-update statement so a double claim
    /// is impossible: only the worker whose `UPDATE` flipped the row from
    /// `pending` gets `true`.
    pub async fn claim_file(&self, file_id: i64) -> Result<bool, StoreError> {
        let result =
            sqlx::query("UPDATE files SET status = 'in_progress' WHERE id = ? AND status = 'pending'")
                .bind(file_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Return a claimed file with its terminal outcome for this attempt run.
    pub async fn release_file(
        &self,
        file_id: i64,
        outcome: &FileOutcome,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE files SET status = ?, bytes_downloaded = ?, attempts = ?,
                              last_error = ?, http_status = ?
             WHERE id = ?",
        )
        .bind(outcome.status.as_str())
        .bind(outcome.bytes_downloaded as i64)
        .bind(outcome.attempts as i64)
        .bind(&outcome.last_error)
        .bind(outcome.http_status.map(|s| s as i64))
        .bind(file_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist the byte counter mid-transfer (coarse checkpoint cadence).
    pub async fn checkpoint_bytes(&self, file_id: i64, bytes: u64) -> Result<(), StoreError> {
        sqlx::query("UPDATE files SET bytes_downloaded = ? WHERE id = ?")
            .bind(bytes as i64)
            .bind(file_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Reclaim files stuck in `in_progress` from a dead session back to
    /// `pending`. Only a live claim is authoritative.
    pub async fn reclaim_in_progress(&self, job_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE files SET status = 'pending'
             WHERE status = 'in_progress'
               AND item_id IN (SELECT id FROM items WHERE job_id = ?)",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Ids of all pending files of a job, in row order.
    pub async fn pending_files(&self, job_id: &str) -> Result<Vec<i64>, StoreError> {
        let rows = sqlx::query_scalar::<_, i64>(
            "SELECT f.id FROM files f JOIN items i ON i.id = f.item_id
             WHERE i.job_id = ? AND f.status = 'pending' ORDER BY f.id ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Snapshot-consistent aggregate counts for a job.
    pub async fn progress_snapshot(&self, job_id: &str) -> Result<ProgressCounts, StoreError> {
        let rows = sqlx::query(
            "SELECT f.status AS status, COUNT(*) AS n, COALESCE(SUM(f.bytes_downloaded), 0) AS bytes
             FROM files f JOIN items i ON i.id = f.item_id
             WHERE i.job_id = ?
             GROUP BY f.status",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = ProgressCounts::default();
        for row in rows {
            let status: String = row.get("status");
            let n = row.get::<i64, _>("n") as u64;
            counts.total += n;
            counts.bytes_downloaded += row.get::<i64, _>("bytes") as u64;
            match status.parse::<FileStatus>().map_err(StoreError::Corrupt)? {
                FileStatus::Pending => counts.pending = n,
                FileStatus::InProgress => counts.in_progress = n,
                FileStatus::Done => counts.done = n,
                FileStatus::Failed => counts.failed = n,
                FileStatus::Skipped => counts.skipped = n,
            }
        }
        Ok(counts)
    }
}

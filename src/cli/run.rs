//! `start`, `resume`, and `status` command implementations.

use crate::cli::error::{CliError, EXIT_INTERRUPTED, EXIT_SUCCESS};
use crate::downloader::{
    CancelGate, DownloadEngine, EngineConfig, EngineEvent, EngineHandle, EngineOverrides, Snapshot,
};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Resilient bulk downloader for Internet Archive items.
#[derive(Debug, Parser)]
#[command(name = "archive-batch-downloader", version, about)]
pub struct Cli {
    /// Command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start a new download job.
    Start(StartArgs),
    /// Resume the job persisted under an output directory.
    Resume(ResumeArgs),
    /// Show the status of a persisted job.
    Status(StatusArgs),
}

/// Arguments for `start`.
#[derive(Debug, Args)]
pub struct StartArgs {
    /// Path to the items list (plain text or CSV with an identifier column).
    #[arg(long)]
    pub items: PathBuf,

    /// Output directory.
    #[arg(long)]
    pub output: PathBuf,

    /// Maximum concurrent workers.
    #[arg(long, default_value_t = 4)]
    pub workers: u32,

    /// Bandwidth limit in MB/s (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    pub speed_limit: u64,

    /// Skip files already present and verified on disk.
    #[arg(long)]
    pub sync: bool,

    /// Start with one worker and scale on observed behavior.
    #[arg(long)]
    pub dynamic: bool,

    /// Download only manifest/metadata files.
    #[arg(long)]
    pub metadata_only: bool,

    /// Filename regex filter.
    #[arg(long)]
    pub filter: Option<String>,

    /// Comma-separated extension whitelist (e.g. mp3,pdf).
    #[arg(long)]
    pub extensions: Option<String>,

    /// Path to a credentials file with S3_ACCESS_KEY and S3_SECRET_KEY.
    #[arg(long)]
    pub auth: Option<PathBuf>,
}

impl StartArgs {
    /// Execute the command; returns the process exit code.
    pub async fn execute(&self, cancel: CancelGate) -> Result<i32, CliError> {
        let mut config = EngineConfig::new(&self.output);
        config.items_path = Some(self.items.clone());
        config.worker_ceiling = self.workers;
        config.bandwidth_ceiling_bps = self.speed_limit * 1024 * 1024;
        config.sync = self.sync;
        config.dynamic = self.dynamic;
        config.metadata_only = self.metadata_only;
        config.name_regex = self.filter.clone();
        config.extension_whitelist = parse_extensions(self.extensions.as_deref());
        config.auth_path = self.auth.clone();

        info!(output = %self.output.display(), "starting download job");
        let handle = DownloadEngine::start_with_cancel(config, cancel.clone()).await?;
        monitor(handle, cancel).await
    }
}

/// Arguments for `resume`.
#[derive(Debug, Args)]
pub struct ResumeArgs {
    /// Output directory holding an existing job.
    #[arg(long)]
    pub output: PathBuf,

    /// Override the persisted worker ceiling.
    #[arg(long)]
    pub workers: Option<u32>,

    /// Override the persisted bandwidth limit in MB/s.
    #[arg(long)]
    pub speed_limit: Option<u64>,

    /// Override the persisted sync flag.
    #[arg(long)]
    pub sync: bool,

    /// Override the persisted dynamic-scaling flag.
    #[arg(long)]
    pub dynamic: bool,

    /// Path to a credentials file.
    #[arg(long)]
    pub auth: Option<PathBuf>,
}

impl ResumeArgs {
    /// Execute the command; returns the process exit code.
    pub async fn execute(&self, cancel: CancelGate) -> Result<i32, CliError> {
        let overrides = EngineOverrides {
            worker_ceiling: self.workers,
            bandwidth_ceiling_bps: self.speed_limit.map(|mb| mb * 1024 * 1024),
            sync: self.sync.then_some(true),
            dynamic: self.dynamic.then_some(true),
            auth_path: self.auth.clone(),
            endpoints: None,
        };

        info!(output = %self.output.display(), "resuming download job");
        let handle =
            DownloadEngine::resume_with_cancel(&self.output, overrides, cancel.clone()).await?;
        monitor(handle, cancel).await
    }
}

/// Arguments for `status`.
#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Output directory holding an existing job.
    #[arg(long)]
    pub output: PathBuf,
}

impl StatusArgs {
    /// Execute the command; returns the process exit code.
    pub async fn execute(&self) -> Result<i32, CliError> {
        let snapshot = DownloadEngine::status(&self.output).await?;
        print_summary(&snapshot);
        Ok(EXIT_SUCCESS)
    }
}

fn parse_extensions(raw: Option<&str>) -> Vec<String> {
    raw.map(|list| {
        list.split(',')
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

/// Follow a running job: render snapshots on a progress line, log file
/// outcomes, and map the final state to an exit code.
async fn monitor(handle: EngineHandle, cancel: CancelGate) -> Result<i32, CliError> {
    let mut events = handle.subscribe();

    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.enable_steady_tick(Duration::from_millis(120));

    let printer_bar = bar.clone();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(EngineEvent::Metrics(snapshot)) => {
                    printer_bar.set_message(format_progress(&snapshot));
                }
                Ok(EngineEvent::FileFinished {
                    identifier,
                    remote_name,
                    status,
                    error,
                }) => match error {
                    Some(kind) => printer_bar
                        .println(format!("failed  {identifier}/{remote_name} ({kind})")),
                    None if status == "done" => {
                        printer_bar.println(format!("done    {identifier}/{remote_name}"))
                    }
                    None => {}
                },
                Ok(EngineEvent::ItemFailed { identifier, error }) => {
                    printer_bar.println(format!("item failed: {identifier} ({error})"));
                }
                Ok(EngineEvent::BackoffTripped { quiet_secs }) => {
                    printer_bar.println(format!("backoff tripped, quiet for ~{quiet_secs}s"));
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let snapshot = handle.wait().await?;
    printer.abort();
    bar.finish_and_clear();

    print_summary(&snapshot);

    let interrupted = cancel.is_cancelled() && !snapshot.is_settled();
    Ok(if interrupted {
        EXIT_INTERRUPTED
    } else {
        EXIT_SUCCESS
    })
}

fn format_progress(snapshot: &Snapshot) -> String {
    let mut parts = vec![format!(
        "{}/{} files",
        snapshot.done + snapshot.skipped,
        snapshot.total_files
    )];
    parts.push(format!("{} workers", snapshot.current_workers));
    parts.push(format!(
        "{:.1} MB/s",
        snapshot.bytes_per_sec as f64 / 1_000_000.0
    ));
    if snapshot.failed > 0 {
        parts.push(format!("{} failed", snapshot.failed));
    }
    if let Some(quiet) = snapshot.quiet_remaining_secs {
        parts.push(format!("backoff {quiet}s"));
    }
    if let Some(eta) = snapshot.eta_seconds {
        parts.push(format!("~{}m{}s left", eta / 60, eta % 60));
    }
    parts.join(" | ")
}

fn print_summary(snapshot: &Snapshot) {
    println!("total files:  {}", snapshot.total_files);
    println!("done:         {}", snapshot.done);
    println!("skipped:      {}", snapshot.skipped);
    println!("failed:       {}", snapshot.failed);
    println!("pending:      {}", snapshot.pending + snapshot.in_progress);
    println!(
        "bytes:        {:.2} GB",
        snapshot.bytes_downloaded as f64 / 1_073_741_824.0
    );
}

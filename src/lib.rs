//! # Archive Batch Downloader Library
//!
//! A resilient, resumable, rate-aware bulk downloader for Internet Archive
//! items. Given a list of item identifiers and an output directory, the
//! engine enumerates each item's file manifest, fetches every file that
//! matches the configured filters, and records durable per-file progress so
//! any interruption can be recovered without re-downloading completed bytes.
//!
//! ## Features
//!
//! - **Byte-Level Resume**: partial objects resume with HTTP range requests
//!   and a re-seeded running digest
//! - **Integrity Verification**: size and published-MD5 checks gate the
//!   atomic rename that makes a file visible
//! - **Global Backoff**: one throttled worker quiets the whole pool for a
//!   randomized interval
//! - **Dynamic Scaling**: the worker target follows observed server
//!   behavior between one and the configured ceiling
//! - **Bandwidth Governing**: a shared token bucket admits every byte
//! - **Single Source of Truth**: one SQLite state file shared by the CLI,
//!   library embedders, and headless invocations
//!
//! ## Quick Start
//!
//! ```no_run
//! use archive_batch_downloader::downloader::{DownloadEngine, EngineConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = EngineConfig::new("./downloads");
//! config.items_path = Some("items.txt".into());
//! config.worker_ceiling = 8;
//!
//! let handle = DownloadEngine::start(config).await?;
//! let snapshot = handle.wait().await?;
//! println!("done: {} failed: {}", snapshot.done, snapshot.failed);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`store`] - durable SQLite state store (jobs, items, files)
//! - [`resolver`] - manifest resolution and the filter pipeline
//! - [`fetcher`] - HTTP client and the per-file transfer protocol
//! - [`downloader`] - governor, backoff, scheduler, and job controller
//! - [`input`] / [`auth`] - items list and credentials parsing
//! - [`metrics`] - Prometheus observability

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Credentials file parsing.
pub mod auth;

/// CLI command implementations.
pub mod cli;

/// Download orchestration.
pub mod downloader;

/// HTTP access and per-file transfer.
pub mod fetcher;

/// Items list parsing.
pub mod input;

/// Observability metrics.
pub mod metrics;

/// Manifest resolution and filtering.
pub mod resolver;

/// Durable state store.
pub mod store;

// Re-export the engine contract surface.
pub use downloader::{
    CancelGate, DownloadEngine, EngineConfig, EngineError, EngineEvent, EngineHandle,
    EngineOverrides, EngineState, Snapshot,
};

//! Download orchestration: bandwidth governing, global backoff, worker
//! scheduling, and job control.

pub mod backoff;
pub mod cancel;
pub mod config;
pub mod controller;
pub mod events;
pub mod governor;
pub mod scheduler;

pub use backoff::{BackoffCoordinator, TripReason};
pub use cancel::CancelGate;
pub use config::{ArchiveEndpoints, ConfigError, EngineConfig};
pub use controller::{DownloadEngine, EngineHandle, EngineOverrides};
pub use events::{EngineEvent, EngineState, Snapshot, TransferStats};
pub use governor::RateGovernor;
pub use scheduler::{ScalingPolicy, WorkerPool};

use crate::auth::AuthError;
use crate::fetcher::FetchError;
use crate::input::InputError;
use crate::store::StoreError;
use std::path::PathBuf;

/// Engine-level errors surfaced to collaborators.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration rejected at validation.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Items list missing or unparseable.
    #[error("input error: {0}")]
    Input(#[from] InputError),

    /// Credentials file missing or malformed.
    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    /// State store failure; fatal for the job.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// HTTP client construction failed.
    #[error("client error: {0}")]
    Client(#[from] FetchError),

    /// Resume or status requested where no job state exists.
    #[error("no job state found under {}", .0.display())]
    NoJob(PathBuf),

    /// The engine task itself died.
    #[error("engine task panicked: {0}")]
    Panicked(String),
}

//! CLI error type and exit-code mapping.

use crate::downloader::EngineError;

/// Process exit code for success (all done or cleanly stopped with nothing
/// outstanding).
pub const EXIT_SUCCESS: i32 = 0;

/// Process exit code for configuration or I/O errors.
pub const EXIT_ERROR: i32 = 1;

/// Process exit code for an interrupted job with outstanding work.
pub const EXIT_INTERRUPTED: i32 = 2;

/// Errors surfaced by CLI commands.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Invalid command-line argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Engine-level failure.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl CliError {
    /// Exit code for this error.
    pub fn exit_code(&self) -> i32 {
        EXIT_ERROR
    }
}

//! CLI command implementations

pub mod error;
pub mod run;

pub use error::{CliError, EXIT_ERROR, EXIT_INTERRUPTED, EXIT_SUCCESS};
pub use run::{Cli, Commands, ResumeArgs, StartArgs, StatusArgs};

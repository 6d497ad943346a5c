//! Main entry point for the archive-batch-downloader CLI

use archive_batch_downloader::cli::{Cli, Commands};
use archive_batch_downloader::metrics;
use archive_batch_downloader::CancelGate;
use clap::Parser;
use std::net::SocketAddr;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber with optional JSON formatting.
fn init_tracing() {
    let json_format = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("archive_batch_downloader=info"));

    if json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    // One cancel gate for the whole process, tripped by Ctrl+C.
    let cancel = CancelGate::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received - saving progress before exit");
                cancel.cancel();
            }
        }
    });

    // Metrics exporter is optional; a bad address only disables it.
    if let Ok(addr) = std::env::var("METRICS_ADDR") {
        match addr.parse::<SocketAddr>() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr).await {
                    tracing::warn!("failed to initialize metrics: {e}. Continuing without.");
                }
            }
            Err(_) => tracing::debug!("invalid metrics address: {addr}. Metrics disabled."),
        }
    }

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Start(ref args) => args.execute(cancel.clone()).await,
        Commands::Resume(ref args) => args.execute(cancel.clone()).await,
        Commands::Status(ref args) => args.execute().await,
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("command failed: {e}");
            std::process::exit(e.exit_code());
        }
    }
}

//! Production observability metrics for the download engine.
//!
//! Tracks throttling responses, backoff trips, retry behavior, pool scaling,
//! and transfer throughput.
//!
//! ## Architecture
//!
//! - Uses the `metrics` crate for low-overhead collection
//! - Prometheus exporter for the scrape endpoint (`METRICS_ADDR`)
//! - Graceful degradation when the exporter cannot bind

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::Lazy;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info};

static METRICS_INITIALIZED: Lazy<Arc<RwLock<bool>>> = Lazy::new(|| Arc::new(RwLock::new(false)));

/// Initialize the metrics system with a Prometheus exporter.
///
/// Call once at application startup; the function is idempotent.
pub async fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    let mut initialized = METRICS_INITIALIZED.write().await;
    if *initialized {
        debug!("metrics already initialized, skipping");
        return Ok(());
    }

    info!("initializing metrics system on {}", addr);

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        "files_completed_total",
        Unit::Count,
        "Files downloaded and verified"
    );
    describe_counter!("files_failed_total", Unit::Count, "Files failed terminally");
    describe_counter!(
        "files_skipped_total",
        Unit::Count,
        "Files skipped without transfer"
    );
    describe_counter!(
        "throttle_responses_total",
        Unit::Count,
        "429/503 responses received from the archive"
    );
    describe_counter!(
        "backoff_trips_total",
        Unit::Count,
        "Times the global quiet period was tripped"
    );
    describe_counter!(
        "items_resolved_total",
        Unit::Count,
        "Item manifests resolved"
    );
    describe_counter!(
        "items_failed_total",
        Unit::Count,
        "Item manifests that failed terminally"
    );
    describe_gauge!("queue_depth", Unit::Count, "Files waiting in the work queue");
    describe_gauge!(
        "worker_target",
        Unit::Count,
        "Current dynamic scaling target"
    );
    describe_gauge!(
        "transfer_rate_bytes_per_second",
        Unit::CountPerSecond,
        "Rolling one-second transfer throughput in bytes"
    );
    describe_histogram!(
        "file_transfer_duration_seconds",
        Unit::Seconds,
        "Wall time per completed file"
    );

    *initialized = true;
    info!("metrics system initialized on {}", addr);
    Ok(())
}

/// Whether the metrics system has been initialized.
pub async fn is_initialized() -> bool {
    *METRICS_INITIALIZED.read().await
}

/// Record the engine's once-per-second gauge readings.
pub fn record_engine_gauges(queue_depth: u64, worker_target: u32, bytes_per_sec: u64) {
    gauge!("queue_depth").set(queue_depth as f64);
    gauge!("worker_target").set(worker_target as f64);
    gauge!("transfer_rate_bytes_per_second").set(bytes_per_sec as f64);
}

/// Record a backoff trip.
pub fn record_backoff_trip(reason: &'static str) {
    counter!("backoff_trips_total", "reason" => reason).increment(1);
}

/// Record an item resolution outcome.
pub fn record_item_outcome(resolved: bool) {
    if resolved {
        counter!("items_resolved_total").increment(1);
    } else {
        counter!("items_failed_total").increment(1);
    }
}

/// Per-file transfer timer and outcome recorder.
pub struct FileMetrics {
    started: Instant,
}

impl Default for FileMetrics {
    fn default() -> Self {
        Self::start()
    }
}

impl FileMetrics {
    /// Start timing a file transfer.
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    /// Record a verified completion.
    pub fn record_done(&self) {
        histogram!("file_transfer_duration_seconds").record(self.started.elapsed().as_secs_f64());
        counter!("files_completed_total").increment(1);
    }

    /// Record a terminal failure with its classification.
    pub fn record_failed(&self, kind: &'static str) {
        counter!("files_failed_total", "kind" => kind).increment(1);
    }

    /// Record a skip (sync-mode hit or duplicate claim).
    pub fn record_skipped(&self) {
        counter!("files_skipped_total").increment(1);
    }
}

//! Prometheus metrics for the CloudRAID node
//!
//! Recording is a no-op until a recorder is installed, so the helpers are
//! safe to call from tests and from nodes running without an exporter.

use crate::error::ServiceError;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names as constants
pub mod names {
    // Pipeline metrics
    pub const FILES_SPLIT: &str = "cloudraid_files_split_total";
    pub const BYTES_SPLIT: &str = "cloudraid_bytes_split_total";
    pub const PARITY_MISMATCHES: &str = "cloudraid_parity_mismatches_total";

    // Distribution metrics
    pub const SHARD_UPLOADS: &str = "cloudraid_shard_uploads_total";
    pub const SHARD_UPLOAD_FAILURES: &str = "cloudraid_shard_upload_failures_total";

    // Worker metrics
    pub const QUEUE_DEPTH: &str = "cloudraid_queue_depth";
    pub const LOCK_CONTENTIONS: &str = "cloudraid_lock_contentions_total";
}

/// Describe all metrics and start the Prometheus exporter on `port`
pub fn init_metrics(port: u16) -> Result<(), ServiceError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| ServiceError::Metrics(e.to_string()))?;

    describe_counter!(names::FILES_SPLIT, "Files split into shard sets");
    describe_counter!(names::BYTES_SPLIT, "Input bytes split into shard sets");
    describe_counter!(
        names::PARITY_MISMATCHES,
        "Chunks whose parity did not match during merge"
    );
    describe_counter!(names::SHARD_UPLOADS, "Confirmed shard uploads per connector");
    describe_counter!(
        names::SHARD_UPLOAD_FAILURES,
        "Shard uploads that failed after all retries"
    );
    describe_gauge!(names::QUEUE_DEPTH, "Entries waiting in the work queue");
    describe_counter!(
        names::LOCK_CONTENTIONS,
        "Queue entries deferred because their file was locked"
    );

    info!(%addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_file_split(bytes: u64) {
    counter!(names::FILES_SPLIT).increment(1);
    counter!(names::BYTES_SPLIT).increment(bytes);
}

pub fn record_shard_upload(connector: &str, success: bool) {
    if success {
        counter!(names::SHARD_UPLOADS, "connector" => connector.to_string()).increment(1);
    } else {
        counter!(names::SHARD_UPLOAD_FAILURES, "connector" => connector.to_string()).increment(1);
    }
}

pub fn record_parity_mismatches(count: u64) {
    counter!(names::PARITY_MISMATCHES).increment(count);
}

pub fn record_lock_contention() {
    counter!(names::LOCK_CONTENTIONS).increment(1);
}

pub fn set_queue_depth(depth: usize) {
    gauge!(names::QUEUE_DEPTH).set(depth as f64);
}

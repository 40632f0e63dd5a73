// src/observability.rs
//! Tracing and metrics initialization

use crate::utils::errors::{ArchiveError, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// Filtering follows `RUST_LOG`, defaulting to `info`.
pub fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| ArchiveError::ConfigError(format!("Failed to init tracing: {}", e)))
}

/// Describe the archive metrics and, when `listen_addr` is given, serve them
/// in Prometheus format.
pub fn init_metrics(listen_addr: Option<SocketAddr>) -> Result<()> {
    if let Some(addr) = listen_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| {
                ArchiveError::ConfigError(format!("Failed to start metrics exporter: {}", e))
            })?;
    }

    metrics::describe_gauge!(
        "warc_shard_writers_busy",
        "Shard writers currently writing a record"
    );
    metrics::describe_counter!(
        "warc_records_written_total",
        "Records appended to shard files"
    );
    metrics::describe_counter!(
        "warc_records_suppressed_total",
        "Responses not archived (304 Not Modified)"
    );
    metrics::describe_counter!(
        "warc_record_write_errors_total",
        "Records that failed to reach their shard"
    );
    metrics::describe_counter!(
        "warc_bytes_written_total",
        "Compressed bytes appended to shard files"
    );

    Ok(())
}

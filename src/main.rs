// src/main.rs
//! Warc Proxy
//!
//! Forward HTTP proxy that records every request and response into sharded
//! WARC files. Usage: `warc-proxy [config.toml]`.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use warc_proxy::observability::{init_metrics, init_tracing};
use warc_proxy::{Archiver, HttpInterceptor, WarcProxyConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = WarcProxyConfig::load(config_path.as_deref()).context("Failed to load configuration")?;

    // Initialize observability (tracing, metrics)
    init_tracing(config.proxy.json_logs)?;
    init_metrics(config.proxy.metrics_addr)?;

    info!("Starting warc-proxy v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {:?}", config);

    let archiver = Arc::new(
        Archiver::new(config.archiver.clone())
            .await
            .context("Can't open archive directory")?,
    );

    let interceptor = Arc::new(HttpInterceptor::new(
        config.proxy.listen_addr,
        Arc::clone(&archiver),
    ));

    // Graceful shutdown handler
    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for CTRL+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Got SIGINT, exiting");
    };

    let served = interceptor.start(shutdown_signal).await;

    let report = archiver.shutdown().await;
    for (ordinal, e) in report.errors() {
        warn!("Shard {} closed with error: {}", ordinal, e);
    }
    info!(
        "All connections closed - {} records archived",
        report.records_written()
    );

    served.context("Proxy server failed")
}

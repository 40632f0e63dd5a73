// src/utils/config.rs
//! Configuration layer
//!
//! Sources are merged in order: built-in defaults, an optional TOML file,
//! then `WARC_PROXY__*` environment variables
//! (e.g. `WARC_PROXY__ARCHIVER__SHARD_COUNT=4`).

use crate::recording::compressor::{CompressionLevel, FrameCodec};
use crate::utils::errors::{ArchiveError, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WarcProxyConfig {
    pub archiver: ArchiverConfig,
    pub proxy: ProxyConfig,
}

/// Archive pipeline settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArchiverConfig {
    /// Directory holding the shard files
    pub archive_dir: PathBuf,

    /// Number of shard writers (one file each)
    pub shard_count: usize,

    /// Capacity of the queue between encoders and shard writers
    pub queue_capacity: usize,

    /// Shard file name prefix
    pub file_prefix: String,

    /// Frame compression format
    pub codec: FrameCodec,

    /// Frame compression level
    pub compression_level: CompressionLevel,

    /// Release a response body after this long without new data
    pub body_idle_timeout_secs: u64,

    /// Bodies longer than this are truncated in the archive
    pub max_body_bytes: usize,
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            archive_dir: PathBuf::from("warcs"),
            shard_count: 10,
            queue_capacity: 10,
            file_prefix: "prox".to_string(),
            codec: FrameCodec::Gzip,
            compression_level: CompressionLevel::Balanced,
            body_idle_timeout_secs: 60,
            max_body_bytes: 64 * 1024 * 1024,
        }
    }
}

impl ArchiverConfig {
    /// Defaults rooted at `archive_dir` with `shard_count` writers
    pub fn new(archive_dir: impl Into<PathBuf>, shard_count: usize) -> Self {
        Self {
            archive_dir: archive_dir.into(),
            shard_count,
            ..Default::default()
        }
    }

    pub fn body_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.body_idle_timeout_secs)
    }

    /// Path of the shard file with the given ordinal
    pub fn shard_path(&self, ordinal: usize) -> PathBuf {
        self.archive_dir.join(format!(
            "{}-{:05}.{}",
            self.file_prefix,
            ordinal,
            self.codec.file_extension()
        ))
    }

    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 {
            return Err(ArchiveError::ConfigError(
                "shard_count must be at least 1".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ArchiveError::ConfigError(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Forward proxy settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Proxy listen address
    pub listen_addr: SocketAddr,

    /// Prometheus exporter address, disabled when absent
    pub metrics_addr: Option<SocketAddr>,

    /// Emit logs as JSON lines
    pub json_logs: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            metrics_addr: None,
            json_logs: false,
        }
    }
}

impl WarcProxyConfig {
    /// Load configuration from defaults, `path` (if any) and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("WARC_PROXY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: WarcProxyConfig = settings.try_deserialize()?;
        cfg.archiver.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ArchiverConfig::default();
        assert_eq!(cfg.shard_count, 10);
        assert_eq!(cfg.queue_capacity, 10);
        assert_eq!(cfg.body_idle_timeout(), Duration::from_secs(60));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_shard_path_is_zero_padded() {
        let cfg = ArchiverConfig::new("/tmp/archive", 3);
        assert_eq!(
            cfg.shard_path(7),
            PathBuf::from("/tmp/archive/prox-00007.warc.gz")
        );

        let zstd = ArchiverConfig {
            codec: FrameCodec::Zstd,
            ..cfg
        };
        assert!(zstd.shard_path(0).ends_with("prox-00000.warc.zst"));
    }

    #[test]
    fn test_zero_shards_rejected() {
        let cfg = ArchiverConfig::new("warcs", 0);
        assert!(matches!(cfg.validate(), Err(ArchiveError::ConfigError(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warc-proxy.toml");
        std::fs::write(
            &path,
            r#"
[archiver]
archive_dir = "/var/lib/warcs"
shard_count = 4
codec = "zstd"
compression_level = "fast"

[proxy]
listen_addr = "0.0.0.0:3128"
"#,
        )
        .unwrap();

        let cfg = WarcProxyConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.archiver.shard_count, 4);
        assert_eq!(cfg.archiver.queue_capacity, 10);
        assert_eq!(cfg.archiver.codec, FrameCodec::Zstd);
        assert_eq!(cfg.archiver.archive_dir, PathBuf::from("/var/lib/warcs"));
        assert_eq!(cfg.proxy.listen_addr.port(), 3128);
        assert!(cfg.proxy.metrics_addr.is_none());
    }
}

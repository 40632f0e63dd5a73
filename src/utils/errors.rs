// src/utils/errors.rs
//! Error types for the archival pipeline
//!
//! Every failure inside the pipeline is logged and isolated from the proxy
//! path; only startup failures surface to the caller.

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Archive pipeline errors
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Archive directory or shard file could not be created, opened or closed
    #[error("storage failed: {0}")]
    StorageFailed(String),

    /// Request/response head or body could not be turned into a record
    #[error("encoding failed: {0}")]
    EncodingFailed(String),

    /// A record could not be appended to its shard
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// A shard file does not hold well-formed records
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    /// Frame compression or decompression failed
    #[error("compression failed: {0}")]
    CompressionFailed(String),

    /// Configuration could not be loaded or is invalid
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// The forward proxy could not serve a connection
    #[error("interception failed: {0}")]
    InterceptionFailed(String),
}

impl From<config::ConfigError> for ArchiveError {
    fn from(e: config::ConfigError) -> Self {
        ArchiveError::ConfigError(e.to_string())
    }
}

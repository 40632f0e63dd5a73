// src/lib.rs
//! Warc Proxy Library
//!
//! Archives HTTP traffic passing through a proxy as sharded, gzip-framed
//! WARC files without adding latency to the proxied exchange.
//!
//! # Architecture
//!
//! The crate is structured into several key modules:
//!
//! - **recording**: capture events, body tee, WARC encoding, shard writers
//! - **interception**: plain-HTTP forward proxy feeding the archiver
//! - **observability**: tracing and metrics setup
//! - **utils**: configuration and error types

// Public module exports
pub mod interception;
pub mod observability;
pub mod recording;
pub mod utils;

// Re-export commonly used types
pub use interception::HttpInterceptor;
pub use recording::{Archiver, ExchangeContext, ShutdownReport};
pub use utils::config::{ArchiverConfig, WarcProxyConfig};
pub use utils::errors::{ArchiveError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}

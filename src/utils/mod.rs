// src/utils/mod.rs
//! Shared utilities: error taxonomy and configuration

pub mod config;
pub mod errors;

pub use config::{ArchiverConfig, ProxyConfig, WarcProxyConfig};
pub use errors::{ArchiveError, Result};

// src/interception/mod.rs
//! Request interception layer
//!
//! A plain-HTTP forward proxy that drives the archiver:
//!
//! - **HTTP Interceptor**: forwards absolute-form requests upstream and hands
//!   every request and (teed) response to the [`Archiver`](crate::recording::Archiver)
//! - `CONNECT` requests are tunneled as opaque bytes and not archived
//!
//! # Architecture
//!
//! ```text
//! Client ──► HTTP Interceptor ──► Upstream
//!                 │    ▲
//!      notify_request  └── notify_response (TeeBody)
//!                 ▼
//!             Archiver
//! ```

pub mod http_interceptor;

// Re-export commonly used types
pub use http_interceptor::{HttpInterceptor, ProxyBody};

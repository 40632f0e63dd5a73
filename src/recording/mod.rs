// src/recording/mod.rs
//! Exchange recording and storage
//!
//! This module turns intercepted HTTP exchanges into sharded WARC files:
//!
//! - **Archiver**: Entry point for the proxying side
//! - **Event**: Capture events (one request or one response)
//! - **Tee**: Response body duplication for the archive side
//! - **Encoder**: WARC record serialization
//! - **Shard Pool**: Persistent writers, one compressed file each
//! - **Compressor**: Per-record gzip / zstd frames
//! - **Reader**: Shard decoding and record parsing
//!
//! # Architecture
//!
//! ```text
//! Proxy → notify_*() → encode task → Bounded Queue → Shard Writer × N
//!            │              ▲                              ↓
//!            └─ TeeBody ────┘                     one frame per record
//!               (client path)                              ↓
//!                                                  prox-0000N.warc.gz
//! ```

pub mod archiver;
pub mod compressor;
pub mod encoder;
pub mod event;
pub mod reader;
pub mod shard_pool;
pub mod tee;

// Re-export commonly used types
pub use archiver::{Archiver, ArchiverStats, ShutdownReport};
pub use compressor::{CompressionLevel, Compressor, DecodedFrames, FrameCodec, FrameDamage};
pub use encoder::RecordEncoder;
pub use event::{CaptureEvent, CapturedMessage, ExchangeContext, RequestHead, ResponseHead};
pub use reader::{read_archive_dir, read_shard, WarcRecord};
pub use shard_pool::{ShardOutcome, ShardSink, ShardWriterPool};
pub use tee::{tee, BodyReceiver, TeeBody, Truncation};

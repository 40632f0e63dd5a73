// src/recording/compressor.rs
//! Per-record frame compression for shard files
//!
//! Every record is written as one complete, independently decodable frame
//! (a gzip member or a zstd frame). A shard file is the plain concatenation
//! of those frames, so truncating it after any finished write still leaves
//! a valid archive.

use crate::utils::errors::{ArchiveError, Result};
use flate2::bufread::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Deserialize;
use std::io::{Read, Write};
use tracing::debug;

/// Compression levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionLevel {
    /// Fast compression
    Fast,

    /// Balanced
    Balanced,

    /// Best compression
    Best,
}

impl CompressionLevel {
    fn gzip(&self) -> Compression {
        match self {
            CompressionLevel::Fast => Compression::fast(),
            CompressionLevel::Balanced => Compression::default(),
            CompressionLevel::Best => Compression::best(),
        }
    }

    fn zstd(&self) -> i32 {
        match self {
            CompressionLevel::Fast => 1,
            CompressionLevel::Balanced => 3,
            CompressionLevel::Best => 19,
        }
    }
}

/// Frame container format of a shard file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameCodec {
    Gzip,
    Zstd,
}

impl FrameCodec {
    pub fn file_extension(&self) -> &'static str {
        match self {
            FrameCodec::Gzip => "warc.gz",
            FrameCodec::Zstd => "warc.zst",
        }
    }
}

/// Frame compressor
#[derive(Debug, Clone, Copy)]
pub struct Compressor {
    codec: FrameCodec,
    level: CompressionLevel,
}

impl Compressor {
    /// Create a new compressor
    pub fn new(codec: FrameCodec, level: CompressionLevel) -> Self {
        Self { codec, level }
    }

    pub fn codec(&self) -> FrameCodec {
        self.codec
    }

    /// Write `data` to `writer` as one finalized frame.
    ///
    /// A fresh encoder is started on `writer` for every call and finished
    /// before returning, leaving `writer` positioned for the next frame.
    pub fn write_frame<W: Write>(&self, writer: W, data: &[u8]) -> Result<()> {
        match self.codec {
            FrameCodec::Gzip => {
                let mut encoder = GzEncoder::new(writer, self.level.gzip());
                encoder.write_all(data).map_err(frame_error)?;
                encoder.finish().map_err(frame_error)?;
            }
            FrameCodec::Zstd => {
                let mut encoder =
                    zstd::stream::write::Encoder::new(writer, self.level.zstd())
                        .map_err(frame_error)?;
                encoder.write_all(data).map_err(frame_error)?;
                encoder.finish().map_err(frame_error)?;
            }
        }

        debug!("Wrote {:?} frame for {} bytes", self.codec, data.len());
        Ok(())
    }

    /// Compress `data` into a standalone frame
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() / 2);
        self.write_frame(&mut out, data)?;
        Ok(out)
    }

    /// Decompress a concatenation of frames into one byte stream.
    ///
    /// Fails on the first damaged frame.
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let decoded = self.decompress_frames(data);
        if let Some(damage) = decoded.damage {
            return Err(damage.error);
        }
        Ok(decoded.frames.concat())
    }

    /// Decompress frame by frame, keeping every frame before the first
    /// damaged one.
    pub fn decompress_frames(&self, data: &[u8]) -> DecodedFrames {
        debug!("Decompressing {} bytes", data.len());

        let mut frames = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let decoded = match self.codec {
                FrameCodec::Gzip => gzip_frame(&data[offset..]),
                FrameCodec::Zstd => zstd_frame(&data[offset..]),
            };
            match decoded {
                Ok((frame, consumed)) => {
                    frames.push(frame);
                    offset += consumed;
                }
                Err(error) => {
                    return DecodedFrames {
                        frames,
                        damage: Some(FrameDamage { offset, error }),
                    }
                }
            }
        }

        DecodedFrames {
            frames,
            damage: None,
        }
    }
}

/// Frames recovered from a shard
#[derive(Debug)]
pub struct DecodedFrames {
    pub frames: Vec<Vec<u8>>,
    /// First frame that failed to decode, if any
    pub damage: Option<FrameDamage>,
}

#[derive(Debug)]
pub struct FrameDamage {
    /// Byte offset of the damaged frame in the shard
    pub offset: usize,
    pub error: ArchiveError,
}

/// Decode the gzip member at the start of `data`.
/// Returns the payload and the number of bytes the member occupies.
fn gzip_frame(data: &[u8]) -> Result<(Vec<u8>, usize)> {
    let mut rest = data;
    let mut frame = Vec::new();
    GzDecoder::new(&mut rest)
        .read_to_end(&mut frame)
        .map_err(|e| ArchiveError::CompressionFailed(format!("Decompression error: {}", e)))?;

    let consumed = data.len() - rest.len();
    if consumed == 0 {
        return Err(ArchiveError::CompressionFailed(
            "Decompression error: empty gzip member".to_string(),
        ));
    }
    Ok((frame, consumed))
}

/// Decode the zstd frame at the start of `data`.
fn zstd_frame(data: &[u8]) -> Result<(Vec<u8>, usize)> {
    let consumed = zstd::zstd_safe::find_frame_compressed_size(data).map_err(|code| {
        ArchiveError::CompressionFailed(format!(
            "Decompression error: {}",
            zstd::zstd_safe::get_error_name(code)
        ))
    })?;
    let frame = zstd::decode_all(&data[..consumed])
        .map_err(|e| ArchiveError::CompressionFailed(format!("Decompression error: {}", e)))?;
    Ok((frame, consumed))
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new(FrameCodec::Gzip, CompressionLevel::Balanced)
    }
}

fn frame_error(e: std::io::Error) -> ArchiveError {
    ArchiveError::CompressionFailed(format!("Compression error: {}", e))
}

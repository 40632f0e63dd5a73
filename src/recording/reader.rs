// src/recording/reader.rs
//! Shard reader
//!
//! Decompresses shard files and splits them back into WARC records.

use crate::recording::compressor::{CompressionLevel, Compressor, FrameCodec};
use crate::utils::errors::{ArchiveError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One parsed WARC record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarcRecord {
    pub headers: Vec<(String, String)>,
    pub block: Vec<u8>,
}

impl WarcRecord {
    /// Header value by case-insensitive name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn record_type(&self) -> Option<&str> {
        self.header("WARC-Type")
    }

    pub fn target_uri(&self) -> Option<&str> {
        self.header("WARC-Target-URI")
    }
}

fn malformed(msg: impl Into<String>) -> ArchiveError {
    ArchiveError::MalformedRecord(msg.into())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Parse a decompressed shard into its records
pub fn parse_records(mut data: &[u8]) -> Result<Vec<WarcRecord>> {
    let mut records = Vec::new();

    while !data.is_empty() {
        data = data
            .strip_prefix(b"WARC/1.0\r\n")
            .ok_or_else(|| malformed("missing WARC/1.0 version line"))?;

        let end = find(data, b"\r\n\r\n").ok_or_else(|| malformed("unterminated header"))?;
        let head = std::str::from_utf8(&data[..end])
            .map_err(|_| malformed("header is not UTF-8"))?;

        let mut headers = Vec::new();
        for line in head.split("\r\n") {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| malformed(format!("bad header line {:?}", line)))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        let record_len: usize = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("Content-Length"))
            .and_then(|(_, v)| v.parse().ok())
            .ok_or_else(|| malformed("missing Content-Length"))?;

        data = &data[end + 4..];
        record_len
            .checked_add(4)
            .filter(|needed| *needed <= data.len())
            .ok_or_else(|| malformed("record block is cut short"))?;
        let block = data[..record_len].to_vec();
        data = data[record_len..]
            .strip_prefix(b"\r\n\r\n")
            .ok_or_else(|| malformed("missing record terminator"))?;

        records.push(WarcRecord { headers, block });
    }

    Ok(records)
}

/// Frame codec implied by a shard file name
pub fn codec_for(path: &Path) -> FrameCodec {
    match path.extension().and_then(|e| e.to_str()) {
        Some("zst") => FrameCodec::Zstd,
        _ => FrameCodec::Gzip,
    }
}

/// Read every record of one shard file.
///
/// A damaged frame ends the read: the records of the frames before it are
/// returned and the rest of the file is skipped with a warning.
pub async fn read_shard(path: &Path) -> Result<Vec<WarcRecord>> {
    let data = tokio::fs::read(path)
        .await
        .map_err(|e| ArchiveError::StorageFailed(format!("Failed to read {:?}: {}", path, e)))?;

    let compressor = Compressor::new(codec_for(path), CompressionLevel::Balanced);
    let decoded = compressor.decompress_frames(&data);

    let mut records = Vec::new();
    for (index, frame) in decoded.frames.iter().enumerate() {
        match parse_records(frame) {
            Ok(parsed) => records.extend(parsed),
            Err(e) => {
                warn!(
                    "{:?}: skipping rest of shard, bad record in frame {}: {}",
                    path, index, e
                );
                return Ok(records);
            }
        }
    }

    if let Some(damage) = decoded.damage {
        warn!(
            "{:?}: skipping rest of shard, damaged frame at offset {}: {}",
            path, damage.offset, damage.error
        );
    }
    debug!("Read {} records from {:?}", records.len(), path);
    Ok(records)
}

/// Shard files in `dir`, sorted by name
pub async fn shard_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| ArchiveError::StorageFailed(format!("Failed to list {:?}: {}", dir, e)))?;

    let mut paths = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ArchiveError::StorageFailed(e.to_string()))?
    {
        let path = entry.path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if name.ends_with(".warc.gz") || name.ends_with(".warc.zst") {
            paths.push(path);
        }
    }

    paths.sort();
    Ok(paths)
}

/// Read the records of every shard in `dir`
pub async fn read_archive_dir(dir: &Path) -> Result<Vec<WarcRecord>> {
    let mut records = Vec::new();
    for path in shard_files(dir).await? {
        records.extend(read_shard(&path).await?);
    }
    Ok(records)
}

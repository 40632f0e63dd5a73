// src/recording/shard_pool.rs
//! Shard writer pool
//!
//! A fixed set of workers, each owning one shard file, drains a single
//! bounded queue of encoded records. Any idle worker takes the next record,
//! so there is no ordering across shards.
//!
//! # Architecture
//!
//! ```text
//! encode tasks ──► bounded queue (10) ──┬─► worker 0 ──► prox-00000.warc.gz
//!                                       ├─► worker 1 ──► prox-00001.warc.gz
//!                                       └─► ...
//! ```
//!
//! Each record is written as its own compressed frame, finished before the
//! next one starts, so a shard is a valid archive after every write.

use crate::recording::compressor::Compressor;
use crate::utils::config::ArchiverConfig;
use crate::utils::errors::{ArchiveError, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Shared receiving end of the record queue
type SharedQueue = Arc<Mutex<mpsc::Receiver<Vec<u8>>>>;

/// Final state of one shard
#[derive(Debug, Clone)]
pub struct ShardOutcome {
    pub ordinal: usize,
    pub path: PathBuf,
    pub records_written: u64,
    pub bytes_written: u64,

    /// Open or close failure, if any
    pub error: Option<String>,
}

/// Count of workers currently mid-write. Diagnostic only.
#[derive(Debug, Default)]
pub struct BusyGauge {
    busy: AtomicUsize,
}

impl BusyGauge {
    fn enter(&self) {
        let busy = self.busy.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!("warc_shard_writers_busy").set(busy as f64);
        debug!("busy writers: {}", busy);
    }

    fn exit(&self) {
        let busy = self.busy.fetch_sub(1, Ordering::Relaxed) - 1;
        metrics::gauge!("warc_shard_writers_busy").set(busy as f64);
        debug!("busy writers: {}", busy);
    }

    pub fn current(&self) -> usize {
        self.busy.load(Ordering::Relaxed)
    }
}

/// Byte sink backing one shard
///
/// Writes must land at the end of the sink. `rollback` cuts the sink back to
/// an earlier length so a half-written frame never stays in the shard.
pub trait ShardSink: Write + Send + 'static {
    /// Current length of the shard
    fn position(&mut self) -> io::Result<u64>;

    fn rollback(&mut self, len: u64) -> io::Result<()>;

    /// Flush to stable storage and release the sink
    fn close(self) -> io::Result<()>;
}

impl ShardSink for File {
    fn position(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn rollback(&mut self, len: u64) -> io::Result<()> {
        // Append mode: the next write goes to the new end.
        self.set_len(len)
    }

    fn close(self) -> io::Result<()> {
        self.sync_all()
    }
}

/// Open (or create) a shard file for appending
fn open_shard_file(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Pool of shard writers
pub struct ShardWriterPool {
    shard_count: usize,
    outcomes: Mutex<mpsc::Receiver<ShardOutcome>>,
    busy: Arc<BusyGauge>,
}

impl ShardWriterPool {
    /// Spawn one worker per shard file, all pulling from `queue`.
    ///
    /// Workers run until every sender of `queue` is dropped and the queue
    /// is drained.
    pub fn start(config: &ArchiverConfig, queue: mpsc::Receiver<Vec<u8>>) -> Self {
        Self::start_with(config, queue, open_shard_file)
    }

    /// Like [`start`](Self::start), with shards opened by `open`
    pub fn start_with<S, F>(config: &ArchiverConfig, queue: mpsc::Receiver<Vec<u8>>, open: F) -> Self
    where
        S: ShardSink,
        F: Fn(&Path) -> io::Result<S> + Send + Sync + 'static,
    {
        info!(
            "Starting {} shard writers in {:?}",
            config.shard_count, config.archive_dir
        );

        let queue: SharedQueue = Arc::new(Mutex::new(queue));
        let (outcome_tx, outcome_rx) = mpsc::channel(config.shard_count);
        let busy = Arc::new(BusyGauge::default());
        let compressor = Compressor::new(config.codec, config.compression_level);
        let open = Arc::new(open);

        for ordinal in 0..config.shard_count {
            let worker = ShardWorker {
                ordinal,
                path: config.shard_path(ordinal),
                compressor,
                queue: Arc::clone(&queue),
                busy: Arc::clone(&busy),
                outcomes: outcome_tx.clone(),
            };
            tokio::spawn(worker.run(Arc::clone(&open)));
        }

        Self {
            shard_count: config.shard_count,
            outcomes: Mutex::new(outcome_rx),
            busy,
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    pub fn busy(&self) -> usize {
        self.busy.current()
    }

    /// Wait until every worker has closed its shard.
    ///
    /// Only completes once the queue is closed. Outcomes are sorted by
    /// ordinal; a worker that died without reporting is listed with an error.
    pub async fn join(&self) -> Vec<ShardOutcome> {
        let mut outcomes = Vec::with_capacity(self.shard_count);
        let mut rx = self.outcomes.lock().await;

        while outcomes.len() < self.shard_count {
            match rx.recv().await {
                Some(outcome) => outcomes.push(outcome),
                None => break,
            }
        }

        for ordinal in 0..self.shard_count {
            if !outcomes.iter().any(|o| o.ordinal == ordinal) {
                outcomes.push(ShardOutcome {
                    ordinal,
                    path: PathBuf::new(),
                    records_written: 0,
                    bytes_written: 0,
                    error: Some("writer exited without reporting".to_string()),
                });
            }
        }

        outcomes.sort_by_key(|o| o.ordinal);
        outcomes
    }
}

struct ShardWorker {
    ordinal: usize,
    path: PathBuf,
    compressor: Compressor,
    queue: SharedQueue,
    busy: Arc<BusyGauge>,
    outcomes: mpsc::Sender<ShardOutcome>,
}

impl ShardWorker {
    async fn run<S, F>(self, open: Arc<F>)
    where
        S: ShardSink,
        F: Fn(&Path) -> io::Result<S> + Send + Sync + 'static,
    {
        let path = self.path.clone();
        let opened = tokio::task::spawn_blocking(move || (*open)(&path))
            .await
            .map_err(|e| e.to_string())
            .and_then(|result| result.map_err(|e| e.to_string()));

        let mut shard = match opened {
            Ok(sink) => {
                debug!("Opened shard {} at {:?}", self.ordinal, self.path);
                ShardFile::new(self.ordinal, sink, self.compressor)
            }
            Err(e) => {
                let e = ArchiveError::StorageFailed(format!(
                    "Failed to open {:?}: {}",
                    self.path, e
                ));
                error!("Shard {} disabled: {}", self.ordinal, e);
                self.report(0, 0, Some(e.to_string())).await;
                return;
            }
        };

        loop {
            // Only one idle worker waits on the queue at a time.
            let next = { self.queue.lock().await.recv().await };
            let Some(record) = next else { break };

            self.busy.enter();
            let written = tokio::task::spawn_blocking(move || {
                let result = shard.append(&record);
                (shard, result)
            })
            .await;
            self.busy.exit();

            match written {
                Ok((returned, result)) => {
                    shard = returned;
                    if let Err(e) = result {
                        warn!("Shard {}: can't write record: {}", self.ordinal, e);
                        metrics::counter!("warc_record_write_errors_total").increment(1);
                    }
                }
                Err(e) => {
                    error!("Shard {} writer panicked: {}", self.ordinal, e);
                    self.report(0, 0, Some(e.to_string())).await;
                    return;
                }
            }
        }

        let (records, bytes) = (shard.records_written, shard.bytes_written);
        let closed = tokio::task::spawn_blocking(move || shard.close())
            .await
            .map_err(|e| ArchiveError::StorageFailed(e.to_string()))
            .and_then(|result| result);

        let error = match closed {
            Ok(()) => {
                debug!("Shard {} closed after {} records", self.ordinal, records);
                None
            }
            Err(e) => {
                error!("Shard {} failed to close: {}", self.ordinal, e);
                Some(e.to_string())
            }
        };
        self.report(records, bytes, error).await;
    }

    async fn report(&self, records_written: u64, bytes_written: u64, error: Option<String>) {
        let outcome = ShardOutcome {
            ordinal: self.ordinal,
            path: self.path.clone(),
            records_written,
            bytes_written,
            error,
        };
        if self.outcomes.send(outcome).await.is_err() {
            debug!("Shard {} outcome dropped, pool is gone", self.ordinal);
        }
    }
}

/// One open shard
struct ShardFile<S> {
    ordinal: usize,
    sink: S,
    compressor: Compressor,
    records_written: u64,
    bytes_written: u64,
}

impl<S: ShardSink> ShardFile<S> {
    fn new(ordinal: usize, sink: S, compressor: Compressor) -> Self {
        Self {
            ordinal,
            sink,
            compressor,
            records_written: 0,
            bytes_written: 0,
        }
    }

    /// Append `record` as one finished frame.
    ///
    /// On failure the partial frame is cut off again, so the shard still
    /// ends on a frame boundary.
    fn append(&mut self, record: &[u8]) -> Result<()> {
        let before = self
            .sink
            .position()
            .map_err(|e| ArchiveError::WriteFailed(e.to_string()))?;

        let mut counted = CountingWriter {
            inner: &mut self.sink,
            written: 0,
        };
        let result = self
            .compressor
            .write_frame(&mut counted, record)
            .and_then(|()| {
                counted
                    .flush()
                    .map_err(|e| ArchiveError::WriteFailed(e.to_string()))
            });
        let written = counted.written;

        if let Err(e) = result {
            match self.sink.rollback(before) {
                Ok(()) => warn!(
                    "Shard {}: rolled back {} bytes of partial frame at offset {}",
                    self.ordinal, written, before
                ),
                Err(re) => error!(
                    "Shard {}: can't roll back partial frame at offset {}: {}",
                    self.ordinal, before, re
                ),
            }
            return Err(e);
        }

        self.bytes_written += written;
        self.records_written += 1;
        metrics::counter!("warc_bytes_written_total").increment(written);
        metrics::counter!("warc_records_written_total").increment(1);
        debug!(
            "Shard {}: record {} appended ({} bytes)",
            self.ordinal, self.records_written, written
        );
        Ok(())
    }

    fn close(self) -> Result<()> {
        self.sink.close().map_err(|e| {
            ArchiveError::StorageFailed(format!("Failed to close shard {}: {}", self.ordinal, e))
        })
    }
}

struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(dir: &Path, shards: usize) -> ArchiverConfig {
        ArchiverConfig::new(dir, shards)
    }

    #[derive(Default)]
    struct MemoryState {
        buf: Vec<u8>,
        fail_at: Option<usize>,
        gate_closed: bool,
    }

    /// In-memory shard. Fails once when `fail_at` is reached and blocks
    /// writes while the gate is closed.
    #[derive(Clone, Default)]
    struct MemorySink {
        state: Arc<(std::sync::Mutex<MemoryState>, std::sync::Condvar)>,
    }

    impl MemorySink {
        fn fail_after(&self, bytes: usize) {
            let mut state = self.state.0.lock().unwrap();
            state.fail_at = Some(state.buf.len() + bytes);
        }

        fn close_gate(&self) {
            self.state.0.lock().unwrap().gate_closed = true;
        }

        fn open_gate(&self) {
            self.state.0.lock().unwrap().gate_closed = false;
            self.state.1.notify_all();
        }

        fn contents(&self) -> Vec<u8> {
            self.state.0.lock().unwrap().buf.clone()
        }
    }

    impl Write for MemorySink {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            let (lock, gate) = &*self.state;
            let mut state = lock.lock().unwrap();
            while state.gate_closed {
                state = gate.wait(state).unwrap();
            }

            let mut n = data.len();
            if let Some(limit) = state.fail_at {
                if state.buf.len() >= limit {
                    state.fail_at = None;
                    return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
                }
                n = n.min(limit - state.buf.len());
            }
            state.buf.extend_from_slice(&data[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl ShardSink for MemorySink {
        fn position(&mut self) -> io::Result<u64> {
            Ok(self.state.0.lock().unwrap().buf.len() as u64)
        }

        fn rollback(&mut self, len: u64) -> io::Result<()> {
            self.state.0.lock().unwrap().buf.truncate(len as usize);
            Ok(())
        }

        fn close(self) -> io::Result<()> {
            Ok(())
        }
    }

    async fn wait_until_busy(pool: &ShardWriterPool, n: usize) {
        let wait = async {
            while pool.busy() != n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("writer never became busy");
    }

    #[test]
    fn test_failed_append_leaves_frame_boundary() {
        let sink = MemorySink::default();
        let mut shard = ShardFile::new(0, sink.clone(), Compressor::default());

        shard.append(b"first record").unwrap();
        sink.fail_after(10);
        assert!(shard.append(b"second record").is_err());
        shard.append(b"third record").unwrap();

        assert_eq!(shard.records_written, 2);
        assert_eq!(shard.bytes_written, sink.contents().len() as u64);

        let text = Compressor::default().decompress(&sink.contents()).unwrap();
        assert_eq!(text, b"first recordthird record");
    }

    #[tokio::test]
    async fn test_worker_keeps_writing_after_failed_record() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), 1);
        let sink = MemorySink::default();
        sink.fail_after(5);

        let (tx, rx) = mpsc::channel(cfg.queue_capacity);
        let opener = sink.clone();
        let pool = ShardWriterPool::start_with(&cfg, rx, move |_| Ok(opener.clone()));
        for record in ["lost", "kept 1", "kept 2"] {
            tx.send(record.as_bytes().to_vec()).await.unwrap();
        }
        drop(tx);

        let outcomes = pool.join().await;
        assert!(outcomes[0].error.is_none());
        assert_eq!(outcomes[0].records_written, 2);

        let text = Compressor::default().decompress(&sink.contents()).unwrap();
        assert_eq!(text, b"kept 1kept 2");
    }

    #[tokio::test]
    async fn test_slow_writer_suspends_sender() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), 1);
        cfg.queue_capacity = 1;
        let sink = MemorySink::default();
        sink.close_gate();

        let (tx, rx) = mpsc::channel(cfg.queue_capacity);
        let opener = sink.clone();
        let pool = ShardWriterPool::start_with(&cfg, rx, move |_| Ok(opener.clone()));

        // The only writer is stuck on the first record, the second fills the queue.
        tx.send(b"one".to_vec()).await.unwrap();
        wait_until_busy(&pool, 1).await;
        tx.send(b"two".to_vec()).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), tx.send(b"three".to_vec())).await;
        assert!(blocked.is_err());

        sink.open_gate();
        tokio::time::timeout(Duration::from_secs(5), tx.send(b"three".to_vec()))
            .await
            .expect("send stayed suspended")
            .unwrap();
        drop(tx);

        let outcomes = pool.join().await;
        assert_eq!(outcomes[0].records_written, 3);
        let text = Compressor::default().decompress(&sink.contents()).unwrap();
        assert_eq!(text, b"onetwothree");
    }

    #[tokio::test]
    async fn test_pool_writes_and_closes_every_shard() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), 3);
        let (tx, rx) = mpsc::channel(cfg.queue_capacity);

        let pool = ShardWriterPool::start(&cfg, rx);
        for i in 0..7 {
            tx.send(format!("record {}", i).into_bytes()).await.unwrap();
        }
        drop(tx);

        let outcomes = pool.join().await;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| o.error.is_none()));
        assert_eq!(outcomes.iter().map(|o| o.records_written).sum::<u64>(), 7);
        assert_eq!(pool.busy(), 0);

        let compressor = Compressor::default();
        let mut total = 0;
        for ordinal in 0..3 {
            let data = std::fs::read(cfg.shard_path(ordinal)).unwrap();
            let text = String::from_utf8(compressor.decompress(&data).unwrap()).unwrap();
            total += text.matches("record ").count();
        }
        assert_eq!(total, 7);
    }

    #[tokio::test]
    async fn test_shards_are_appended_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), 1);

        for run in 0..2 {
            let (tx, rx) = mpsc::channel(1);
            let pool = ShardWriterPool::start(&cfg, rx);
            tx.send(format!("run {}", run).into_bytes()).await.unwrap();
            drop(tx);
            pool.join().await;
        }

        let data = std::fs::read(cfg.shard_path(0)).unwrap();
        let text = Compressor::default().decompress(&data).unwrap();
        assert_eq!(text, b"run 0run 1");
    }

    #[tokio::test]
    async fn test_open_failure_disables_shard() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir.path().join("missing"), 2);
        let (tx, rx) = mpsc::channel(1);

        let pool = ShardWriterPool::start(&cfg, rx);
        let outcomes = pool.join().await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.error.is_some()));

        // Nobody is left to receive.
        let closed = tokio::time::timeout(Duration::from_secs(5), tx.closed()).await;
        assert!(closed.is_ok());
    }

    #[tokio::test]
    async fn test_full_queue_suspends_sender() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), 1);
        let (tx, rx) = mpsc::channel(2);

        tx.send(b"a".to_vec()).await.unwrap();
        tx.send(b"b".to_vec()).await.unwrap();

        // No writer yet: the third send waits instead of failing.
        let blocked = tokio::time::timeout(Duration::from_millis(50), tx.send(b"c".to_vec())).await;
        assert!(blocked.is_err());

        let pool = ShardWriterPool::start(&cfg, rx);
        tx.send(b"c".to_vec()).await.unwrap();
        drop(tx);

        let outcomes = pool.join().await;
        assert_eq!(outcomes[0].records_written, 3);
    }
}

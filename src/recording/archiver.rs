// src/recording/archiver.rs
//! Archiver facade
//!
//! Entry point for the proxying side. Notifications return immediately: the
//! capture event is encoded on its own task and the resulting record goes
//! through the bounded queue to the shard writers. The queue is the only
//! backpressure point, and it is internal to the archiver.

use crate::recording::encoder::RecordEncoder;
use crate::recording::event::{CaptureEvent, ExchangeContext, RequestHead, ResponseHead};
use crate::recording::shard_pool::{ShardOutcome, ShardWriterPool};
use crate::recording::tee::{tee, TeeBody};
use crate::utils::config::ArchiverConfig;
use crate::utils::errors::{ArchiveError, Result};
use hyper::body::Body;
use hyper::{Request, Response, Uri};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, OnceCell};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Archiver counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiverStats {
    pub events_accepted: u64,
    pub records_enqueued: u64,
    pub records_suppressed: u64,
    pub encode_failures: u64,
    pub events_dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    events_accepted: AtomicU64,
    records_enqueued: AtomicU64,
    records_suppressed: AtomicU64,
    encode_failures: AtomicU64,
    events_dropped: AtomicU64,
}

/// Result of [`Archiver::shutdown`]
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    pub shards: Vec<ShardOutcome>,
    pub stats: ArchiverStats,
}

impl ShutdownReport {
    pub fn records_written(&self) -> u64 {
        self.shards.iter().map(|s| s.records_written).sum()
    }

    /// True when every shard opened and closed without error
    pub fn is_clean(&self) -> bool {
        self.shards.iter().all(|s| s.error.is_none())
    }

    pub fn errors(&self) -> impl Iterator<Item = (usize, &str)> {
        self.shards
            .iter()
            .filter_map(|s| s.error.as_deref().map(|e| (s.ordinal, e)))
    }
}

/// Asynchronous WARC archiver
pub struct Archiver {
    config: ArchiverConfig,
    encoder: Arc<RecordEncoder>,
    queue: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    tasks: TaskTracker,
    pool: ShardWriterPool,
    counters: Arc<Counters>,
    report: OnceCell<ShutdownReport>,
}

impl Archiver {
    /// Create the archive directory if needed and start the shard writers
    pub async fn new(config: ArchiverConfig) -> Result<Self> {
        config.validate()?;
        info!("Initializing archiver at {:?}", config.archive_dir);

        tokio::fs::create_dir_all(&config.archive_dir)
            .await
            .map_err(|e| {
                ArchiveError::StorageFailed(format!("Failed to create directory: {}", e))
            })?;

        let metadata = tokio::fs::metadata(&config.archive_dir)
            .await
            .map_err(|e| ArchiveError::StorageFailed(format!("Failed to open directory: {}", e)))?;
        if !metadata.is_dir() {
            return Err(ArchiveError::StorageFailed(format!(
                "{:?} is not a directory",
                config.archive_dir
            )));
        }

        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let pool = ShardWriterPool::start(&config, rx);

        Ok(Self {
            encoder: Arc::new(RecordEncoder::from_config(&config)),
            config,
            queue: Mutex::new(Some(tx)),
            tasks: TaskTracker::new(),
            pool,
            counters: Arc::new(Counters::default()),
            report: OnceCell::new(),
        })
    }

    pub fn config(&self) -> &ArchiverConfig {
        &self.config
    }

    /// Archive a request. A missing request is archived as an empty
    /// placeholder.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn notify_request<B>(&self, req: Option<&Request<B>>, ctx: ExchangeContext) {
        let head = req
            .map(RequestHead::from_request)
            .unwrap_or_else(RequestHead::placeholder);
        self.dispatch(CaptureEvent::request(head, ctx));
    }

    /// Archive a response.
    ///
    /// The returned response carries a teed body and must be forwarded to the
    /// client in place of `resp`.
    pub fn notify_response<B>(
        &self,
        resp: Response<B>,
        request_uri: Uri,
        ctx: ExchangeContext,
    ) -> Response<TeeBody<B>>
    where
        B: Body,
    {
        let head = ResponseHead::from_response(&resp, request_uri);
        let (parts, body) = resp.into_parts();
        let (teed, receiver) = tee(body);

        self.dispatch(CaptureEvent::response(head, Some(receiver), ctx));
        Response::from_parts(parts, teed)
    }

    fn dispatch(&self, event: CaptureEvent) {
        let sender = match self.queue.lock() {
            Ok(queue) => queue.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let Some(sender) = sender else {
            debug!(session = event.session, "Archiver shut down, dropping event");
            self.counters.events_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        self.counters.events_accepted.fetch_add(1, Ordering::Relaxed);
        let encoder = Arc::clone(&self.encoder);
        let counters = Arc::clone(&self.counters);

        self.tasks.spawn(async move {
            let session = event.session;
            match encoder.encode(event).await {
                Ok(Some(record)) => {
                    if sender.send(record).await.is_ok() {
                        counters.records_enqueued.fetch_add(1, Ordering::Relaxed);
                    } else {
                        warn!(session, "No shard writer left, record dropped");
                        counters.events_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Ok(None) => {
                    counters.records_suppressed.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("warc_records_suppressed_total").increment(1);
                }
                Err(e) => {
                    error!(session, "Can't encode record: {}", e);
                    counters.encode_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        });
    }

    /// Number of shard writers currently mid-write
    pub fn busy_writers(&self) -> usize {
        self.pool.busy()
    }

    pub fn stats(&self) -> ArchiverStats {
        ArchiverStats {
            events_accepted: self.counters.events_accepted.load(Ordering::Relaxed),
            records_enqueued: self.counters.records_enqueued.load(Ordering::Relaxed),
            records_suppressed: self.counters.records_suppressed.load(Ordering::Relaxed),
            encode_failures: self.counters.encode_failures.load(Ordering::Relaxed),
            events_dropped: self.counters.events_dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting events, flush everything accepted so far and close
    /// every shard.
    ///
    /// Safe to call more than once; later calls return the first report.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.report
            .get_or_init(|| self.shutdown_inner())
            .await
            .clone()
    }

    async fn shutdown_inner(&self) -> ShutdownReport {
        info!("Shutting down archiver");

        // New events are refused from here on.
        let sender = match self.queue.lock() {
            Ok(mut queue) => queue.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        // Encode tasks hold their own senders; the queue closes once the
        // last of them has enqueued.
        self.tasks.close();
        self.tasks.wait().await;
        drop(sender);

        let shards = self.pool.join().await;
        let report = ShutdownReport {
            shards,
            stats: self.stats(),
        };

        for (ordinal, e) in report.errors() {
            error!("Shard {} finished with error: {}", ordinal, e);
        }
        info!(
            "Archiver stopped: {} records in {} shards",
            report.records_written(),
            self.pool.shard_count()
        );

        report
    }
}

//! Storage Orchestrator (C8): ties WAL append → cache → upload → trim together, with a backoff
//! queue for when the WAL or cache is full and a force-upload path for shutdown/per-stream drains
//! (spec §4.8).
//!
//! Grounded on the teacher's `AsyncStorageLoop::run` executor-selection idiom
//! (`tokio::select!`, `biased`, `storage/async_storage.rs`), generalized here from one executor
//! driving one `Scheduler` to the four executors named in spec §5: this struct plays the role the
//! teacher's `AsyncStorage` handle plays (a cheap, cloneable façade), while the backoff drain and
//! completion-waiter tasks it spawns play the role of `AsyncStorageLoop`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};

use crate::cache::{LogCache, LogCacheConfig};
use crate::codec;
use crate::config::WalConfig;
use crate::error::{Error, Result};
use crate::io::{FileExt, Io};
use crate::metadata::MetadataClient;
use crate::metrics::{BackoffReason, Metrics};
use crate::model::{CacheBlock, StreamId, StreamRecordBatch};
use crate::object_store::ObjectStoreClient;
use crate::sequencer::CallbackSequencer;
use crate::upload::{self, UploadPipelineConfig, UploadPipelineHandle};
use crate::wal::BlockWalService;

/// Which stream(s) a `force_upload` call should seal and flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceUploadTarget {
    All,
    Stream(StreamId),
}

struct BackoffItem {
    batch: StreamRecordBatch,
    completion: oneshot::Sender<Result<u64>>,
}

struct Backoff {
    queue: Mutex<VecDeque<BackoffItem>>,
}

impl Backoff {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    fn push_back(&self, item: BackoffItem) {
        self.queue.lock().push_back(item);
    }

    fn push_front(&self, item: BackoffItem) {
        self.queue.lock().push_front(item);
    }

    fn pop_front(&self) -> Option<BackoffItem> {
        self.queue.lock().pop_front()
    }
}

/// Tracks pipeline uploads that have been enqueued but not yet committed, so `force_upload` can
/// await a quiescent pipeline without the orchestrator depending on the pipeline's internals
/// (spec §4.8 "await inflight uploads").
struct InflightUploads {
    count: AtomicUsize,
    drained: Notify,
}

impl InflightUploads {
    fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    fn increment(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    async fn drain(&self) {
        while self.count.load(Ordering::SeqCst) > 0 {
            self.drained.notified().await;
        }
    }
}

pub struct StorageOrchestrator<F, IO> {
    wal: Arc<BlockWalService<F, IO>>,
    cache: Arc<LogCache>,
    sequencer: Arc<CallbackSequencer>,
    pipeline: UploadPipelineHandle,
    metrics: Arc<Metrics>,
    backoff: Arc<Backoff>,
    inflight: Arc<InflightUploads>,
    max_wal_cache_size: u64,
}

impl<F, IO> StorageOrchestrator<F, IO>
where
    F: FileExt,
    IO: Io<File = F> + Clone + 'static,
{
    pub fn new(
        wal: Arc<BlockWalService<F, IO>>,
        cache: Arc<LogCache>,
        sequencer: Arc<CallbackSequencer>,
        pipeline: UploadPipelineHandle,
        metrics: Arc<Metrics>,
        config: &WalConfig,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            wal,
            cache,
            sequencer,
            pipeline,
            metrics,
            backoff: Arc::new(Backoff::new()),
            inflight: Arc::new(InflightUploads::new()),
            max_wal_cache_size: config.wal_cache_size,
        });
        this.clone().spawn_backoff_drain(config.backoff_drain_interval());
        this
    }

    /// Starts the full durability core: opens and recovers the WAL, validates the recovered head
    /// of every opening stream against the metadata service (spec §4.5 "Gap semantics" — a
    /// detected gap here is `Error::DataLoss`, not a recoverable condition), resets the window,
    /// and wires the log cache, callback sequencer, and upload pipeline around it.
    pub async fn start<M, O>(
        io: IO,
        config: WalConfig,
        metadata: Arc<M>,
        object_store: Arc<O>,
        metrics: Arc<Metrics>,
        upload_config: UploadPipelineConfig,
    ) -> Result<Arc<Self>>
    where
        M: MetadataClient,
        O: ObjectStoreClient,
    {
        let wal = BlockWalService::start(io, config.clone()).await?;
        wal.validate_recovery_against_metadata(metadata.as_ref()).await?;
        wal.reset().await?;
        let wal = Arc::new(wal);

        let cache = Arc::new(LogCache::new(LogCacheConfig {
            block_size_limit: config.wal_object_size,
            max_streams_per_block: config.max_streams_per_block,
        }));
        let sequencer = Arc::new(CallbackSequencer::new(wal.confirm_offset()));
        let pipeline = upload::spawn(metadata, object_store, metrics.clone(), upload_config);

        Ok(Self::new(wal, cache, sequencer, pipeline, metrics, &config))
    }

    fn spawn_backoff_drain(self: Arc<Self>, interval: std::time::Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.drain_backoff_once().await;
            }
        });
    }

    /// Re-attempts each backoff item in submission order, stopping at the first that still
    /// backoffs (spec §4.8 "re-attempts each backoff item in order, stopping at the first that
    /// still backoffs" — preserves P7 fairness).
    async fn drain_backoff_once(&self) {
        loop {
            let Some(item) = self.backoff.pop_front() else {
                break;
            };
            if self.cache.size() >= self.max_wal_cache_size {
                self.backoff.push_front(item);
                break;
            }
            match self.try_dispatch(item.batch.clone()).await {
                Ok(outcome) => {
                    self.spawn_completion_waiter(outcome, item.completion);
                }
                Err(Error::OverCapacity) => {
                    self.backoff.push_front(BackoffItem {
                        batch: item.batch,
                        completion: item.completion,
                    });
                    break;
                }
                Err(e) => {
                    let _ = item.completion.send(Err(e));
                }
            }
        }
    }

    /// Appends one record batch. Never blocks: returns immediately with a future that resolves
    /// once the record is durable (or the attempt definitively failed). Mirrors spec §4.8's
    /// append flow exactly.
    pub async fn append(&self, batch: StreamRecordBatch) -> oneshot::Receiver<Result<u64>> {
        let (tx, rx) = oneshot::channel();

        if !self.backoff.is_empty() {
            self.backoff.push_back(BackoffItem {
                batch,
                completion: tx,
            });
            return rx;
        }

        if self.cache.size() >= self.max_wal_cache_size {
            self.metrics.record_backoff(BackoffReason::CacheFull);
            self.backoff.push_back(BackoffItem {
                batch,
                completion: tx,
            });
            return rx;
        }

        match self.try_dispatch(batch.clone()).await {
            Ok(outcome) => self.spawn_completion_waiter(outcome, tx),
            Err(Error::OverCapacity) => {
                self.metrics.record_backoff(BackoffReason::OverCapacity);
                self.force_upload_spawn(ForceUploadTarget::All);
                self.backoff.push_back(BackoffItem {
                    batch,
                    completion: tx,
                });
            }
            Err(e) => {
                let _ = tx.send(Err(e));
            }
        }

        rx
    }

    async fn try_dispatch(&self, batch: StreamRecordBatch) -> Result<DispatchOutcome> {
        let payload_len = batch.payload.len() as u64;
        let (offset, wal_rx) = self.wal.append(batch.clone()).await?;
        self.metrics.record_append(payload_len);
        let end_offset = offset + codec::HEADER_SIZE + payload_len;
        self.sequencer.before(offset, end_offset, batch);
        Ok(DispatchOutcome { offset, wal_rx })
    }

    fn spawn_completion_waiter(
        &self,
        outcome: DispatchOutcome,
        completion: oneshot::Sender<Result<u64>>,
    ) {
        let DispatchOutcome { offset, wal_rx } = outcome;
        let cache = self.cache.clone();
        let sequencer = self.sequencer.clone();
        let pipeline = self.pipeline.clone();
        let wal = self.wal.clone();
        let inflight = self.inflight.clone();

        tokio::spawn(async move {
            let result = match wal_rx.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(Error::NotReady),
            };

            match result {
                Ok(()) => {
                    let (_confirm, ready) = sequencer.after(offset);
                    for record in ready {
                        deliver_to_cache(&cache, &sequencer, &pipeline, &wal, &inflight, record)
                            .await;
                    }
                    let _ = completion.send(Ok(offset));
                }
                Err(e) => {
                    let _ = completion.send(Err(e));
                }
            }
        });
    }

    /// Awaits all in-flight uploads, seals the current cache block (if it holds anything relevant
    /// to `target`), and awaits that block's own commit — the synchronous-looking call the spec
    /// allows at the orchestrator layer for shutdown and explicit stream drains (spec §4.8).
    pub async fn force_upload(&self, target: ForceUploadTarget) -> Result<()> {
        self.inflight.drain().await;
        self.cache.set_confirm_offset(self.sequencer.wal_confirm_offset());

        let sealed = match target {
            ForceUploadTarget::All => {
                let block = self.cache.archive_current_block();
                if block.is_empty() {
                    None
                } else {
                    Some(block)
                }
            }
            ForceUploadTarget::Stream(id) => self.cache.archive_current_block_if_contains(id),
        };

        let Some(block) = sealed else {
            return Ok(());
        };
        let sealed_confirm_offset = block.confirm_offset;

        self.inflight.increment();
        let rx = self.pipeline.enqueue(block);
        let outcome = match rx.await {
            Ok(inner) => inner,
            Err(_) => Err(Error::UploadCommitFailed("pipeline dropped".into())),
        };
        self.inflight.decrement();
        let committed = outcome?;

        if let Some(confirm_offset) = committed.confirm_offset {
            let _ = self.wal.trim(confirm_offset).await;
        }
        self.cache.mark_free(&CacheBlock {
            confirm_offset: sealed_confirm_offset,
            ..Default::default()
        });
        Ok(())
    }

    /// Fire-and-forget variant used from `append`'s `OverCapacity` branch: the caller is about to
    /// enqueue into the backoff queue regardless of how long this takes.
    fn force_upload_spawn(&self, target: ForceUploadTarget) {
        let cache = self.cache.clone();
        let sequencer = self.sequencer.clone();
        let pipeline = self.pipeline.clone();
        let wal = self.wal.clone();
        let inflight = self.inflight.clone();
        tokio::spawn(async move {
            inflight.drain().await;
            cache.set_confirm_offset(sequencer.wal_confirm_offset());
            let sealed = match target {
                ForceUploadTarget::All => {
                    let block = cache.archive_current_block();
                    (!block.is_empty()).then_some(block)
                }
                ForceUploadTarget::Stream(id) => cache.archive_current_block_if_contains(id),
            };
            if let Some(block) = sealed {
                let sealed_confirm_offset = block.confirm_offset;
                inflight.increment();
                if let Ok(Ok(committed)) = pipeline.enqueue(block).await {
                    inflight.decrement();
                    if let Some(confirm_offset) = committed.confirm_offset {
                        let _ = wal.trim(confirm_offset).await;
                    }
                    cache.mark_free(&CacheBlock {
                        confirm_offset: sealed_confirm_offset,
                        ..Default::default()
                    });
                } else {
                    inflight.decrement();
                }
            }
        });
    }

    pub async fn shutdown_gracefully(&self) -> bool {
        let _ = self.force_upload(ForceUploadTarget::All).await;
        self.wal.shutdown_gracefully().await
    }

    pub fn cache(&self) -> &LogCache {
        &self.cache
    }

    pub fn wal(&self) -> &BlockWalService<F, IO> {
        &self.wal
    }
}

struct DispatchOutcome {
    offset: u64,
    wal_rx: oneshot::Receiver<Result<()>>,
}

/// Delivers one sequencer-ready record to the cache, archiving and enqueuing a block for upload
/// if the put filled it (spec §4.8 step 5).
async fn deliver_to_cache<F, IO>(
    cache: &Arc<LogCache>,
    sequencer: &Arc<CallbackSequencer>,
    pipeline: &UploadPipelineHandle,
    wal: &Arc<BlockWalService<F, IO>>,
    inflight: &Arc<InflightUploads>,
    record: StreamRecordBatch,
) where
    F: FileExt,
    IO: Io<File = F> + Clone + 'static,
{
    let outcome = cache.put(record);
    if !outcome.became_full {
        return;
    }
    cache.set_confirm_offset(sequencer.wal_confirm_offset());
    let block = cache.archive_current_block();
    if block.is_empty() {
        return;
    }
    let sealed_confirm_offset = block.confirm_offset;

    inflight.increment();
    let rx = pipeline.enqueue(block);
    let wal = wal.clone();
    let cache = cache.clone();
    let inflight = inflight.clone();
    tokio::spawn(async move {
        if let Ok(Ok(committed)) = rx.await {
            if let Some(confirm_offset) = committed.confirm_offset {
                let _ = wal.trim(confirm_offset).await;
            }
            cache.mark_free(&CacheBlock {
                confirm_offset: sealed_confirm_offset,
                ..Default::default()
            });
        }
        inflight.decrement();
    });
}

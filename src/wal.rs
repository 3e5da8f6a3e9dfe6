//! Block WAL Service (C5): the public WAL facade — `start/recover/reset/append/trim/shutdown`
//! (spec §4.5). Owns the header, the block channel, and the sliding window.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::block_channel::BlockChannel;
use crate::codec;
use crate::config::WalConfig;
use crate::error::{Error, Result};
use crate::header::{HeaderSlots, ShutdownType, WalHeader};
use crate::io::{FileExt, Io};
use crate::metadata::MetadataClient;
use crate::model::{StreamId, StreamRecordBatch};
use crate::recovery::{RecoverResult, RecoveryIterator};
use crate::sliding_window::{HeaderCoordinator, RingGeometry, SlidingWindow};

/// Walks forward from `window_start_offset` (floored to a block boundary) validating records
/// until a full ring's worth of bytes has been examined, tracking the offset just past the last
/// *successfully* decoded record. Implements spec §4.5's "Recovery algorithm (ungraceful
/// shutdown)": the stop condition is `record_section_capacity` bytes scanned, not the header's own
/// (possibly stale) `window_next_write_offset`.
fn ungraceful_recovery_scan<F: FileExt>(
    channel: &BlockChannel<F>,
    geometry: RingGeometry,
    window_start_offset: u64,
) -> u64 {
    let start = window_start_offset - (window_start_offset % geometry.block_size);
    let mut it = RecoveryIterator::new(channel, geometry, start, u64::MAX);
    let mut last_good = start;
    while it.has_next() {
        match it.next() {
            Some(RecoverResult::Record { offset, header, .. }) => {
                last_good = offset + codec::HEADER_SIZE + header.body_length() as u64;
            }
            Some(RecoverResult::Skipped { .. }) => {}
            None => break,
        }
    }
    last_good
}

struct HeaderHandle<F, IO> {
    trim_offset: Arc<AtomicU64>,
    shutdown_type: Arc<AtomicU8>,
    header_slots: Arc<Mutex<HeaderSlots>>,
    channel: Arc<BlockChannel<F>>,
    io: IO,
    capacity: u64,
}

impl<F: FileExt, IO: Io<File = F> + Clone + 'static> HeaderCoordinator for HeaderHandle<F, IO> {
    fn try_grow_window(&self, current_max: u64, scale_unit: u64, upper_limit: u64) -> u64 {
        (current_max + scale_unit).min(upper_limit)
    }

    fn schedule_flush(&self, window_start_offset: u64, window_next_write_offset: u64, window_max_length: u64) {
        let trim_offset = self.trim_offset.load(Ordering::SeqCst);
        let shutdown_type = if self.shutdown_type.load(Ordering::SeqCst) == 0 {
            ShutdownType::Graceful
        } else {
            ShutdownType::Ungraceful
        };
        let header = WalHeader {
            capacity: self.capacity,
            trim_offset,
            last_write_ts: self.io.monotonic_now_nanos(),
            window_next_write_offset,
            window_start_offset,
            window_max_length,
            shutdown_type,
        };
        let slots = self.header_slots.clone();
        let channel = self.channel.clone();
        tokio::spawn(async move {
            let _ = tokio::task::spawn_blocking(move || {
                slots.lock().flush(channel.file(), header)
            })
            .await;
        });
    }
}

impl<F: FileExt, IO: Io<File = F> + Clone> HeaderHandle<F, IO> {
    fn flush_sync(
        &self,
        window_start_offset: u64,
        window_next_write_offset: u64,
        window_max_length: u64,
    ) -> Result<()> {
        let shutdown_type = if self.shutdown_type.load(Ordering::SeqCst) == 0 {
            ShutdownType::Graceful
        } else {
            ShutdownType::Ungraceful
        };
        let header = WalHeader {
            capacity: self.capacity,
            trim_offset: self.trim_offset.load(Ordering::SeqCst),
            last_write_ts: self.io.monotonic_now_nanos(),
            window_next_write_offset,
            window_start_offset,
            window_max_length,
            shutdown_type,
        };
        self.header_slots.lock().flush(self.channel.file(), header)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceState {
    Uninitialized,
    RecoveryPending,
    Running,
    ShuttingDown,
    Closed,
}

pub struct BlockWalService<F, IO> {
    io: IO,
    config: WalConfig,
    geometry: RingGeometry,
    channel: Arc<BlockChannel<F>>,
    header: Arc<HeaderHandle<F, IO>>,
    window: Arc<SlidingWindow<F>>,
    state: Mutex<ServiceState>,
    flusher: Mutex<Option<JoinHandle<()>>>,
    flusher_stop: Arc<tokio::sync::Notify>,
}

impl<F: FileExt, IO: Io<File = F> + Clone + 'static> BlockWalService<F, IO> {
    /// Opens the channel, recovers the header (not yet the records), and starts the header
    /// flusher. Leaves the window `Uninitialized`: callers must drive `recover()` to completion
    /// and then call `reset()` before `append` is permitted.
    pub async fn start(io: IO, config: WalConfig) -> Result<Self> {
        let capacity = config.capacity - (config.capacity % config.block_size);
        let channel = Arc::new(BlockChannel::open(
            &io,
            &config.block_device_path,
            capacity,
            config.block_size,
        )?);
        let header_reserve = config.header_reserve();
        let geometry = RingGeometry {
            header_reserve,
            record_section_capacity: config.record_section_capacity(),
            block_size: config.block_size,
        };

        let recovered = tokio::task::spawn_blocking({
            let channel = channel.clone();
            let block_size = config.block_size;
            move || HeaderSlots::recover(channel.file(), block_size)
        })
        .await
        .expect("header recovery task panicked")?;

        let (header_state, next_slot) = match recovered {
            Some((h, slot)) => (h, slot),
            None => (
                WalHeader::fresh(capacity, config.window_initial, header_reserve),
                0,
            ),
        };

        // The header's own `window_next_write_offset` is only trustworthy after a graceful
        // shutdown (the final flush wrote it precisely). After an ungraceful one it may be stale
        // by up to a header-flush interval's worth of appends, so re-derive it by walking forward
        // from the last known-durable `window_start_offset` (spec §4.5 "Recovery algorithm
        // (ungraceful shutdown)"). Scanning the whole ring is a safe over-approximation even if
        // the window had grown then shrunk since the last flush.
        let header_state = if header_state.shutdown_type == ShutdownType::Ungraceful {
            let scan_channel = channel.clone();
            let scan_start = header_state.window_start_offset;
            let last_good = tokio::task::spawn_blocking(move || {
                ungraceful_recovery_scan(&scan_channel, geometry, scan_start)
            })
            .await
            .expect("ungraceful recovery scan task panicked");
            let corrected = geometry.align_up(last_good);
            WalHeader {
                window_start_offset: corrected,
                window_next_write_offset: corrected,
                ..header_state
            }
        } else {
            header_state
        };

        let header_slots = HeaderSlots::new_at(config.block_size, next_slot);

        let trim_offset = Arc::new(AtomicU64::new(header_state.trim_offset));
        let shutdown_type = Arc::new(AtomicU8::new(1));
        let header_slots = Arc::new(Mutex::new(header_slots));

        let header = Arc::new(HeaderHandle {
            trim_offset,
            shutdown_type,
            header_slots,
            channel: channel.clone(),
            io: io.clone(),
            capacity,
        });

        let window = SlidingWindow::new_arc(
            channel.clone(),
            geometry,
            header.clone() as Arc<dyn HeaderCoordinator>,
            header_state.window_start_offset,
            header_state.window_next_write_offset,
            header_state.window_max_length,
            config.block_soft_limit,
            config.window_scale_unit,
            config.window_upper_limit,
            config.io_threads,
        );

        let flusher_stop = Arc::new(tokio::sync::Notify::new());
        let service = Self {
            io,
            config,
            geometry,
            channel,
            header,
            window,
            state: Mutex::new(ServiceState::RecoveryPending),
            flusher: Mutex::new(None),
            flusher_stop: flusher_stop.clone(),
        };

        service.spawn_header_flusher(flusher_stop);
        Ok(service)
    }

    fn spawn_header_flusher(&self, stop: Arc<tokio::sync::Notify>) {
        let header = self.header.clone();
        let window = self.window.clone();
        let interval = self.config.header_flush_interval();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        header.schedule_flush(
                            window.window_start_offset(),
                            window.window_next_write_offset(),
                            window.window_max_length(),
                        );
                    }
                    _ = stop.notified() => break,
                }
            }
        });
        *self.flusher.lock() = Some(handle);
    }

    /// A lazy cursor over records from `trim_offset` (aligned down to the block size) onward, up
    /// to the recovered `window_next_write_offset`. Must be driven to completion, then followed
    /// by exactly one call to `reset()`, before `append` is permitted.
    pub fn recover(&self) -> RecoveryIterator<'_, F> {
        let trim = self.header.trim_offset.load(Ordering::SeqCst);
        let start = trim - (trim % self.config.block_size);
        RecoveryIterator::new(
            &self.channel,
            self.geometry,
            start,
            self.window.window_next_write_offset(),
        )
    }

    /// Introduces a deliberate one-block gap (spec §9 open question: preserved intentionally)
    /// and trims past everything before recovery began. Must be called exactly once, after
    /// `recover()` completes and before any `append`.
    pub async fn reset(&self) -> Result<()> {
        let previous_next_write = self.window.window_next_write_offset();
        let new_next_write = self.geometry.align_up(previous_next_write) + self.config.block_size;
        self.window.reset_after_recovery(new_next_write);
        self.trim(previous_next_write).await?;
        self.window.start();
        *self.state.lock() = ServiceState::Running;
        Ok(())
    }

    fn ready(&self) -> Result<()> {
        if *self.state.lock() == ServiceState::Running {
            Ok(())
        } else {
            Err(Error::NotReady)
        }
    }

    pub async fn append(
        &self,
        batch: StreamRecordBatch,
    ) -> Result<(u64, oneshot::Receiver<Result<(), Error>>)> {
        self.ready()?;
        self.window.append(batch).await
    }

    /// Advances `trim_offset` to `max(current, offset)` and flushes the header asynchronously.
    /// Precondition: `offset < window_start_offset` (trimming not-yet-flushed records is a
    /// programming error).
    pub async fn trim(&self, offset: u64) -> Result<()> {
        let window_start = self.window.window_start_offset();
        if offset >= window_start && *self.state.lock() == ServiceState::Running {
            return Err(Error::InvalidTrim {
                offset,
                window_start_offset: window_start,
            });
        }
        let current = self.header.trim_offset.load(Ordering::SeqCst);
        self.header
            .trim_offset
            .store(current.max(offset), Ordering::SeqCst);
        self.header.schedule_flush(
            self.window.window_start_offset(),
            self.window.window_next_write_offset(),
            self.window.window_max_length(),
        );
        Ok(())
    }

    pub fn confirm_offset(&self) -> u64 {
        self.window.confirm_offset()
    }

    pub fn trim_offset(&self) -> u64 {
        self.header.trim_offset.load(Ordering::SeqCst)
    }

    pub fn window_next_write_offset(&self) -> u64 {
        self.window.window_next_write_offset()
    }

    /// Spec §4.5 "Gap semantics": drives a fresh recovery pass and checks every opening stream's
    /// recovered head against the metadata service's committed `end_offset`. A recovered lowest
    /// `base_offset` that exceeds the committed end offset means records the metadata service
    /// already expects to exist are simply missing from the WAL — a detected integrity violation,
    /// not an ordinary recovery gap — and must fail fast with `Error::DataLoss` (P3) rather than
    /// resume silently. Must be called after `recover()` would otherwise have been driven to
    /// completion, and before `reset()`.
    pub async fn validate_recovery_against_metadata<M: MetadataClient>(
        &self,
        metadata: &M,
    ) -> Result<()> {
        let mut lowest_base: HashMap<StreamId, u64> = HashMap::new();
        let mut it = self.recover();
        while it.has_next() {
            match it.next() {
                Some(RecoverResult::Record { body, .. }) => {
                    if let Ok(batch) = StreamRecordBatch::decode_envelope(&body) {
                        lowest_base
                            .entry(batch.stream_id)
                            .and_modify(|v| *v = (*v).min(batch.base_offset))
                            .or_insert(batch.base_offset);
                    }
                }
                Some(RecoverResult::Skipped { .. }) => {}
                None => break,
            }
        }

        for stream in metadata.get_opening_streams().await? {
            if let Some(&recovered_base) = lowest_base.get(&stream.stream_id) {
                if recovered_base > stream.end_offset {
                    return Err(Error::DataLoss {
                        stream: stream.stream_id.0,
                        recovered_base,
                        opening_end: stream.end_offset,
                    });
                }
            }
        }
        Ok(())
    }

    pub async fn shutdown_gracefully(&self) -> bool {
        *self.state.lock() = ServiceState::ShuttingDown;
        self.flusher_stop.notify_one();
        if let Some(handle) = self.flusher.lock().take() {
            let _ = handle.await;
        }

        let drained = tokio::time::timeout(
            self.config.shutdown_timeout(),
            self.window.shutdown_gracefully(),
        )
        .await
        .is_ok();

        self.header.shutdown_type.store(0, Ordering::SeqCst);
        let _ = self.header.flush_sync(
            self.window.window_start_offset(),
            self.window.window_next_write_offset(),
            self.window.window_max_length(),
        );
        let _ = self.channel.sync();
        *self.state.lock() = ServiceState::Closed;
        drained
    }
}

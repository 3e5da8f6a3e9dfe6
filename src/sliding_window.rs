//! Sliding Window Service (C4): the in-memory committer.
//!
//! Owns `(window_start_offset, window_next_write_offset, window_max_length)` and a "current
//! block" accumulator. `append` assigns a logical offset under a short critical section, the
//! sealed block is handed to a bounded pool of blocking I/O workers, and completion —
//! out-of-order across workers — advances `window_start_offset` only once the contiguous prefix
//! of dispatched blocks has finished.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::block_channel::BlockChannel;
use crate::codec;
use crate::error::{Error, Result};
use crate::io::FileExt;
use crate::model::WalWriteRequest;

/// Maps logical offsets onto physical positions within the record section of the ring.
#[derive(Debug, Clone, Copy)]
pub struct RingGeometry {
    pub header_reserve: u64,
    pub record_section_capacity: u64,
    pub block_size: u64,
}

impl RingGeometry {
    pub fn physical_of(&self, logical_offset: u64) -> u64 {
        self.header_reserve + (logical_offset % self.record_section_capacity)
    }

    fn distance_to_wrap(&self, logical_offset: u64) -> u64 {
        self.record_section_capacity - (logical_offset % self.record_section_capacity)
    }

    pub fn align_up(&self, offset: u64) -> u64 {
        let rem = offset % self.block_size;
        if rem == 0 {
            offset
        } else {
            offset + (self.block_size - rem)
        }
    }
}

/// Coordinates header-side concerns the window needs but does not own: growing
/// `window_max_length` and scheduling an async header flush. Implemented by the Block WAL
/// Service, which holds the actual header slots; kept as a trait so the window has no back
/// pointer into its owner (see design note on cyclic references).
pub trait HeaderCoordinator: Send + Sync {
    /// Attempts to grow the window's max length by `scale_unit`, bounded by `upper_limit`.
    /// Returns the new max length (unchanged if already at the limit).
    fn try_grow_window(&self, current_max: u64, scale_unit: u64, upper_limit: u64) -> u64;

    /// Persists the window pointers asynchronously; does not block the caller.
    fn schedule_flush(&self, window_start_offset: u64, window_next_write_offset: u64, window_max_length: u64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WindowPhase {
    Uninitialized = 0,
    Running = 1,
    ShuttingDown = 2,
    Closed = 3,
}

struct PendingEntry {
    request: WalWriteRequest,
}

struct PendingBlock {
    start_offset: u64,
    buf: Vec<u8>,
    entries: Vec<PendingEntry>,
}

impl PendingBlock {
    fn new(start_offset: u64) -> Self {
        Self {
            start_offset,
            buf: Vec::new(),
            entries: Vec::new(),
        }
    }

    fn end_offset(&self) -> u64 {
        self.start_offset + self.buf.len() as u64
    }

    fn would_cross_wrap(&self, additional_len: u64, geometry: &RingGeometry) -> bool {
        let used_in_lap = self.start_offset % geometry.record_section_capacity;
        used_in_lap + self.buf.len() as u64 + additional_len > geometry.record_section_capacity
    }

    fn would_exceed_soft_limit(&self, additional_len: u64, soft_limit: u64) -> bool {
        !self.buf.is_empty() && (self.buf.len() as u64 + additional_len) > soft_limit
    }
}

/// Tracks a dispatched block's completion so `window_start_offset` can advance once the
/// contiguous prefix of dispatched blocks finishes, independent of physical completion order.
struct InFlight {
    end_offset: u64,
    done: std::sync::atomic::AtomicBool,
}

pub struct SlidingWindow<F> {
    channel: Arc<BlockChannel<F>>,
    geometry: RingGeometry,
    header: Arc<dyn HeaderCoordinator>,
    block_soft_limit: u64,
    window_scale_unit: u64,
    window_upper_limit: u64,

    phase: AtomicU8,
    window_start_offset: AtomicU64,
    window_next_write_offset: AtomicU64,
    window_max_length: AtomicU64,

    current: Mutex<Option<PendingBlock>>,
    in_flight: Mutex<VecDeque<Arc<InFlight>>>,
    io_permits: Arc<Semaphore>,
    self_weak: Weak<SlidingWindow<F>>,
}

impl<F: FileExt> SlidingWindow<F> {
    #[allow(clippy::too_many_arguments)]
    pub fn new_arc(
        channel: Arc<BlockChannel<F>>,
        geometry: RingGeometry,
        header: Arc<dyn HeaderCoordinator>,
        window_start_offset: u64,
        window_next_write_offset: u64,
        window_max_length: u64,
        block_soft_limit: u64,
        window_scale_unit: u64,
        window_upper_limit: u64,
        io_threads: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            channel,
            geometry,
            header,
            block_soft_limit,
            window_scale_unit,
            window_upper_limit,
            phase: AtomicU8::new(WindowPhase::Uninitialized as u8),
            window_start_offset: AtomicU64::new(window_start_offset),
            window_next_write_offset: AtomicU64::new(window_next_write_offset),
            window_max_length: AtomicU64::new(window_max_length),
            current: Mutex::new(None),
            in_flight: Mutex::new(VecDeque::new()),
            io_permits: Arc::new(Semaphore::new(io_threads.max(1))),
            self_weak: weak.clone(),
        })
    }

    pub fn start(&self) {
        self.phase.store(WindowPhase::Running as u8, Ordering::SeqCst);
    }

    pub fn phase(&self) -> WindowPhase {
        match self.phase.load(Ordering::SeqCst) {
            0 => WindowPhase::Uninitialized,
            1 => WindowPhase::Running,
            2 => WindowPhase::ShuttingDown,
            _ => WindowPhase::Closed,
        }
    }

    /// Inclusive confirm offset: every byte below this point has reached durable storage.
    pub fn confirm_offset(&self) -> u64 {
        self.window_start_offset.load(Ordering::SeqCst)
    }

    pub fn window_next_write_offset(&self) -> u64 {
        self.window_next_write_offset.load(Ordering::SeqCst)
    }

    pub fn window_start_offset(&self) -> u64 {
        self.window_start_offset.load(Ordering::SeqCst)
    }

    pub fn window_max_length(&self) -> u64 {
        self.window_max_length.load(Ordering::SeqCst)
    }

    /// Used once by the Block WAL Service's `reset()`, after recovery completes and before the
    /// window starts accepting appends: collapses the window to an empty range starting at
    /// `new_next_write_offset`.
    pub fn reset_after_recovery(&self, new_next_write_offset: u64) {
        self.window_next_write_offset
            .store(new_next_write_offset, Ordering::SeqCst);
        self.window_start_offset
            .store(new_next_write_offset, Ordering::SeqCst);
    }

    /// Appends one already-formed stream record batch. `batch`'s own `base_offset`/`last_offset`
    /// live in the stream's sequence space; the WAL logical offset this call assigns (the ring
    /// position of the encoded frame) is a separate coordinate, returned alongside the receiver.
    pub async fn append(
        &self,
        batch: crate::model::StreamRecordBatch,
    ) -> Result<(u64, tokio::sync::oneshot::Receiver<Result<(), Error>>)> {
        if self.phase() != WindowPhase::Running {
            return Err(Error::NotReady);
        }

        let stream_id = batch.stream_id;
        let (offset, sealed_block, rx) = {
            let mut guard = self.current.lock();
            // The record frame itself carries no stream identity (spec §4.3), so the envelope
            // (stream_id/base_offset/last_offset) is framed alongside the payload: recovery needs
            // it to reconstruct which stream a recovered record belongs to (spec §4.5).
            let envelope = batch.encode_envelope();
            let needed = envelope.len() as u64 + codec::HEADER_SIZE;
            let offset = self.assign_offset(&mut guard, needed)?;
            let frame = codec::encode(&envelope, None, offset);

            let (request, rx) = WalWriteRequest::new(stream_id, batch, offset);

            let block = guard.as_mut().expect("block created by assign_offset");
            block.buf.extend_from_slice(&frame);
            block.entries.push(PendingEntry { request });

            let sealed = if block.buf.len() as u64 >= self.block_soft_limit {
                guard.take()
            } else {
                None
            };
            (offset, sealed, rx)
        };

        if let Some(block) = sealed_block {
            self.dispatch(block);
        }
        Ok((offset, rx))
    }

    /// Forces the current partial block (if any) to be sealed and dispatched. Used by the
    /// orchestrator's `force_upload` path and by graceful shutdown.
    pub fn flush_current_block(&self) {
        let sealed = self.current.lock().take();
        if let Some(block) = sealed {
            self.dispatch(block);
        }
    }

    /// Must be called holding `current`'s lock. Seals the current block if the new record does
    /// not fit (soft limit or ring-wrap seam), growing the window if needed, and returns the
    /// logical offset assigned to the new record.
    fn assign_offset(&self, guard: &mut Option<PendingBlock>, needed: u64) -> Result<u64> {
        let crosses_wrap = guard
            .as_ref()
            .map(|b| b.would_cross_wrap(needed, &self.geometry))
            .unwrap_or(false);
        let exceeds_soft = guard
            .as_ref()
            .map(|b| b.would_exceed_soft_limit(needed, self.block_soft_limit))
            .unwrap_or(false);

        if crosses_wrap || exceeds_soft {
            if let Some(full) = guard.take() {
                self.dispatch(full);
            }
        }

        if guard.is_none() {
            let mut start = self.window_next_write_offset.load(Ordering::SeqCst);
            start = self.geometry.align_up(start);
            if self.geometry.distance_to_wrap(start) < needed {
                // Pad to the wrap boundary so this record lands entirely on one side of the seam.
                start += self.geometry.distance_to_wrap(start);
            }
            self.reserve_window_capacity(start, needed)?;
            self.window_next_write_offset.store(start, Ordering::SeqCst);
            *guard = Some(PendingBlock::new(start));
        }

        let block = guard.as_mut().unwrap();
        let offset = block.end_offset();
        self.window_next_write_offset
            .store(offset + needed, Ordering::SeqCst);
        Ok(offset)
    }

    fn reserve_window_capacity(&self, new_block_start: u64, needed: u64) -> Result<()> {
        let window_start = self.window_start_offset.load(Ordering::SeqCst);
        let mut max_len = self.window_max_length.load(Ordering::SeqCst);
        let required = new_block_start + needed - window_start;
        if required > max_len {
            max_len = self
                .header
                .try_grow_window(max_len, self.window_scale_unit, self.window_upper_limit);
            self.window_max_length.store(max_len, Ordering::SeqCst);
            self.header.schedule_flush(
                window_start,
                self.window_next_write_offset.load(Ordering::SeqCst),
                max_len,
            );
            if required > max_len {
                return Err(Error::OverCapacity);
            }
        }
        Ok(())
    }

    fn dispatch(&self, block: PendingBlock) {
        let in_flight = Arc::new(InFlight {
            end_offset: block.end_offset(),
            done: std::sync::atomic::AtomicBool::new(false),
        });
        self.in_flight.lock().push_back(in_flight.clone());

        let channel = self.channel.clone();
        let geometry = self.geometry;
        let permits = self.io_permits.clone();
        let start_offset = block.start_offset;
        let mut padded = block.buf;
        let padded_len = geometry.align_up(padded.len() as u64) as usize;
        padded.resize(padded_len, 0);
        let mut entries = block.entries;
        let owner = self.self_weak.clone();

        tokio::spawn(async move {
            let _permit = permits.acquire_owned().await.expect("semaphore closed");
            let physical = geometry.physical_of(start_offset);
            let result = tokio::task::spawn_blocking(move || channel.write(&padded, physical))
                .await
                .expect("block write task panicked");

            match result {
                Ok(()) => {
                    for entry in entries.iter_mut() {
                        entry.request.persisted = true;
                        entry.request.complete(Ok(()));
                    }
                    in_flight.done.store(true, Ordering::SeqCst);
                }
                Err(e) => {
                    let msg = e.to_string();
                    for entry in entries.iter_mut() {
                        entry
                            .request
                            .complete(Err(Error::Io(std::io::Error::new(
                                std::io::ErrorKind::Other,
                                msg.clone(),
                            ))));
                    }
                    // Leave `done` false: a failed write stalls window advancement rather than
                    // silently skipping past a gap, matching the "no byte reported durable
                    // without proof" invariant.
                }
            }

            if let Some(owner) = owner.upgrade() {
                owner.advance_window_start();
            }
        });
    }

    fn advance_window_start(&self) {
        let mut queue = self.in_flight.lock();
        while let Some(front) = queue.front() {
            if front.done.load(Ordering::SeqCst) {
                self.window_start_offset
                    .store(front.end_offset, Ordering::SeqCst);
                queue.pop_front();
            } else {
                break;
            }
        }
    }

    pub async fn shutdown_gracefully(&self) {
        self.phase
            .store(WindowPhase::ShuttingDown as u8, Ordering::SeqCst);
        self.flush_current_block();
        // Drain: wait until every dispatched block has completed.
        loop {
            self.advance_window_start();
            if self.in_flight.lock().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        self.phase.store(WindowPhase::Closed as u8, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::io::StdIo;
    use crate::model::StreamId;

    struct NullHeaderCoordinator;
    impl HeaderCoordinator for NullHeaderCoordinator {
        fn try_grow_window(&self, _current_max: u64, _scale_unit: u64, upper_limit: u64) -> u64 {
            upper_limit
        }
        fn schedule_flush(&self, _s: u64, _n: u64, _m: u64) {}
    }

    fn window(block_soft_limit: u64) -> Arc<SlidingWindow<std::fs::File>> {
        let io = StdIo;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.bin");
        let channel = Arc::new(BlockChannel::open(&io, &path, 1 << 20, 4096).unwrap());
        let geometry = RingGeometry {
            header_reserve: 8192,
            record_section_capacity: channel.capacity() - 8192,
            block_size: 4096,
        };
        let w = SlidingWindow::new_arc(
            channel,
            geometry,
            Arc::new(NullHeaderCoordinator),
            8192,
            8192,
            1 << 16,
            block_soft_limit,
            4 * 1024 * 1024,
            512 * 1024 * 1024,
            4,
        );
        w.start();
        w
    }

    fn batch(n: u64, body: &[u8]) -> crate::model::StreamRecordBatch {
        crate::model::StreamRecordBatch::new(
            StreamId(1),
            n,
            n + 1,
            bytes::Bytes::copy_from_slice(body),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn append_then_confirm_advances() {
        let w = window(128 * 1024);
        let (offset, rx) = w.append(batch(0, b"hello")).await.unwrap();
        assert_eq!(offset, 8192);
        rx.await.unwrap().unwrap();
        // The block hasn't hit the soft limit, so it's still open; force it out.
        w.flush_current_block();
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            loop {
                if w.confirm_offset() > 8192 {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn soft_limit_seals_block_eagerly() {
        let w = window(64);
        let body = vec![0u8; 100];
        let (_offset, rx) = w.append(batch(0, &body)).await.unwrap();
        // Body alone exceeds the soft limit, so the block is sealed and dispatched immediately
        // without needing a manual flush.
        rx.await.unwrap().unwrap();
    }
}

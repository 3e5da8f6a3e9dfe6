//! Log Cache (C6): an in-memory, stream-partitioned cache of records acknowledged by the WAL
//! but not yet uploaded (spec §3, §4.6).

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::model::{CacheBlock, StreamId, StreamRecordBatch};

pub struct LogCacheConfig {
    pub block_size_limit: u64,
    pub max_streams_per_block: usize,
}

struct Inner {
    current: CacheBlock,
    /// Sealed blocks awaiting upload, oldest first. `mark_free` removes from the front once an
    /// upload commits; `force_free` also drains from the front (oldest-first eviction).
    archived: VecDeque<CacheBlock>,
    size_bytes: u64,
}

/// `put` returning whether the *current* block became full and must be sealed by the caller
/// (the orchestrator, which owns the decision to archive and enqueue for upload).
pub struct PutOutcome {
    pub became_full: bool,
}

pub struct LogCache {
    config: LogCacheConfig,
    inner: Mutex<Inner>,
}

impl LogCache {
    pub fn new(config: LogCacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                current: CacheBlock::default(),
                archived: VecDeque::new(),
                size_bytes: 0,
            }),
        }
    }

    /// Inserts `record` into the current block, rejecting out-of-order duplicates. Returns
    /// whether the block is now full (by byte size or stream count) and should be archived.
    pub fn put(&self, record: StreamRecordBatch) -> PutOutcome {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.current.streams.get(&record.stream_id) {
            if let Some(last) = existing.last() {
                if record.base_offset < last.last_offset {
                    // Stale/duplicate; the committer is expected to have already rejected this,
                    // but the cache enforces the ordering invariant defensively.
                    return PutOutcome { became_full: false };
                }
            }
        }
        inner.size_bytes += record.encoded_size as u64;
        inner.current.push(record);

        let full = inner.current.byte_size >= self.config.block_size_limit
            || inner.current.stream_count() >= self.config.max_streams_per_block;
        PutOutcome { became_full: full }
    }

    /// Reads the contiguous head of `[start, end)` for `stream`, if held entirely in cache.
    pub fn get(
        &self,
        stream: StreamId,
        start: u64,
        end: u64,
        max_bytes: u64,
    ) -> Vec<StreamRecordBatch> {
        let inner = self.inner.lock();
        let mut out = Vec::new();
        let mut bytes = 0u64;
        let mut expect = start;

        let mut collect = |batches: &[StreamRecordBatch]| {
            for b in batches {
                if b.base_offset < start || b.base_offset >= end {
                    continue;
                }
                if b.base_offset != expect {
                    return;
                }
                if bytes + b.encoded_size as u64 > max_bytes && !out.is_empty() {
                    return;
                }
                bytes += b.encoded_size as u64;
                expect = b.last_offset;
                out.push(b.clone());
            }
        };

        for block in inner.archived.iter() {
            if let Some(batches) = block.streams.get(&stream) {
                collect(batches);
            }
        }
        if let Some(batches) = inner.current.streams.get(&stream) {
            collect(batches);
        }
        out
    }

    /// Seals and returns the current block unconditionally, starting a fresh one.
    pub fn archive_current_block(&self) -> CacheBlock {
        let mut inner = self.inner.lock();
        let sealed = std::mem::take(&mut inner.current);
        if !sealed.is_empty() {
            inner.archived.push_back(clone_block(&sealed));
        }
        sealed
    }

    /// Seals the current block only if it holds any record for `stream_id`.
    pub fn archive_current_block_if_contains(&self, stream_id: StreamId) -> Option<CacheBlock> {
        let mut inner = self.inner.lock();
        if !inner.current.contains_stream(stream_id) {
            return None;
        }
        let sealed = std::mem::take(&mut inner.current);
        inner.archived.push_back(clone_block(&sealed));
        Some(sealed)
    }

    /// Releases an archived block after its upload has committed. Matches by `confirm_offset`,
    /// which is unique per sealed block.
    pub fn mark_free(&self, block: &CacheBlock) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner
            .archived
            .iter()
            .position(|b| b.confirm_offset == block.confirm_offset)
        {
            let freed = inner.archived.remove(pos).unwrap();
            inner.size_bytes -= block_bytes(&freed);
        }
    }

    pub fn set_confirm_offset(&self, v: u64) {
        let mut inner = self.inner.lock();
        inner.current.confirm_offset = Some(v);
    }

    /// Frees whole archived-but-uncommitted blocks, oldest first, never touching an in-flight
    /// upload (the orchestrator removes a block from `archived` only once its upload completes,
    /// via `mark_free`; anything still in `archived` here is a candidate).
    pub fn force_free(&self, target_bytes: u64) -> u64 {
        let mut inner = self.inner.lock();
        let mut freed = 0u64;
        while freed < target_bytes {
            let Some(front) = inner.archived.pop_front() else {
                break;
            };
            freed += block_bytes(&front);
        }
        inner.size_bytes = inner.size_bytes.saturating_sub(freed);
        freed
    }

    pub fn size(&self) -> u64 {
        self.inner.lock().size_bytes
    }
}

fn block_bytes(block: &CacheBlock) -> u64 {
    block.byte_size
}

fn clone_block(block: &CacheBlock) -> CacheBlock {
    CacheBlock {
        streams: block.streams.clone(),
        byte_size: block.byte_size,
        confirm_offset: block.confirm_offset,
    }
}

//! Lightweight counters/gauges (spec SPEC_FULL §1 "ambient stack additions").
//!
//! The teacher favors `tracing` events over pulling in a dedicated metrics crate; this mirrors
//! that choice. Counters are plain `AtomicU64`s the embedding process can read directly, and the
//! interesting transitions additionally fire a `tracing` event so they show up in the same log
//! stream as everything else.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub records_appended: AtomicU64,
    pub bytes_appended: AtomicU64,
    pub backoff_enqueued: AtomicU64,
    pub backoff_cache_full: AtomicU64,
    pub backoff_over_capacity: AtomicU64,
    pub objects_committed: AtomicU64,
    pub bytes_uploaded: AtomicU64,
    pub upload_retries: AtomicU64,
}

impl Metrics {
    pub fn record_append(&self, bytes: u64) {
        self.records_appended.fetch_add(1, Ordering::Relaxed);
        self.bytes_appended.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_backoff(&self, reason: BackoffReason) {
        self.backoff_enqueued.fetch_add(1, Ordering::Relaxed);
        match reason {
            BackoffReason::CacheFull => {
                self.backoff_cache_full.fetch_add(1, Ordering::Relaxed);
            }
            BackoffReason::OverCapacity => {
                self.backoff_over_capacity.fetch_add(1, Ordering::Relaxed);
            }
        }
        tracing::debug!(?reason, "append backed off");
    }

    pub fn record_commit(&self, bytes: u64) {
        self.objects_committed.fetch_add(1, Ordering::Relaxed);
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
        tracing::info!(bytes, "wal object committed");
    }

    pub fn record_upload_retry(&self) {
        self.upload_retries.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy)]
pub enum BackoffReason {
    CacheFull,
    OverCapacity,
}

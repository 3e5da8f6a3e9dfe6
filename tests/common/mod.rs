//! Shared helpers for the durability core's integration tests (spec §8 seed scenarios).

use std::path::PathBuf;

use bytes::Bytes;
use durably::config::WalConfig;
use durably::model::{StreamId, StreamRecordBatch};

/// A `WalConfig` tuned for fast, deterministic tests: a small ring, a tiny block soft limit so
/// every append dispatches its own WAL block immediately (no need to wait on a soft-limit seal
/// triggered by a later, unrelated append), and a header flush interval long enough that it never
/// fires on its own during a test's lifetime (tests that need a header flush call `trim` and wait
/// for it explicitly).
pub fn test_config(path: PathBuf, capacity: u64, block_size: u64) -> WalConfig {
    let usable = capacity - 2 * block_size;
    WalConfig {
        block_device_path: path,
        capacity,
        block_size,
        header_flush_interval_s: 3600,
        io_threads: 2,
        window_initial: usable,
        window_upper_limit: usable,
        window_scale_unit: block_size,
        block_soft_limit: 16,
        wal_cache_size: 16 * 1024 * 1024,
        wal_object_size: 1024 * 1024,
        max_streams_per_wal_object: 64,
        max_streams_per_block: 64,
        network_baseline_bandwidth: 0,
        backoff_drain_interval_ms: 20,
        shutdown_timeout_s: 5,
        network_retry_attempts: 3,
    }
}

pub fn batch(stream: u64, base: u64, payload: &[u8]) -> StreamRecordBatch {
    StreamRecordBatch::new(StreamId(stream), base, base + 1, Bytes::copy_from_slice(payload)).unwrap()
}

/// Initializes a `tracing` subscriber from `RUST_LOG` so integration tests can opt into log
/// output the way the teacher's own integration tests do. Safe to call from every test: only the
/// first call in a given test binary actually installs the subscriber.
pub fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

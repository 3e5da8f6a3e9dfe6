//! Typed configuration surface (spec §6), with `serde` deserialization and documented defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_BLOCK_SIZE: u64 = 4096;
pub const DEFAULT_HEADER_FLUSH_INTERVAL_S: u64 = 10;
pub const DEFAULT_IO_THREADS: usize = 8;
pub const DEFAULT_WINDOW_INITIAL: u64 = 1024 * 1024;
pub const DEFAULT_WINDOW_UPPER_LIMIT: u64 = 512 * 1024 * 1024;
pub const DEFAULT_WINDOW_SCALE_UNIT: u64 = 4 * 1024 * 1024;
pub const DEFAULT_BLOCK_SOFT_LIMIT: u64 = 128 * 1024;
pub const DEFAULT_WAL_CACHE_SIZE: u64 = 256 * 1024 * 1024;
pub const DEFAULT_WAL_OBJECT_SIZE: u64 = 32 * 1024 * 1024;
pub const DEFAULT_MAX_STREAMS_PER_WAL_OBJECT: usize = 256;
pub const DEFAULT_BACKOFF_DRAIN_INTERVAL_MS: u64 = 100;
pub const DEFAULT_MAX_STREAMS_PER_BLOCK: usize = 256;
pub const DEFAULT_SHUTDOWN_TIMEOUT_S: u64 = 24 * 60 * 60;
pub const DEFAULT_NETWORK_RETRY_ATTEMPTS: u32 = 5;

/// Config surface recognized by the durability core (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Path to the raw block device or preallocated file.
    pub block_device_path: PathBuf,
    /// Device bytes, rounded down to a block boundary at first start. Immutable thereafter.
    pub capacity: u64,
    /// Device block size in bytes. All channel positions/lengths are aligned to this.
    pub block_size: u64,
    pub header_flush_interval_s: u64,
    pub io_threads: usize,
    pub window_initial: u64,
    pub window_upper_limit: u64,
    pub window_scale_unit: u64,
    pub block_soft_limit: u64,
    pub wal_cache_size: u64,
    pub wal_object_size: u64,
    pub max_streams_per_wal_object: usize,
    pub max_streams_per_block: usize,
    /// Throttle for reads during compaction, in bytes/sec. `0` means unthrottled.
    pub network_baseline_bandwidth: u64,
    pub backoff_drain_interval_ms: u64,
    pub shutdown_timeout_s: u64,
    pub network_retry_attempts: u32,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            block_device_path: PathBuf::from("wal.bin"),
            capacity: 64 * 1024 * 1024,
            block_size: DEFAULT_BLOCK_SIZE,
            header_flush_interval_s: DEFAULT_HEADER_FLUSH_INTERVAL_S,
            io_threads: DEFAULT_IO_THREADS,
            window_initial: DEFAULT_WINDOW_INITIAL,
            window_upper_limit: DEFAULT_WINDOW_UPPER_LIMIT,
            window_scale_unit: DEFAULT_WINDOW_SCALE_UNIT,
            block_soft_limit: DEFAULT_BLOCK_SOFT_LIMIT,
            wal_cache_size: DEFAULT_WAL_CACHE_SIZE,
            wal_object_size: DEFAULT_WAL_OBJECT_SIZE,
            max_streams_per_wal_object: DEFAULT_MAX_STREAMS_PER_WAL_OBJECT,
            max_streams_per_block: DEFAULT_MAX_STREAMS_PER_BLOCK,
            network_baseline_bandwidth: 0,
            backoff_drain_interval_ms: DEFAULT_BACKOFF_DRAIN_INTERVAL_MS,
            shutdown_timeout_s: DEFAULT_SHUTDOWN_TIMEOUT_S,
            network_retry_attempts: DEFAULT_NETWORK_RETRY_ATTEMPTS,
        }
    }
}

impl WalConfig {
    pub fn header_flush_interval(&self) -> Duration {
        Duration::from_secs(self.header_flush_interval_s)
    }

    pub fn backoff_drain_interval(&self) -> Duration {
        Duration::from_millis(self.backoff_drain_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_s)
    }

    /// Two header slots, each occupying one device block.
    pub fn header_reserve(&self) -> u64 {
        2 * self.block_size
    }

    /// Bytes available to records after the header reserve, rounded down to the block size.
    pub fn record_section_capacity(&self) -> u64 {
        let usable = self.capacity.saturating_sub(self.header_reserve());
        usable - (usable % self.block_size)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}

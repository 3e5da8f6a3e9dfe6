//! The `Io` seam abstracts the ambient services the durability core needs beyond positioned file
//! I/O: opening/creating files, a clock, and id generation. Production code and the test suite
//! both use `StdIo` against a preallocated tempfile standing in for the block device.

use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub mod file;

pub use file::FileExt;

pub trait Io: Send + Sync + 'static {
    type File: FileExt;

    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Opens the block device / WAL file at `path`. `create` creates the file (and, for a
    /// preallocated file, truncates it to `create_len` bytes) if it does not already exist.
    fn open(&self, path: &Path, create: bool, create_len: u64) -> io::Result<Self::File>;

    fn tempfile(&self) -> io::Result<Self::File>;

    fn now(&self) -> DateTime<Utc>;

    /// Monotonically increasing nanosecond timestamp, used for `last_write_ts`. Unlike `now()`,
    /// this is guaranteed to strictly increase across calls within a process.
    fn monotonic_now_nanos(&self) -> u64;

    fn uuid(&self) -> Uuid;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StdIo;

impl Io for StdIo {
    type File = std::fs::File;

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn open(&self, path: &Path, create: bool, create_len: u64) -> io::Result<Self::File> {
        let file = std::fs::OpenOptions::new()
            .create(create)
            .read(true)
            .write(true)
            .open(path)?;
        if create && file.metadata()?.len() == 0 && create_len > 0 {
            file.set_len(create_len)?;
        }
        Ok(file)
    }

    fn tempfile(&self) -> io::Result<Self::File> {
        tempfile::tempfile()
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic_now_nanos(&self) -> u64 {
        use std::sync::atomic::{AtomicU64, Ordering};
        use std::time::{SystemTime, UNIX_EPOCH};

        static LAST: AtomicU64 = AtomicU64::new(0);

        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;

        let mut prev = LAST.load(Ordering::Relaxed);
        loop {
            let next = wall.max(prev + 1);
            match LAST.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return next,
                Err(cur) => prev = cur,
            }
        }
    }

    fn uuid(&self) -> Uuid {
        Uuid::new_v4()
    }
}

impl<T: Io> Io for std::sync::Arc<T> {
    type File = T::File;

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        self.as_ref().create_dir_all(path)
    }

    fn open(&self, path: &Path, create: bool, create_len: u64) -> io::Result<Self::File> {
        self.as_ref().open(path, create, create_len)
    }

    fn tempfile(&self) -> io::Result<Self::File> {
        self.as_ref().tempfile()
    }

    fn now(&self) -> DateTime<Utc> {
        self.as_ref().now()
    }

    fn monotonic_now_nanos(&self) -> u64 {
        self.as_ref().monotonic_now_nanos()
    }

    fn uuid(&self) -> Uuid {
        self.as_ref().uuid()
    }
}

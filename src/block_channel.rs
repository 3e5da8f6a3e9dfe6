//! Block Channel (C1): aligned read/write of byte buffers to the raw block device.
//!
//! Every position and length the channel accepts must be a multiple of the device block size.
//! Writers are serialized by the caller (the sliding window committer); reads may run
//! concurrently at disjoint positions since `pread`/`pwrite` take no shared cursor.

use std::io::{self, ErrorKind};
use std::path::Path;

use crate::error::{Error, Result};
use crate::io::{FileExt, Io};

pub struct BlockChannel<F> {
    file: F,
    block_size: u64,
    capacity: u64,
}

impl<F: FileExt> BlockChannel<F> {
    pub fn open<IO: Io<File = F>>(
        io: &IO,
        path: &Path,
        capacity: u64,
        block_size: u64,
    ) -> Result<Self> {
        let capacity = capacity - (capacity % block_size);
        let file = io.open(path, true, capacity)?;
        if file.len()? < capacity {
            file.set_len(capacity)?;
        }
        Ok(Self {
            file,
            block_size,
            capacity,
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Exposes the underlying file for components (the WAL header) that need a `FileExt` rather
    /// than the channel's own alignment-checked `write`/`read`.
    pub fn file(&self) -> &F {
        &self.file
    }

    fn check_aligned(&self, position: u64, len: usize) -> Result<()> {
        if position % self.block_size != 0 || len as u64 % self.block_size != 0 {
            return Err(Error::Io(io::Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "block channel position {position} / length {len} not aligned to block size {}",
                    self.block_size
                ),
            )));
        }
        Ok(())
    }

    /// Writes `buf` verbatim at `position`. Retries on partial writes, re-issuing the remainder
    /// at `position + written` rounded down to a block multiple; a zero-byte write from the OS
    /// surfaces as a short-write `IoError`.
    pub fn write(&self, buf: &[u8], position: u64) -> Result<()> {
        self.check_aligned(position, buf.len())?;
        let mut written: u64 = 0;
        while written < buf.len() as u64 {
            let remaining = &buf[written as usize..];
            let n = self.file.write_at(remaining, position + written)?;
            if n == 0 {
                return Err(Error::Io(io::Error::new(
                    ErrorKind::WriteZero,
                    "short write to block device",
                )));
            }
            // Round down to a block multiple: a partial write that lands mid-block would
            // otherwise desynchronize the next retry's alignment.
            let rounded = (n as u64) - ((n as u64) % self.block_size);
            if rounded == 0 {
                return Err(Error::Io(io::Error::new(
                    ErrorKind::WriteZero,
                    "short write to block device below block granularity",
                )));
            }
            written += rounded;
        }
        Ok(())
    }

    /// Fills `buf` verbatim from `position`, returning the number of bytes fetched.
    pub fn read(&self, buf: &mut [u8], position: u64) -> Result<usize> {
        self.check_aligned(position, buf.len())?;
        self.file.read_exact_at(buf, position)?;
        Ok(buf.len())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn try_clone(&self) -> Result<BlockChannel<F>> {
        Ok(BlockChannel {
            file: self.file.try_clone_ext()?,
            block_size: self.block_size,
            capacity: self.capacity,
        })
    }
}

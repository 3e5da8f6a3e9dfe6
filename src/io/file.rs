//! Positioned, block-aligned file I/O.
//!
//! `FileExt` is the seam between the durability core and the underlying block
//! device: every WAL write and read goes through it. Sync methods are used on
//! the direct I/O worker pool (already inside a blocking context); the async
//! helpers exist so callers outside that pool (recovery, runtime reads) don't
//! have to manage `spawn_blocking` themselves.

use std::fs::File;
use std::io::{self, ErrorKind, IoSlice, Write};

pub trait FileExt: Send + Sync + 'static {
    fn len(&self) -> io::Result<u64>;

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;

    fn write_at_vectored(&self, bufs: &[IoSlice], offset: u64) -> io::Result<usize>;

    fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        let mut written = 0;
        while written != buf.len() {
            let n = self.write_at(&buf[written..], offset + written as u64)?;
            if n == 0 {
                return Err(io::Error::new(ErrorKind::WriteZero, "short write"));
            }
            written += n;
        }
        Ok(())
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let mut read = 0;
        while read != buf.len() {
            let n = self.read_at(&mut buf[read..], offset + read as u64)?;
            if n == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "unexpected end-of-file",
                ));
            }
            read += n;
        }
        Ok(())
    }

    fn sync_all(&self) -> io::Result<()>;

    fn set_len(&self, len: u64) -> io::Result<()>;

    fn try_clone_ext(&self) -> io::Result<Self>
    where
        Self: Sized;

    fn cursor(&self, offset: u64) -> Cursor<'_, Self>
    where
        Self: Sized,
    {
        Cursor {
            file: self,
            offset,
            count: 0,
        }
    }
}

impl FileExt for File {
    fn len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        Ok(nix::sys::uio::pwrite(self, buf, offset as i64)?)
    }

    fn write_at_vectored(&self, bufs: &[IoSlice], offset: u64) -> io::Result<usize> {
        Ok(nix::sys::uio::pwritev(self, bufs, offset as i64)?)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        Ok(nix::sys::uio::pread(self, buf, offset as i64)?)
    }

    fn sync_all(&self) -> io::Result<()> {
        File::sync_all(self)
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }

    fn try_clone_ext(&self) -> io::Result<Self> {
        self.try_clone()
    }
}

/// Runs a blocking read on the tokio blocking pool. Used by code paths that are not already
/// inside a dedicated worker thread (e.g. `BlockChannel::read`).
pub async fn spawn_read_exact_at<F>(
    file: F,
    mut buf: Vec<u8>,
    offset: u64,
) -> (Vec<u8>, io::Result<()>)
where
    F: FileExt + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let ret = file.read_exact_at(&mut buf, offset);
        (buf, ret)
    })
    .await
    .expect("blocking file read task panicked")
}

pub async fn spawn_write_all_at<F>(file: F, buf: Vec<u8>, offset: u64) -> (Vec<u8>, io::Result<()>)
where
    F: FileExt + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let ret = file.write_all_at(&buf, offset);
        (buf, ret)
    })
    .await
    .expect("blocking file write task panicked")
}

/// A `Write` adapter over `FileExt` that tracks bytes written from a fixed offset. Used to stream
/// variable-length data (e.g. a record frame) into a file with the regular `std::io::Write` API.
#[derive(Debug)]
pub struct Cursor<'a, T> {
    file: &'a T,
    offset: u64,
    count: u64,
}

impl<T> Cursor<'_, T> {
    pub fn count(&self) -> u64 {
        self.count
    }
}

impl<T: FileExt> Write for Cursor<'_, T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let count = self.file.write_at(buf, self.offset + self.count)?;
        self.count += count as u64;
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempfile;

    #[test]
    fn write_then_read_roundtrip() {
        let file = tempfile().unwrap();
        file.write_all_at(b"hello world", 0).unwrap();
        let mut buf = [0u8; 11];
        file.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[tokio::test]
    async fn async_roundtrip() {
        let file = tempfile().unwrap();
        let (buf, ret) =
            spawn_write_all_at(file.try_clone_ext().unwrap(), vec![7u8; 4096], 0).await;
        ret.unwrap();
        assert_eq!(buf.len(), 4096);

        let (buf, ret) = spawn_read_exact_at(file, vec![0u8; 4096], 0).await;
        ret.unwrap();
        assert!(buf.iter().all(|b| *b == 7));
    }
}

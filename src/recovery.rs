//! Recovery Iterator (C10): a stateless cursor over WAL records from a trim offset onward,
//! tolerating ring wrap and corrupted runs (spec §4.5, §4.10).

use crate::block_channel::BlockChannel;
use crate::codec::{self, RecordHeader};
use crate::io::FileExt;
use crate::sliding_window::RingGeometry;

/// One recovered record, or a note that a run of bytes was skipped.
#[derive(Debug)]
pub enum RecoverResult {
    Record {
        offset: u64,
        header: RecordHeader,
        body: Vec<u8>,
    },
    /// A decode failure at `offset`; the iterator has jumped to `jump_next_offset` (the next
    /// block boundary) to continue scanning.
    Skipped { offset: u64, jump_next_offset: u64 },
}

pub struct RecoveryIterator<'a, F> {
    channel: &'a BlockChannel<F>,
    geometry: RingGeometry,
    next_recover_offset: u64,
    stop_at: u64,
    bytes_scanned: u64,
    record_section_capacity: u64,
}

impl<'a, F: FileExt> RecoveryIterator<'a, F> {
    /// `start_offset` is aligned down to the device block size by the caller (the Block WAL
    /// Service, per spec §4.5). `stop_at` is `window_next_write_offset` at the time recovery
    /// began.
    pub fn new(
        channel: &'a BlockChannel<F>,
        geometry: RingGeometry,
        start_offset: u64,
        stop_at: u64,
    ) -> Self {
        Self {
            channel,
            geometry,
            next_recover_offset: start_offset,
            stop_at,
            bytes_scanned: 0,
            record_section_capacity: geometry.record_section_capacity,
        }
    }

    pub fn has_next(&self) -> bool {
        self.next_recover_offset < self.stop_at
            && self.bytes_scanned < self.record_section_capacity
    }

    /// Skips exactly one offset forward; used when the caller has already consumed the record at
    /// the trim boundary and does not want it reported twice.
    pub fn skip_one(&mut self) {
        self.next_recover_offset += 1;
    }

    fn read_record(&self, offset: u64) -> Result<(RecordHeader, Vec<u8>), ()> {
        let physical = self.geometry.physical_of(offset);
        let mut header_buf = vec![0u8; self.geometry.block_size as usize];
        if self.channel.read(&mut header_buf, physical).is_err() {
            return Err(());
        }
        let header = codec::decode_header(&header_buf, offset).map_err(|_| ())?;

        let body_len = header.body_length() as u64;
        let total = codec::HEADER_SIZE + body_len;
        let mut frame = vec![0u8; self.geometry.align_up(total) as usize];
        if total as usize > header_buf.len() {
            if self.channel.read(&mut frame, physical).is_err() {
                return Err(());
            }
        } else {
            frame[..header_buf.len()].copy_from_slice(&header_buf);
        }
        let body = frame[codec::HEADER_SIZE as usize..(codec::HEADER_SIZE + body_len) as usize]
            .to_vec();
        if codec::verify_body(&header, &body).is_err() {
            return Err(());
        }
        Ok((header, body))
    }

    /// Advances the cursor by one step. Call only when `has_next()` is true; behavior is
    /// undefined otherwise (spec §4.10).
    pub fn next(&mut self) -> Option<RecoverResult> {
        if !self.has_next() {
            return None;
        }

        let offset = self.next_recover_offset;
        match self.read_record(offset) {
            Ok((header, body)) => {
                let advance = codec::HEADER_SIZE + header.body_length() as u64;
                self.bytes_scanned += advance;
                self.next_recover_offset = offset + advance;
                Some(RecoverResult::Record {
                    offset,
                    header,
                    body,
                })
            }
            Err(()) => {
                let jump = self.geometry.align_up(offset + 1);
                self.bytes_scanned += jump - offset;
                self.next_recover_offset = jump;
                Some(RecoverResult::Skipped {
                    offset,
                    jump_next_offset: jump,
                })
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::io::StdIo;

    fn geometry(capacity: u64) -> RingGeometry {
        RingGeometry {
            header_reserve: 8192,
            record_section_capacity: capacity - 8192,
            block_size: 4096,
        }
    }

    #[test]
    fn recovers_a_single_written_record() {
        let io = StdIo;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.bin");
        let channel = BlockChannel::open(&io, &path, 1 << 20, 4096).unwrap();
        let geom = geometry(1 << 20);

        let frame = codec::encode(b"hello", None, 8192);
        let mut block = frame.clone();
        block.resize(geom.align_up(frame.len() as u64) as usize, 0);
        channel.write(&block, geom.physical_of(8192)).unwrap();

        let mut it = RecoveryIterator::new(&channel, geom, 8192, 8192 + block.len() as u64);
        assert!(it.has_next());
        match it.next().unwrap() {
            RecoverResult::Record { offset, body, .. } => {
                assert_eq!(offset, 8192);
                assert_eq!(body, b"hello");
            }
            other => panic!("expected a record, got {other:?}"),
        }
        assert!(!it.has_next());
    }

    #[test]
    fn skips_corrupt_block_to_next_boundary() {
        let io = StdIo;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.bin");
        let channel = BlockChannel::open(&io, &path, 1 << 20, 4096).unwrap();
        let geom = geometry(1 << 20);

        // Leave the first block zeroed (bad magic); write a valid record in the second.
        let frame = codec::encode(b"second", None, 8192 + 4096);
        let mut block = frame.clone();
        block.resize(geom.align_up(frame.len() as u64) as usize, 0);
        channel
            .write(&block, geom.physical_of(8192 + 4096))
            .unwrap();

        let mut it = RecoveryIterator::new(&channel, geom, 8192, 8192 + 4096 + block.len() as u64);
        match it.next().unwrap() {
            RecoverResult::Skipped {
                offset,
                jump_next_offset,
            } => {
                assert_eq!(offset, 8192);
                assert_eq!(jump_next_offset, 8192 + 4096);
            }
            other => panic!("expected a skip, got {other:?}"),
        }
        match it.next().unwrap() {
            RecoverResult::Record { offset, body, .. } => {
                assert_eq!(offset, 8192 + 4096);
                assert_eq!(body, b"second");
            }
            other => panic!("expected a record, got {other:?}"),
        }
    }
}

//! WAL header: the on-disk superblock (spec §3, §4.2).
//!
//! Two redundant copies sit at physical positions `0` and `header_block_size`, written
//! round-robin so a crash mid-flush can never destroy both. Recovery reads both slots, discards
//! any with a bad magic or CRC, and keeps the survivor with the greatest `last_write_ts`.

use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::Error;
use crate::io::FileExt;

pub const HEADER_MAGIC: u32 = 0x574C_4831; // "WLH1"

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ShutdownType {
    Graceful = 0,
    Ungraceful = 1,
}

impl ShutdownType {
    fn from_u32(v: u32) -> Self {
        if v == 0 {
            ShutdownType::Graceful
        } else {
            ShutdownType::Ungraceful
        }
    }
}

/// On-disk superblock layout. Field order matches spec §6 exactly; all other bytes in the
/// header block are zero and excluded from the CRC.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct WalHeaderOnDisk {
    magic: U32,
    capacity: U64,
    trim_offset: U64,
    last_write_ts: U64,
    window_next_write_offset: U64,
    window_start_offset: U64,
    window_max_length: U64,
    shutdown_type: U32,
    crc: U32,
}

const CRC_COVERED_LEN: usize = std::mem::size_of::<WalHeaderOnDisk>() - 4;

impl WalHeaderOnDisk {
    fn checksum(&self) -> u32 {
        crc32fast::hash(&self.as_bytes()[..CRC_COVERED_LEN])
    }

    fn recompute_crc(&mut self) {
        self.crc = self.checksum().into();
    }

    fn verify(&self) -> bool {
        self.magic.get() == HEADER_MAGIC && self.crc.get() == self.checksum()
    }
}

/// In-memory, validated representation of the WAL header.
#[derive(Debug, Clone, Copy)]
pub struct WalHeader {
    pub capacity: u64,
    pub trim_offset: u64,
    pub last_write_ts: u64,
    pub window_next_write_offset: u64,
    pub window_start_offset: u64,
    pub window_max_length: u64,
    pub shutdown_type: ShutdownType,
}

impl WalHeader {
    pub fn fresh(capacity: u64, window_initial: u64, header_reserve: u64) -> Self {
        Self {
            capacity,
            trim_offset: header_reserve,
            last_write_ts: 0,
            window_next_write_offset: header_reserve,
            window_start_offset: header_reserve,
            window_max_length: window_initial,
            shutdown_type: ShutdownType::Ungraceful,
        }
    }

    fn to_on_disk(self) -> WalHeaderOnDisk {
        let mut h = WalHeaderOnDisk {
            magic: HEADER_MAGIC.into(),
            capacity: self.capacity.into(),
            trim_offset: self.trim_offset.into(),
            last_write_ts: self.last_write_ts.into(),
            window_next_write_offset: self.window_next_write_offset.into(),
            window_start_offset: self.window_start_offset.into(),
            window_max_length: self.window_max_length.into(),
            shutdown_type: (self.shutdown_type as u32).into(),
            crc: 0.into(),
        };
        h.recompute_crc();
        h
    }

    fn from_on_disk(h: &WalHeaderOnDisk) -> Self {
        Self {
            capacity: h.capacity.get(),
            trim_offset: h.trim_offset.get(),
            last_write_ts: h.last_write_ts.get(),
            window_next_write_offset: h.window_next_write_offset.get(),
            window_start_offset: h.window_start_offset.get(),
            window_max_length: h.window_max_length.get(),
            shutdown_type: ShutdownType::from_u32(h.shutdown_type.get()),
        }
    }

    /// spec §3 invariants.
    pub fn check_invariants(&self, header_reserve: u64) -> bool {
        self.trim_offset <= self.window_start_offset
            && self.window_start_offset <= self.window_next_write_offset
            && (self.window_next_write_offset - self.window_start_offset) <= self.window_max_length
            && self.window_max_length <= self.capacity.saturating_sub(header_reserve)
    }
}

/// Owns the two on-disk header slots and the round-robin flush cursor. Writes are serialized by
/// the caller (the Block WAL Service holds a lock while flushing, spec §5).
pub struct HeaderSlots {
    block_size: u64,
    next_slot: u8,
}

impl HeaderSlots {
    pub fn new(block_size: u64) -> Self {
        Self {
            block_size,
            next_slot: 0,
        }
    }

    /// Resumes the round-robin cursor at a specific slot, e.g. the value returned by
    /// `recover()` so the next flush overwrites the stale copy first.
    pub fn new_at(block_size: u64, next_slot: u8) -> Self {
        Self {
            block_size,
            next_slot: next_slot % 2,
        }
    }

    fn slot_offset(&self, slot: u8) -> u64 {
        slot as u64 * self.block_size
    }

    /// Writes `header` to the next slot in round-robin order and advances the cursor. `last_write_ts`
    /// must already be monotonically increasing; the caller obtains it from a monotonic clock.
    pub fn flush<F: FileExt>(&mut self, file: &F, header: WalHeader) -> Result<(), Error> {
        let on_disk = header.to_on_disk();
        let offset = self.slot_offset(self.next_slot);
        let mut block = vec![0u8; self.block_size as usize];
        block[..std::mem::size_of::<WalHeaderOnDisk>()].copy_from_slice(on_disk.as_bytes());
        file.write_all_at(&block, offset)?;
        self.next_slot = 1 - self.next_slot;
        Ok(())
    }

    /// Reads both slots and returns the latest-`last_write_ts`-surviving header, along with the
    /// slot index to write to next (the one *not* selected, so the next flush overwrites the
    /// stale copy first).
    pub fn recover<F: FileExt>(
        file: &F,
        block_size: u64,
    ) -> Result<Option<(WalHeader, u8)>, Error> {
        let mut candidates = Vec::with_capacity(2);
        for slot in 0..2u8 {
            let mut buf = vec![0u8; block_size as usize];
            if file.read_exact_at(&mut buf, slot as u64 * block_size).is_err() {
                continue;
            }
            if let Some(on_disk) =
                WalHeaderOnDisk::read_from_prefix(&buf[..std::mem::size_of::<WalHeaderOnDisk>()])
            {
                if on_disk.verify() {
                    candidates.push((WalHeader::from_on_disk(&on_disk), slot));
                }
            }
        }

        Ok(candidates
            .into_iter()
            .max_by_key(|(h, _)| h.last_write_ts)
            .map(|(h, slot)| (h, 1 - slot)))
    }
}

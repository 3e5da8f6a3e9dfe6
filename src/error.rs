//! Crate-wide error taxonomy (spec §7).

use std::io;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// WAL ring is full; retryable after a `trim`.
    #[error("wal is over capacity")]
    OverCapacity,

    /// Log cache is at its configured limit; retryable after upload progress.
    #[error("log cache is full")]
    CacheFull,

    /// Operation invoked before `start` completed, or after `shutdown`.
    #[error("wal is not ready")]
    NotReady,

    /// A WAL header slot failed its magic/CRC check during recovery.
    #[error("wal header is corrupt: {0}")]
    CorruptHeader(&'static str),

    /// A record frame failed a decode or verification check during recovery.
    #[error("wal record is corrupt: {0}")]
    CorruptRecord(#[from] DecodeError),

    /// The recovered head of a stream exceeds the metadata service's recorded end offset: a
    /// detected integrity violation, not an ordinary recovery gap.
    #[error("data loss detected: stream {stream} recovered base_offset {recovered_base} exceeds opening end_offset {opening_end}")]
    DataLoss {
        stream: u64,
        recovered_base: u64,
        opening_end: u64,
    },

    /// A `trim` precondition was violated (trimming not-yet-flushed records).
    #[error("trim target {offset} is not below window_start_offset {window_start_offset}")]
    InvalidTrim {
        offset: u64,
        window_start_offset: u64,
    },

    /// Transient failure from the block channel.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Transient failure talking to the object store.
    #[error("network error: {0}")]
    Network(String),

    /// Terminal: a commit to the metadata service failed after internal retries. The caller
    /// should treat the process as crippled and restart to recover via WAL.
    #[error("upload commit failed irrecoverably: {0}")]
    UploadCommitFailed(String),
}

impl Error {
    pub fn is_retryable_backoff(&self) -> bool {
        matches!(self, Error::OverCapacity | Error::CacheFull)
    }
}

/// Errors produced while decoding a record frame (spec §4.3).
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("bad magic number")]
    Magic,
    #[error("header crc mismatch")]
    HeaderCrc,
    #[error("body crc mismatch")]
    BodyCrc,
    #[error("invalid body_length")]
    BodyLength,
    #[error("body_offset does not match record_offset + header_size")]
    OffsetMismatch,
    #[error("record body too short to contain its stream-routing envelope")]
    Envelope,
}

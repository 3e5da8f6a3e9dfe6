//! Core data model shared across the WAL, cache, sequencer and upload pipeline (spec §3).

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::{DecodeError, Error};

/// Identifies a stream whose records are multiplexed through the WAL and log cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// The unit of durability (spec §3). `payload` is immutable once handed to the core.
#[derive(Debug, Clone)]
pub struct StreamRecordBatch {
    pub stream_id: StreamId,
    pub base_offset: u64,
    /// Exclusive.
    pub last_offset: u64,
    pub payload: Bytes,
    pub encoded_size: u32,
}

impl StreamRecordBatch {
    pub fn new(
        stream_id: StreamId,
        base_offset: u64,
        last_offset: u64,
        payload: Bytes,
    ) -> Result<Self, InvalidBatch> {
        if last_offset <= base_offset {
            return Err(InvalidBatch { base_offset, last_offset });
        }
        let encoded_size = payload.len() as u32;
        Ok(Self {
            stream_id,
            base_offset,
            last_offset,
            payload,
            encoded_size,
        })
    }

    pub fn record_count(&self) -> u64 {
        self.last_offset - self.base_offset
    }

    /// Serializes this batch's stream-routing metadata together with its payload into the bytes
    /// handed to the WAL as a record's body. The record frame itself (spec §4.3) carries no
    /// stream identity, so recovery (spec §4.5 "Gap semantics") needs this envelope to reconstruct
    /// which stream and offsets a recovered record belongs to.
    pub fn encode_envelope(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENVELOPE_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.stream_id.0.to_le_bytes());
        out.extend_from_slice(&self.base_offset.to_le_bytes());
        out.extend_from_slice(&self.last_offset.to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Inverse of `encode_envelope`.
    pub fn decode_envelope(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < ENVELOPE_HEADER_LEN {
            return Err(DecodeError::Envelope);
        }
        let stream_id = StreamId(u64::from_le_bytes(bytes[0..8].try_into().unwrap()));
        let base_offset = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
        let last_offset = u64::from_le_bytes(bytes[16..24].try_into().unwrap());
        let payload = Bytes::copy_from_slice(&bytes[ENVELOPE_HEADER_LEN..]);
        let encoded_size = payload.len() as u32;
        Ok(Self {
            stream_id,
            base_offset,
            last_offset,
            payload,
            encoded_size,
        })
    }
}

const ENVELOPE_HEADER_LEN: usize = 24;

#[derive(Debug, thiserror::Error)]
#[error("invalid batch: last_offset {last_offset} must be greater than base_offset {base_offset}")]
pub struct InvalidBatch {
    pub base_offset: u64,
    pub last_offset: u64,
}

/// An in-memory, mutable group of records from many streams awaiting upload (spec §3, §4.6).
#[derive(Debug, Default)]
pub struct CacheBlock {
    pub streams: BTreeMap<StreamId, Vec<StreamRecordBatch>>,
    pub byte_size: u64,
    /// Set when the block is sealed: the WAL confirm offset as of sealing.
    pub confirm_offset: Option<u64>,
}

impl CacheBlock {
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn contains_stream(&self, stream_id: StreamId) -> bool {
        self.streams.contains_key(&stream_id)
    }

    pub fn push(&mut self, batch: StreamRecordBatch) {
        self.byte_size += batch.encoded_size as u64;
        self.streams.entry(batch.stream_id).or_default().push(batch);
    }
}

/// A record handed to the WAL, together with its assigned logical offset and a completion
/// signal. Owned exclusively by the sliding window committer between `before` and `after`
/// (spec §3 "Ownership").
pub struct WalWriteRequest {
    pub stream_id: StreamId,
    pub batch: StreamRecordBatch,
    /// Logical offset assigned by the sliding window at append time.
    pub offset: u64,
    pub persisted: bool,
    pub(crate) completion: Option<oneshot::Sender<Result<(), Error>>>,
}

impl WalWriteRequest {
    pub fn new(
        stream_id: StreamId,
        batch: StreamRecordBatch,
        offset: u64,
    ) -> (Self, oneshot::Receiver<Result<(), Error>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                stream_id,
                batch,
                offset,
                persisted: false,
                completion: Some(tx),
            },
            rx,
        )
    }

    pub fn complete(&mut self, result: Result<(), Error>) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(result);
        }
    }
}

impl fmt::Debug for WalWriteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalWriteRequest")
            .field("stream_id", &self.stream_id)
            .field("offset", &self.offset)
            .field("persisted", &self.persisted)
            .finish()
    }
}

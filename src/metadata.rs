//! Metadata/topic service client interface (spec §1 "out of scope" collaborator; added as C11).
//!
//! The durability core never implements the topic/queue/consumer-group metadata service itself —
//! it only calls into it. This module defines the seam (`MetadataClient`) the way the teacher
//! defines `storage::backend::Backend` as the seam to the object store, plus an in-memory fake
//! (`InMemoryMetadata`) used by the test suite, mirroring the teacher's `TestBackend` pattern.

#[cfg(any(test, feature = "test-util"))]
use std::collections::HashMap;

#[cfg(any(test, feature = "test-util"))]
use parking_lot::Mutex;

use crate::error::Result;
use crate::model::StreamId;

/// One of the streams open at broker start, with the offset recovery must not regress past.
#[derive(Debug, Clone, Copy)]
pub struct OpeningStream {
    pub stream_id: StreamId,
    pub epoch: u64,
    /// Exclusive end offset the metadata service has already committed for this stream.
    /// If recovery finds a lower base_offset for this stream it is a routine gap; if it finds a
    /// *higher* one, that is `Error::DataLoss` (spec §4.5 "Gap semantics").
    pub end_offset: u64,
}

/// One contiguous range of one stream's records held inside a single uploaded object.
#[derive(Debug, Clone, Copy)]
pub struct ObjectStreamRange {
    pub stream_id: StreamId,
    pub base_offset: u64,
    pub last_offset: u64,
}

/// Sent to `commit_wal_object` once an object's multipart upload has completed.
#[derive(Debug, Clone)]
pub struct CommitWalObjectRequest {
    pub object_id: u64,
    pub streams: Vec<ObjectStreamRange>,
}

/// A previously committed object, as known to the metadata service.
#[derive(Debug, Clone)]
pub struct ServerObject {
    pub object_id: u64,
    pub streams: Vec<ObjectStreamRange>,
}

#[derive(Debug, Clone, Copy)]
pub struct StreamMeta {
    pub stream_id: StreamId,
    pub epoch: u64,
    pub end_offset: u64,
}

/// The interface the durability core calls into the topic/queue metadata service (spec §1).
pub trait MetadataClient: Send + Sync + 'static {
    async fn get_opening_streams(&self) -> Result<Vec<OpeningStream>>;

    /// Reserves `count` consecutive object ids, valid for `ttl`. Returns the first id in the
    /// reserved range; the caller assigns ids to objects in prepare-order (spec §4.9 invariant
    /// (a): commit order then equals id order).
    async fn prepare_object(&self, count: u32, ttl: std::time::Duration) -> Result<u64>;

    async fn commit_wal_object(&self, request: CommitWalObjectRequest) -> Result<()>;

    async fn get_server_objects(&self) -> Result<Vec<ServerObject>>;

    async fn get_streams(&self, ids: &[StreamId]) -> Result<Vec<StreamMeta>>;

    async fn close_stream(&self, id: StreamId, epoch: u64) -> Result<()>;
}

#[cfg(any(test, feature = "test-util"))]
struct Inner {
    next_object_id: u64,
    opening_streams: Vec<OpeningStream>,
    committed: Vec<ServerObject>,
    streams: HashMap<StreamId, StreamMeta>,
    closed: Vec<(StreamId, u64)>,
}

/// In-memory fake of the metadata service, for use by tests only (spec SPEC_FULL §2).
#[cfg(any(test, feature = "test-util"))]
pub struct InMemoryMetadata {
    inner: Mutex<Inner>,
}

#[cfg(any(test, feature = "test-util"))]
impl Default for InMemoryMetadata {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[cfg(any(test, feature = "test-util"))]
impl InMemoryMetadata {
    pub fn new(opening_streams: Vec<OpeningStream>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_object_id: 1,
                opening_streams,
                committed: Vec::new(),
                streams: HashMap::new(),
                closed: Vec::new(),
            }),
        }
    }

    pub fn committed_objects(&self) -> Vec<ServerObject> {
        self.inner.lock().committed.clone()
    }

    pub fn commit_count(&self) -> usize {
        self.inner.lock().committed.len()
    }
}

#[cfg(any(test, feature = "test-util"))]
impl MetadataClient for InMemoryMetadata {
    async fn get_opening_streams(&self) -> Result<Vec<OpeningStream>> {
        Ok(self.inner.lock().opening_streams.clone())
    }

    async fn prepare_object(&self, count: u32, _ttl: std::time::Duration) -> Result<u64> {
        let mut inner = self.inner.lock();
        let first = inner.next_object_id;
        inner.next_object_id += count as u64;
        Ok(first)
    }

    async fn commit_wal_object(&self, request: CommitWalObjectRequest) -> Result<()> {
        let mut inner = self.inner.lock();
        for range in &request.streams {
            inner.streams.insert(
                range.stream_id,
                StreamMeta {
                    stream_id: range.stream_id,
                    epoch: 0,
                    end_offset: range.last_offset,
                },
            );
        }
        inner.committed.push(ServerObject {
            object_id: request.object_id,
            streams: request.streams,
        });
        Ok(())
    }

    async fn get_server_objects(&self) -> Result<Vec<ServerObject>> {
        Ok(self.inner.lock().committed.clone())
    }

    async fn get_streams(&self, ids: &[StreamId]) -> Result<Vec<StreamMeta>> {
        let inner = self.inner.lock();
        Ok(ids.iter().filter_map(|id| inner.streams.get(id).copied()).collect())
    }

    async fn close_stream(&self, id: StreamId, epoch: u64) -> Result<()> {
        self.inner.lock().closed.push((id, epoch));
        Ok(())
    }
}

//! Object-store client interface (spec §1 "out of scope" collaborator; added as C12).
//!
//! Grounded on the teacher's `storage::backend::Backend` seam and its S3 implementation
//! (`storage::backend::s3::S3Backend`, `put_object`/`get_object` via `aws-sdk-s3`): same idea of a
//! trait the core depends on without owning the remote service, generalized here from
//! put-whole-object to a multipart put/complete protocol (spec §4.9 "opens a multipart upload").

use bytes::Bytes;

use crate::error::Result;

/// Handle to an open multipart upload. Opaque to the core; the object store client fills in
/// whatever it needs to complete or abort the upload later.
#[derive(Debug, Clone)]
pub struct MultipartUploadHandle {
    pub object_id: String,
    pub upload_id: String,
}

/// Returned by `put_part`; handed back to `complete_multipart` in part order.
#[derive(Debug, Clone)]
pub struct PartHandle {
    pub part_number: u32,
    pub e_tag: String,
}

/// The interface the durability core calls into the object-store client (spec §1, §4.9).
pub trait ObjectStoreClient: Send + Sync + 'static {
    async fn create_multipart(&self, object_id: &str) -> Result<MultipartUploadHandle>;

    async fn put_part(
        &self,
        upload: &MultipartUploadHandle,
        part_number: u32,
        data: Bytes,
    ) -> Result<PartHandle>;

    async fn complete_multipart(
        &self,
        upload: MultipartUploadHandle,
        parts: Vec<PartHandle>,
    ) -> Result<()>;

    async fn get_range(&self, object_id: &str, start: u64, end: u64) -> Result<Bytes>;

    async fn delete_objects(&self, object_ids: &[String]) -> Result<()>;
}

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use std::collections::HashMap;

    use parking_lot::Mutex;

    use super::*;
    use crate::error::Error;

    struct PendingUpload {
        parts: HashMap<u32, Bytes>,
    }

    struct Inner {
        pending: HashMap<String, PendingUpload>,
        committed: HashMap<String, Bytes>,
    }

    /// In-memory fake of the object-store client, for use by tests only.
    pub struct InMemoryObjectStore {
        inner: Mutex<Inner>,
    }

    impl Default for InMemoryObjectStore {
        fn default() -> Self {
            Self {
                inner: Mutex::new(Inner {
                    pending: HashMap::new(),
                    committed: HashMap::new(),
                }),
            }
        }
    }

    impl InMemoryObjectStore {
        pub fn get_committed(&self, object_id: &str) -> Option<Bytes> {
            self.inner.lock().committed.get(object_id).cloned()
        }

        pub fn committed_count(&self) -> usize {
            self.inner.lock().committed.len()
        }
    }

    impl ObjectStoreClient for InMemoryObjectStore {
        async fn create_multipart(&self, object_id: &str) -> Result<MultipartUploadHandle> {
            let mut inner = self.inner.lock();
            inner.pending.insert(
                object_id.to_string(),
                PendingUpload {
                    parts: HashMap::new(),
                },
            );
            Ok(MultipartUploadHandle {
                object_id: object_id.to_string(),
                upload_id: format!("fake-upload-{object_id}"),
            })
        }

        async fn put_part(
            &self,
            upload: &MultipartUploadHandle,
            part_number: u32,
            data: Bytes,
        ) -> Result<PartHandle> {
            let mut inner = self.inner.lock();
            let pending = inner
                .pending
                .get_mut(&upload.object_id)
                .ok_or_else(|| Error::Network("no such multipart upload".into()))?;
            pending.parts.insert(part_number, data);
            Ok(PartHandle {
                part_number,
                e_tag: format!("fake-etag-{part_number}"),
            })
        }

        async fn complete_multipart(
            &self,
            upload: MultipartUploadHandle,
            mut parts: Vec<PartHandle>,
        ) -> Result<()> {
            let mut inner = self.inner.lock();
            let pending = inner
                .pending
                .remove(&upload.object_id)
                .ok_or_else(|| Error::Network("no such multipart upload".into()))?;
            parts.sort_by_key(|p| p.part_number);
            let mut full = Vec::new();
            for part in &parts {
                let data = pending
                    .parts
                    .get(&part.part_number)
                    .ok_or_else(|| Error::Network("missing uploaded part".into()))?;
                full.extend_from_slice(data);
            }
            inner.committed.insert(upload.object_id, Bytes::from(full));
            Ok(())
        }

        async fn get_range(&self, object_id: &str, start: u64, end: u64) -> Result<Bytes> {
            let inner = self.inner.lock();
            let full = inner
                .committed
                .get(object_id)
                .ok_or_else(|| Error::Network("no such object".into()))?;
            Ok(full.slice(start as usize..end as usize))
        }

        async fn delete_objects(&self, object_ids: &[String]) -> Result<()> {
            let mut inner = self.inner.lock();
            for id in object_ids {
                inner.committed.remove(id);
            }
            Ok(())
        }
    }

    #[cfg(test)]
    mod test {
        use super::*;

        #[tokio::test]
        async fn multipart_round_trip() {
            let store = InMemoryObjectStore::default();
            let upload = store.create_multipart("obj-1").await.unwrap();
            let p1 = store
                .put_part(&upload, 0, Bytes::from_static(b"hello "))
                .await
                .unwrap();
            let p2 = store
                .put_part(&upload, 1, Bytes::from_static(b"world"))
                .await
                .unwrap();
            store
                .complete_multipart(upload, vec![p2, p1])
                .await
                .unwrap();
            let got = store.get_range("obj-1", 0, 11).await.unwrap();
            assert_eq!(&got[..], b"hello world");
        }
    }
}

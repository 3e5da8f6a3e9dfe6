//! Callback Sequencer (C7): turns out-of-order WAL physical acknowledgements into in-order
//! per-stream and global confirm offsets (spec §4.7).
//!
//! Implemented as short critical sections on a mutex guarding the two maps, per the design note
//! that this may be "a message queue drained by one worker, or... a mutex guarding the two maps."

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::model::{StreamId, StreamRecordBatch};

struct Entry {
    batch: Option<StreamRecordBatch>,
    /// The WAL logical offset one past this record's frame; used to advance the global confirm
    /// offset once this entry and everything before it in submission order is persisted.
    end_offset: u64,
    persisted: bool,
}

struct Inner {
    global: VecDeque<u64>,
    per_stream: HashMap<StreamId, VecDeque<u64>>,
    store: HashMap<u64, Entry>,
    wal_confirm_offset: u64,
}

pub struct CallbackSequencer {
    inner: Mutex<Inner>,
}

impl CallbackSequencer {
    pub fn new(initial_confirm_offset: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                global: VecDeque::new(),
                per_stream: HashMap::new(),
                store: HashMap::new(),
                wal_confirm_offset: initial_confirm_offset,
            }),
        }
    }

    /// Called before WAL dispatch; enqueues into both the global and per-stream FIFOs.
    pub fn before(&self, offset: u64, end_offset: u64, batch: StreamRecordBatch) {
        let mut inner = self.inner.lock();
        let stream_id = batch.stream_id;
        inner.store.insert(
            offset,
            Entry {
                batch: Some(batch),
                end_offset,
                persisted: false,
            },
        );
        inner.global.push_back(offset);
        inner.per_stream.entry(stream_id).or_default().push_back(offset);
    }

    /// Called when the WAL signals `offset` durable. Returns the updated global WAL confirm
    /// offset and the consecutive persisted prefix of `offset`'s stream (possibly empty, if
    /// earlier records in that stream are still outstanding).
    pub fn after(&self, offset: u64) -> (u64, Vec<StreamRecordBatch>) {
        let mut inner = self.inner.lock();

        let stream_id = match inner.store.get_mut(&offset) {
            Some(entry) => {
                entry.persisted = true;
                entry.batch.as_ref().unwrap().stream_id
            }
            None => return (inner.wal_confirm_offset, Vec::new()),
        };

        while let Some(&front) = inner.global.front() {
            let persisted = inner.store.get(&front).map(|e| e.persisted).unwrap_or(false);
            if persisted {
                inner.wal_confirm_offset = inner.store[&front].end_offset;
                inner.global.pop_front();
            } else {
                break;
            }
        }

        let mut ready = Vec::new();
        let is_head = inner
            .per_stream
            .get(&stream_id)
            .and_then(|q| q.front())
            .copied()
            == Some(offset);
        if is_head {
            let queue = inner.per_stream.get_mut(&stream_id).unwrap();
            while let Some(&head) = queue.front() {
                let done = inner.store.get(&head).map(|e| e.persisted).unwrap_or(false);
                if !done {
                    break;
                }
                queue.pop_front();
                if let Some(entry) = inner.store.remove(&head) {
                    ready.push(entry.batch.unwrap());
                }
            }
        }

        (inner.wal_confirm_offset, ready)
    }

    pub fn wal_confirm_offset(&self) -> u64 {
        self.inner.lock().wal_confirm_offset
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;

    fn batch(stream: u64, base: u64) -> StreamRecordBatch {
        StreamRecordBatch::new(StreamId(stream), base, base + 1, Bytes::from_static(b"x")).unwrap()
    }

    #[test]
    fn out_of_order_completion_yields_in_order_stream_delivery() {
        let seq = CallbackSequencer::new(0);
        seq.before(0, 10, batch(1, 0));
        seq.before(10, 20, batch(1, 1));

        // Second record's WAL write finishes first.
        let (_, ready) = seq.after(10);
        assert!(ready.is_empty(), "must wait for offset 0 first");

        let (confirm, ready) = seq.after(0);
        assert_eq!(confirm, 20);
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].base_offset, 0);
        assert_eq!(ready[1].base_offset, 1);
    }

    #[test]
    fn independent_streams_do_not_block_each_other() {
        let seq = CallbackSequencer::new(0);
        seq.before(0, 10, batch(1, 0));
        seq.before(10, 20, batch(2, 0));

        let (_, ready) = seq.after(10);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].stream_id, StreamId(2));
    }

    #[test]
    fn global_confirm_offset_stalls_on_earliest_gap() {
        let seq = CallbackSequencer::new(0);
        seq.before(0, 10, batch(1, 0));
        seq.before(10, 20, batch(2, 0));
        seq.before(20, 30, batch(3, 0));

        let (confirm, _) = seq.after(10);
        assert_eq!(confirm, 0, "offset 0 not yet persisted, global confirm must not advance");
        let (confirm, _) = seq.after(20);
        assert_eq!(confirm, 0);
        let (confirm, _) = seq.after(0);
        assert_eq!(confirm, 30, "all three now contiguous");
    }
}

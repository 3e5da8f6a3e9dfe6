//! Property-based test for P1 (spec §8): the WAL confirm offset is monotone non-decreasing
//! across any append sequence, regardless of which streams or sizes are interleaved.

mod common;

use bytes::Bytes;
use common::test_config;
use durably::io::StdIo;
use durably::model::{StreamId, StreamRecordBatch};
use durably::wal::BlockWalService;
use proptest::prelude::*;

type Wal = BlockWalService<std::fs::File, StdIo>;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(20))]

    #[test]
    fn wal_confirm_offset_is_monotone_across_random_append_order(
        sizes in proptest::collection::vec(1usize..64, 1..40),
        stream_picks in proptest::collection::vec(0u64..4, 1..40),
    ) {
        common::init_tracing();
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("wal.bin");
            let config = test_config(path, 4 << 20, 4096);
            let wal = Wal::start(StdIo, config).await.unwrap();
            assert!(!wal.recover().has_next());
            wal.reset().await.unwrap();

            let mut next_base = std::collections::HashMap::<u64, u64>::new();
            let mut last_confirm = wal.confirm_offset();
            let n = sizes.len().min(stream_picks.len());
            for i in 0..n {
                let stream = stream_picks[i] % 4;
                let base = *next_base.entry(stream).or_insert(0);
                let payload = vec![0xABu8; sizes[i]];
                let record_batch =
                    StreamRecordBatch::new(StreamId(stream), base, base + 1, Bytes::from(payload))
                        .unwrap();
                next_base.insert(stream, base + 1);

                let (_offset, rx) = wal.append(record_batch).await.unwrap();
                rx.await.unwrap().unwrap();

                let confirm = wal.confirm_offset();
                assert!(
                    confirm >= last_confirm,
                    "confirm offset regressed: {last_confirm} -> {confirm}"
                );
                last_confirm = confirm;
            }
        });
    }
}

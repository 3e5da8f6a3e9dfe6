//! Spec §4.5 "Gap semantics" / P3: a recovered stream head that exceeds the metadata service's
//! committed end offset is a detected integrity violation, not an ordinary recovery gap.

mod common;

use std::sync::Arc;

use common::{batch, test_config};
use durably::error::Error;
use durably::io::StdIo;
use durably::metadata::{InMemoryMetadata, OpeningStream};
use durably::metrics::Metrics;
use durably::model::StreamId;
use durably::object_store::fake::InMemoryObjectStore;
use durably::orchestrator::StorageOrchestrator;
use durably::upload::UploadPipelineConfig;
use durably::wal::BlockWalService;

type Wal = BlockWalService<std::fs::File, StdIo>;

#[tokio::test]
async fn recovered_head_within_the_committed_end_offset_passes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wal.bin");
    let config = test_config(path, 1 << 20, 4096);

    let wal = Wal::start(StdIo, config).await.unwrap();
    assert!(!wal.recover().has_next());
    wal.reset().await.unwrap();

    for i in 0..5u64 {
        let (_offset, rx) = wal.append(batch(1, i, b"ok")).await.unwrap();
        rx.await.unwrap().unwrap();
    }

    // Metadata already has this stream committed up through offset 5: recovery finding a head at
    // base_offset 0 is an ordinary (harmless) overlap, not a gap.
    let metadata = InMemoryMetadata::new(vec![OpeningStream {
        stream_id: StreamId(1),
        epoch: 0,
        end_offset: 5,
    }]);

    wal.validate_recovery_against_metadata(&metadata).await.unwrap();
}

#[tokio::test]
async fn recovered_head_past_the_committed_end_offset_is_data_loss() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wal.bin");
    let config = test_config(path, 1 << 20, 4096);

    let wal = Wal::start(StdIo, config).await.unwrap();
    assert!(!wal.recover().has_next());
    wal.reset().await.unwrap();

    for i in 10..15u64 {
        let (_offset, rx) = wal.append(batch(1, i, b"late")).await.unwrap();
        rx.await.unwrap().unwrap();
    }

    // Metadata expects this stream to resume at offset 3 (nothing committed past it yet), but the
    // WAL's earliest surviving record for stream 1 starts at offset 10: records 3..10 are simply
    // gone.
    let metadata = InMemoryMetadata::new(vec![OpeningStream {
        stream_id: StreamId(1),
        epoch: 0,
        end_offset: 3,
    }]);

    let err = wal
        .validate_recovery_against_metadata(&metadata)
        .await
        .unwrap_err();
    match err {
        Error::DataLoss { stream, recovered_base, opening_end } => {
            assert_eq!(stream, 1);
            assert_eq!(recovered_base, 10);
            assert_eq!(opening_end, 3);
        }
        other => panic!("expected Error::DataLoss, got {other:?}"),
    }
}

#[tokio::test]
async fn streams_with_no_opening_entry_are_not_checked() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wal.bin");
    let config = test_config(path, 1 << 20, 4096);

    let wal = Wal::start(StdIo, config).await.unwrap();
    assert!(!wal.recover().has_next());
    wal.reset().await.unwrap();

    let (_offset, rx) = wal.append(batch(9, 100, b"unopened-stream")).await.unwrap();
    rx.await.unwrap().unwrap();

    let metadata = InMemoryMetadata::default();
    wal.validate_recovery_against_metadata(&metadata).await.unwrap();
}

#[tokio::test]
async fn storage_orchestrator_start_fails_fast_on_a_detected_gap() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wal.bin");
    let config = test_config(path.clone(), 1 << 20, 4096);

    // Generation 1 writes stream 3's records 20..25 and shuts down gracefully, so the WAL's own
    // recovery is perfectly intact. The gap is purely in what the metadata service expects: it
    // claims stream 3 is only committed through offset 1, so records 1..20 are missing entirely.
    {
        let wal = Wal::start(StdIo, config.clone()).await.unwrap();
        assert!(!wal.recover().has_next());
        wal.reset().await.unwrap();
        for i in 20..25u64 {
            let (_offset, rx) = wal.append(batch(3, i, b"r")).await.unwrap();
            rx.await.unwrap().unwrap();
        }
        assert!(wal.shutdown_gracefully().await);
    }

    let metadata = Arc::new(InMemoryMetadata::new(vec![OpeningStream {
        stream_id: StreamId(3),
        epoch: 0,
        end_offset: 1,
    }]));
    let object_store = Arc::new(InMemoryObjectStore::default());
    let metrics = Arc::new(Metrics::default());

    let result = StorageOrchestrator::start(
        StdIo,
        config,
        metadata,
        object_store,
        metrics,
        UploadPipelineConfig {
            object_prepare_ttl: std::time::Duration::from_secs(3600),
            network_retry_attempts: 3,
        },
    )
    .await;

    match result {
        Err(Error::DataLoss { stream, recovered_base, opening_end }) => {
            assert_eq!(stream, 3);
            assert_eq!(recovered_base, 20);
            assert_eq!(opening_end, 1);
        }
        Err(other) => panic!("expected Error::DataLoss, got {other:?}"),
        Ok(_) => panic!("expected StorageOrchestrator::start to fail fast on a detected gap"),
    }
}

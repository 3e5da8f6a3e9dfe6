//! Recovery behavior of the Block WAL Service: empty-device bootstrap, surviving an ungraceful
//! shutdown whose header predates the last appends, and header-slot corruption resilience.

mod common;

use common::{batch, test_config};
use durably::codec;
use durably::header::HeaderSlots;
use durably::io::{FileExt, StdIo};
use durably::model::StreamRecordBatch;
use durably::recovery::RecoverResult;
use durably::wal::BlockWalService;

/// Decodes each recovered record's envelope back to the payload bytes originally appended (the
/// on-disk body carries stream-routing metadata alongside the payload; see
/// `StreamRecordBatch::encode_envelope`).
fn recovered_bodies<F: FileExt>(service: &BlockWalService<F, StdIo>) -> Vec<Vec<u8>> {
    let mut it = service.recover();
    let mut out = Vec::new();
    while it.has_next() {
        if let Some(RecoverResult::Record { body, .. }) = it.next() {
            out.push(StreamRecordBatch::decode_envelope(&body).unwrap().payload.to_vec());
        }
    }
    out
}

#[tokio::test]
async fn fresh_device_recovers_empty_then_round_trips_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wal.bin");
    let config = test_config(path, 1 << 20, 4096);

    let service = BlockWalService::<std::fs::File, StdIo>::start(StdIo, config.clone()).await.unwrap();
    assert!(!service.recover().has_next(), "fresh device must recover nothing");
    service.reset().await.unwrap();

    let (_offset, rx) = service.append(batch(1, 0, b"hello")).await.unwrap();
    rx.await.unwrap().unwrap();

    assert!(service.shutdown_gracefully().await);
    drop(service);

    let service = BlockWalService::<std::fs::File, StdIo>::start(StdIo, config).await.unwrap();
    let bodies = recovered_bodies(&service);
    service.reset().await.unwrap();

    assert_eq!(bodies, vec![b"hello".to_vec()]);
}

#[tokio::test]
async fn ungraceful_shutdown_recovers_records_appended_after_the_last_header_flush() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wal.bin");
    let config = test_config(path, 1 << 20, 4096);

    let service = BlockWalService::<std::fs::File, StdIo>::start(StdIo, config.clone()).await.unwrap();
    assert!(!service.recover().has_next());
    service.reset().await.unwrap();

    let mut bodies = Vec::new();
    for body in [&b"r0"[..], b"r1", b"r2"] {
        let (_offset, rx) = service.append(batch(1, bodies.len() as u64, body)).await.unwrap();
        rx.await.unwrap().unwrap();
        bodies.push(body.to_vec());
    }

    // Force a header flush capturing the window as of right now. `trim` unconditionally
    // schedules a flush even when the trim offset itself does not move.
    service.trim(0).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;

    // These appends are never reflected in any on-disk header: the process "crashes" before
    // the next flush would have captured them.
    for body in [&b"r3"[..], b"r4"] {
        let (_offset, rx) = service.append(batch(1, bodies.len() as u64, body)).await.unwrap();
        rx.await.unwrap().unwrap();
        bodies.push(body.to_vec());
    }

    // Simulate a crash: drop without `shutdown_gracefully`, so the on-disk header keeps
    // recording `ShutdownType::Ungraceful` and a stale `window_next_write_offset`.
    drop(service);

    let service = BlockWalService::<std::fs::File, StdIo>::start(StdIo, config).await.unwrap();
    let recovered = recovered_bodies(&service);
    service.reset().await.unwrap();

    assert_eq!(
        recovered, bodies,
        "ungraceful recovery scan must find records written after the last header flush"
    );
}

#[tokio::test]
async fn corrupted_newest_header_slot_falls_back_to_the_older_survivor_without_data_loss() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wal.bin");
    let config = test_config(path.clone(), 1 << 20, 4096);

    // Generation 1: one record, graceful shutdown. Its flush lands in slot 0.
    let service = BlockWalService::<std::fs::File, StdIo>::start(StdIo, config.clone()).await.unwrap();
    service.reset().await.unwrap();
    let (_offset, rx) = service.append(batch(1, 0, b"gen1")).await.unwrap();
    rx.await.unwrap().unwrap();
    assert!(service.shutdown_gracefully().await);
    drop(service);

    // Generation 2: recovers gen1's record, then advances past it (the one-block-gap reset),
    // appends its own record, graceful shutdown. Its flush lands in slot 1.
    let service = BlockWalService::<std::fs::File, StdIo>::start(StdIo, config.clone()).await.unwrap();
    let gen1_recovered = recovered_bodies(&service);
    assert_eq!(gen1_recovered, vec![b"gen1".to_vec()]);
    service.reset().await.unwrap();
    let (_offset, rx) = service.append(batch(1, 1, b"gen2")).await.unwrap();
    rx.await.unwrap().unwrap();
    assert!(service.shutdown_gracefully().await);
    drop(service);

    // Corrupt the newest slot (slot 1) directly on disk.
    let block_size = 4096u64;
    let raw = std::fs::OpenOptions::new().read(true).write(true).open(&path).unwrap();
    raw.write_all_at(&vec![0u8; block_size as usize], block_size).unwrap();
    drop(raw);

    // Generation 3 must still start: recovery falls back to slot 0 (gen1's header), so gen2's
    // own record is invisible (its header never survived), but nothing panics or errors out.
    let service = BlockWalService::<std::fs::File, StdIo>::start(StdIo, config.clone()).await.unwrap();
    let recovered = recovered_bodies(&service);
    assert_eq!(
        recovered,
        vec![b"gen1".to_vec()],
        "must recover the older surviving header's view when the newest slot is corrupt"
    );
    service.reset().await.unwrap();
    assert!(service.shutdown_gracefully().await);
    drop(service);

    // Self-healing: slot 1, previously zeroed, has since been rewritten with a valid header by
    // generation 3's shutdown flush. Zero slot 0 this time and confirm slot 1 alone now
    // recovers cleanly.
    let raw = std::fs::OpenOptions::new().read(true).write(true).open(&path).unwrap();
    raw.write_all_at(&vec![0u8; block_size as usize], 0).unwrap();
    let recovered = HeaderSlots::recover(&raw, block_size).unwrap();
    assert!(
        recovered.is_some(),
        "the previously-corrupt slot must have been rewritten with a valid header"
    );
}

#[tokio::test]
async fn record_at_the_physical_wrap_point_recovers_over_stale_data_from_the_prior_lap() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wal.bin");
    let io = StdIo;

    // A two-block record section: header_reserve=8192, record_section_capacity=8192.
    let channel = durably::block_channel::BlockChannel::open(&io, &path, 8192 + 8192, 4096).unwrap();
    let geometry = durably::sliding_window::RingGeometry {
        header_reserve: 8192,
        record_section_capacity: 8192,
        block_size: 4096,
    };

    // First lap: a stale record at the very start of the record section (logical offset 8192,
    // physical offset 8192).
    let stale = codec::encode(b"stale-from-lap-0", None, 8192);
    let mut stale_block = stale.clone();
    stale_block.resize(geometry.align_up(stale.len() as u64) as usize, 0);
    channel.write(&stale_block, geometry.physical_of(8192)).unwrap();

    // One full lap later, a fresh record is written at logical offset 16384. Its physical
    // address wraps back to exactly where the stale record lives (8192 mod 8192 == 0).
    let fresh_offset = 8192 + 8192;
    assert_eq!(geometry.physical_of(fresh_offset), geometry.physical_of(8192));
    let fresh = codec::encode(b"fresh-after-wrap", None, fresh_offset);
    let mut fresh_block = fresh.clone();
    fresh_block.resize(geometry.align_up(fresh.len() as u64) as usize, 0);
    channel.write(&fresh_block, geometry.physical_of(fresh_offset)).unwrap();

    // Recovering starting exactly at the wrapped offset must read the fresh record, not the
    // stale one that used to occupy the same physical bytes.
    let mut it = durably::recovery::RecoveryIterator::new(
        &channel,
        geometry,
        fresh_offset,
        fresh_offset + fresh_block.len() as u64,
    );
    assert!(it.has_next());
    match it.next().unwrap() {
        RecoverResult::Record { offset, body, .. } => {
            assert_eq!(offset, fresh_offset);
            assert_eq!(body, b"fresh-after-wrap");
        }
        other => panic!("expected the wrapped record, got {other:?}"),
    }

    // A decode attempt at the stale record's own (now superseded) logical offset is rejected:
    // the bytes now physically there embed `body_offset` for lap 1, which does not match the
    // lap-0 offset this reader asks for. Without this check a reader racing a wrap could
    // silently hand back a record tagged with the wrong identity.
    let mut stale_reader = durably::recovery::RecoveryIterator::new(&channel, geometry, 8192, 8192 + 1);
    match stale_reader.next().unwrap() {
        RecoverResult::Skipped { offset, .. } => assert_eq!(offset, 8192),
        other => panic!("expected the mismatched lap-0 read to be rejected, got {other:?}"),
    }
}

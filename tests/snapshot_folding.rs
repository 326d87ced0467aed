//! # Snapshot Folding Tests
//!
//! End-to-end: commit overwrites, wait for durability, trigger a snapshot,
//! and verify the composed image — including the second-snapshot path that
//! must carry unchanged data forward.
//!
//! ## Requirements Tested
//!
//! - R1: a snapshot taken at `until_epoch` past the last commit reflects
//!   every committed overwrite, with newest-wins on twice-written slots
//! - R2: slots never written stay zero in the image
//! - R3: `snapshot_epoch <= durable_global_epoch` at publication
//! - R4: a second snapshot with no intervening writes reproduces the same
//!   payloads (pointers may differ)
//! - R5: snapshot-isolation reads are served from the published image
//! - R6: restart restores volatile state from snapshot plus trailing log

use std::sync::Arc;

use emberdb::{Engine, EngineOptions, IsolationLevel};
use tempfile::tempdir;

const PAYLOAD: usize = 16;
const ARRAY_SIZE: u64 = 1024;

fn build_engine(root: &std::path::Path) -> (Engine, Arc<emberdb::ArrayStorage>) {
    let mut options = EngineOptions::with_root(root);
    options.thread.group_count = 1;
    options.thread.thread_count_per_group = 2;
    let engine = Engine::new(options).unwrap();
    let storage = engine
        .create_array("cells", PAYLOAD as u16, ARRAY_SIZE)
        .unwrap();
    let proc_storage = Arc::clone(&storage);
    engine
        .register_procedure("overwrite", move |ctx| {
            let offset = u64::from_le_bytes(ctx.input()[..8].try_into().unwrap());
            let fill = ctx.input()[8];
            ctx.begin(IsolationLevel::Serializable)?;
            ctx.overwrite(&proc_storage, offset, 0, &[fill; PAYLOAD])?;
            let id = ctx.commit()?;
            ctx.set_output(&id.raw().to_le_bytes())
        })
        .unwrap();
    let snap_storage = Arc::clone(&storage);
    engine
        .register_procedure("snapshot_read", move |ctx| {
            let offset = u64::from_le_bytes(ctx.input()[..8].try_into().unwrap());
            ctx.begin(IsolationLevel::Snapshot)?;
            let mut payload = [0u8; PAYLOAD];
            ctx.read(&snap_storage, offset, &mut payload)?;
            ctx.commit()?;
            ctx.set_output(&payload)
        })
        .unwrap();
    (engine, storage)
}

fn overwrite(engine: &Engine, offset: u64, fill: u8) -> emberdb::XctId {
    let mut input = [0u8; 9];
    input[..8].copy_from_slice(&offset.to_le_bytes());
    input[8] = fill;
    let session = engine.impersonate("overwrite", &input).unwrap();
    emberdb::XctId::from_raw(u64::from_le_bytes(
        session.output()[..8].try_into().unwrap(),
    ))
}

fn snapshot_payload(engine: &Engine, storage: &emberdb::ArrayStorage, offset: u64) -> [u8; PAYLOAD] {
    let mut out = [0u8; PAYLOAD];
    let found = engine
        .snapshot_manager()
        .read_array_record(storage, offset, &mut out)
        .unwrap();
    assert!(found, "snapshot must be published");
    out
}

#[test]
fn folded_snapshot_reflects_committed_overwrites() {
    let dir = tempdir().unwrap();
    let (engine, storage) = build_engine(dir.path());
    engine.start().unwrap();

    overwrite(&engine, 0, 0xA0);
    overwrite(&engine, 5, 0xB0);
    overwrite(&engine, 5, 0xC0);
    let last = overwrite(&engine, 1023, 0xD0);
    engine.wait_for_durable(last.epoch()).unwrap();

    let snapshot = engine
        .trigger_snapshot_immediate(true)
        .unwrap()
        .expect("waited trigger returns the snapshot");
    assert!(!snapshot.valid_until_epoch.is_before(last.epoch()));
    let durable = engine.log_manager().durable_global_epoch();
    assert!(!durable.is_before(engine.snapshot_manager().snapshot_epoch()));

    assert_eq!(snapshot_payload(&engine, &storage, 0), [0xA0; PAYLOAD]);
    assert_eq!(
        snapshot_payload(&engine, &storage, 5),
        [0xC0; PAYLOAD],
        "the later overwrite of slot 5 must win"
    );
    assert_eq!(snapshot_payload(&engine, &storage, 1023), [0xD0; PAYLOAD]);
    for untouched in [1u64, 4, 6, 100, 1000] {
        assert_eq!(
            snapshot_payload(&engine, &storage, untouched),
            [0u8; PAYLOAD],
            "slot {} was never written",
            untouched
        );
    }

    engine.stop().unwrap();
}

#[test]
fn snapshot_isolation_reads_come_from_the_image() {
    let dir = tempdir().unwrap();
    let (engine, _storage) = build_engine(dir.path());
    engine.start().unwrap();

    let first = overwrite(&engine, 10, 0x77);
    engine.wait_for_durable(first.epoch()).unwrap();
    engine.trigger_snapshot_immediate(true).unwrap();

    // A later volatile-only write must not leak into snapshot reads.
    overwrite(&engine, 10, 0x99);
    let session = engine
        .impersonate("snapshot_read", &10u64.to_le_bytes())
        .unwrap();
    assert_eq!(session.output(), vec![0x77; PAYLOAD]);

    engine.stop().unwrap();
}

#[test]
fn back_to_back_snapshots_are_equivalent() {
    let dir = tempdir().unwrap();
    let (engine, storage) = build_engine(dir.path());
    engine.start().unwrap();

    let probes: Vec<(u64, u8)> = vec![(0, 0x11), (5, 0x22), (200, 0x33), (1023, 0x44)];
    let mut last = emberdb::XctId::default();
    for &(offset, fill) in &probes {
        last = overwrite(&engine, offset, fill);
    }
    engine.wait_for_durable(last.epoch()).unwrap();

    let s1 = engine
        .trigger_snapshot_immediate(true)
        .unwrap()
        .unwrap();
    let payloads_s1: Vec<_> = probes
        .iter()
        .map(|&(offset, _)| snapshot_payload(&engine, &storage, offset))
        .collect();

    // No intervening writes: the second snapshot must read identically.
    let s2 = engine
        .trigger_snapshot_immediate(true)
        .unwrap()
        .unwrap();
    assert_eq!(s2.id, s1.id + 1);
    for (i, &(offset, fill)) in probes.iter().enumerate() {
        let payload = snapshot_payload(&engine, &storage, offset);
        assert_eq!(payload, payloads_s1[i]);
        assert_eq!(payload, [fill; PAYLOAD]);
    }

    engine.stop().unwrap();
}

#[test]
fn restart_restores_snapshot_then_replays_log() {
    let dir = tempdir().unwrap();
    {
        let (engine, _storage) = build_engine(dir.path());
        engine.start().unwrap();
        let snap_commit = overwrite(&engine, 20, 0x21);
        engine.wait_for_durable(snap_commit.epoch()).unwrap();
        engine.trigger_snapshot_immediate(true).unwrap();

        // Past-snapshot writes live only in the log.
        let tail = overwrite(&engine, 21, 0x42);
        engine.wait_for_durable(tail.epoch()).unwrap();
        engine.stop().unwrap();
    }

    let (engine, storage) = build_engine(dir.path());
    let stats = engine.recover().unwrap();
    assert!(stats.snapshot_records >= 1);
    assert!(stats.replayed_records >= 1);

    let mut out = [0u8; PAYLOAD];
    storage.read_record_dirty(20, &mut out);
    assert_eq!(out, [0x21; PAYLOAD], "from the snapshot image");
    storage.read_record_dirty(21, &mut out);
    assert_eq!(out, [0x42; PAYLOAD], "from the trailing log");
}

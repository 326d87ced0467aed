//! # Durability and Replay Tests
//!
//! Commits work through a real engine, waits on the durable-epoch fence,
//! then proves the log files alone reproduce the final state.
//!
//! ## Requirements Tested
//!
//! - R1: after `wait_for_durable(E)`, every logger's watermark covers `E`
//!   and the bytes are physically in the log files
//! - R2: a fresh engine over the same directory replays the durable log
//!   from offset 0 into the same final payload and version epoch
//! - R3: the savepoint written at shutdown carries the logger offsets the
//!   replay trusted
//! - R4: a restarted engine resumes with a global epoch past everything it
//!   recovered

use std::sync::Arc;

use emberdb::{Engine, EngineOptions, IsolationLevel, XctId};
use tempfile::tempdir;

const PAYLOAD: usize = 16;

fn build_engine(root: &std::path::Path) -> (Engine, Arc<emberdb::ArrayStorage>) {
    let mut options = EngineOptions::with_root(root);
    options.thread.group_count = 1;
    options.thread.thread_count_per_group = 2;
    let engine = Engine::new(options).unwrap();
    let storage = engine.create_array("ledger", PAYLOAD as u16, 256).unwrap();
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
    (engine, storage)
}

fn run_overwrite(engine: &Engine, offset: u64, fill: u8) -> XctId {
    let mut input = [0u8; 9];
    input[..8].copy_from_slice(&offset.to_le_bytes());
    input[8] = fill;
    let session = engine.impersonate("overwrite", &input).unwrap();
    XctId::from_raw(u64::from_le_bytes(session.output()[..8].try_into().unwrap()))
}

#[test]
fn hundred_commits_replay_to_final_payload() {
    let dir = tempdir().unwrap();

    let (final_id, final_epoch) = {
        let (engine, storage) = build_engine(dir.path());
        engine.start().unwrap();

        let mut last = XctId::default();
        for i in 0..100u32 {
            last = run_overwrite(&engine, 9, (i % 251) as u8 + 1);
        }
        engine.wait_for_durable(last.epoch()).unwrap();

        let durable = engine.log_manager().durable_global_epoch();
        assert!(durable.is_valid());
        assert!(!durable.is_before(last.epoch()));
        for logger in engine.log_manager().loggers() {
            assert!(!logger.durable_epoch().is_before(last.epoch()));
            assert!(logger.current_file_path().exists());
        }

        let mut out = [0u8; PAYLOAD];
        storage.read_record_dirty(9, &mut out);
        assert_eq!(out, [100u8; PAYLOAD]);
        engine.stop().unwrap();
        (last, storage.peek_version(9))
    };

    // Replay from offset 0 into a fresh engine.
    let (engine, storage) = build_engine(dir.path());
    let stats = engine.recover().unwrap();
    assert!(stats.replayed_records >= 100);

    let mut out = [0u8; PAYLOAD];
    storage.read_record_dirty(9, &mut out);
    assert_eq!(out, [100u8; PAYLOAD]);
    assert_eq!(storage.peek_version(9).epoch(), final_epoch.epoch());
    assert_eq!(storage.peek_version(9).ordinal(), final_id.ordinal());

    // The restarted clock is past everything recovered.
    assert!(final_id
        .epoch()
        .is_before(engine.xct_manager().current_global_epoch()));
}

#[test]
fn savepoint_written_at_shutdown_matches_files() {
    let dir = tempdir().unwrap();
    {
        let (engine, _storage) = build_engine(dir.path());
        engine.start().unwrap();
        let id = run_overwrite(&engine, 0, 0x42);
        engine.wait_for_durable(id.epoch()).unwrap();
        engine.stop().unwrap();
    }

    let savepoint =
        emberdb::savepoint::Savepoint::load(&dir.path().join("savepoint.xml"))
            .unwrap()
            .expect("shutdown must write a savepoint");
    assert!(savepoint.durable_global_epoch.is_valid());
    assert_eq!(savepoint.loggers.len(), 1);

    let logger = &savepoint.loggers[0];
    let log_file = dir
        .path()
        .join(format!("log/node_0_logger_0.{}", logger.current_ordinal));
    assert!(log_file.exists());
    let physical = std::fs::metadata(&log_file).unwrap().len();
    assert!(logger.durable_offset <= physical);
    assert_eq!(logger.durable_offset % 4096, 0);
}

#[test]
fn multiple_records_replay_independently() {
    let dir = tempdir().unwrap();
    {
        let (engine, _storage) = build_engine(dir.path());
        engine.start().unwrap();
        run_overwrite(&engine, 1, 0x11);
        run_overwrite(&engine, 2, 0x22);
        let last = run_overwrite(&engine, 3, 0x33);
        engine.wait_for_durable(last.epoch()).unwrap();
        engine.stop().unwrap();
    }

    let (engine, storage) = build_engine(dir.path());
    engine.recover().unwrap();
    for (offset, fill) in [(1u64, 0x11u8), (2, 0x22), (3, 0x33)] {
        let mut out = [0u8; PAYLOAD];
        storage.read_record_dirty(offset, &mut out);
        assert_eq!(out, [fill; PAYLOAD], "record {} must replay", offset);
    }
    let mut untouched = [0u8; PAYLOAD];
    storage.read_record_dirty(0, &mut untouched);
    assert_eq!(untouched, [0u8; PAYLOAD]);
}

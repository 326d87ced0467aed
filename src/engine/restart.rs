//! # Restart
//!
//! Rebuilds the volatile state of every registered storage from durable
//! state: first the latest snapshot image (if the savepoint names one),
//! then a replay of the durable log window past it.
//!
//! ```text
//! savepoint ──> snapshot pages ──> record arenas     (bulk image)
//!          └──> log files (snapshot_epoch, durable] ─> replay apply
//! ```
//!
//! Replay trusts only durable bytes: for each logger, files below the
//! current ordinal are read whole, the current file only up to the
//! savepoint's durable offset. Records apply newest-wins by XctId, so
//! replay order between loggers does not matter. A structurally damaged
//! file aborts initialization — recovery never guesses.
//!
//! The embedder must register the same storages (same ids) that produced
//! the log before calling [`Engine::recover`](crate::engine::Engine::recover);
//! a log record naming an unknown storage is an error.

use eyre::{bail, Result, WrapErr};
use memmap2::Mmap;

use crate::engine::Engine;
use crate::epoch::Epoch;
use crate::log::types::{codes, ArrayOverwriteLog, LogRecordIter};
use crate::savepoint::Savepoint;
use crate::storage::array::ArrayStorage;
use crate::storage::array_page::{self, interior_child};
use crate::storage::page_id::{SnapshotPagePointer, PAGE_SIZE};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Records restored from the snapshot image.
    pub snapshot_records: u64,
    /// Log records replayed on top of it.
    pub replayed_records: u64,
}

pub fn recover(engine: &Engine, savepoint: &Savepoint) -> Result<RecoveryStats> {
    let mut stats = RecoveryStats::default();

    if let Some(snapshot) = engine.snapshot_manager().latest_snapshot() {
        for (&storage_id, &root) in &snapshot.root_pointers {
            if root == 0 {
                continue;
            }
            let storage = engine
                .storages()
                .array(storage_id)
                .wrap_err("snapshot names a storage that is not registered")?;
            stats.snapshot_records += load_subtree(engine, &storage, root)?;
        }
    }

    let snapshot_epoch = engine.snapshot_manager().snapshot_epoch();
    let durable = savepoint.durable_global_epoch;
    if !durable.is_valid() {
        return Ok(stats);
    }

    for logger in engine.log_manager().loggers() {
        for ordinal in 0..=logger.current_ordinal() {
            let path = logger.file_path(ordinal);
            if !path.exists() {
                continue;
            }
            let file = std::fs::File::open(&path)
                .wrap_err_with(|| format!("failed to open log file {:?}", path))?;
            // SAFETY: recovery runs before any logger thread appends.
            let map = unsafe {
                Mmap::map(&file)
                    .wrap_err_with(|| format!("failed to mmap log file {:?}", path))?
            };
            let limit = if ordinal == logger.current_ordinal() {
                (map.len() as u64).min(logger.current_file_durable_offset()) as usize
            } else {
                map.len()
            };
            stats.replayed_records +=
                replay_block(engine, &map[..limit], snapshot_epoch, durable)
                    .wrap_err_with(|| format!("log file {:?} is corrupt", path))?;
        }
    }
    Ok(stats)
}

/// Replay every overwrite record in `(after, upto]` from one block.
fn replay_block(engine: &Engine, block: &[u8], after: Epoch, upto: Epoch) -> Result<u64> {
    let mut replayed = 0;
    for record in LogRecordIter::new(block) {
        let record = record?;
        if record.header.log_type_code != codes::ARRAY_OVERWRITE {
            continue;
        }
        let log = ArrayOverwriteLog::parse_prefix(record.bytes);
        let epoch = log.xct_id().epoch();
        if !epoch.is_valid() || upto.is_before(epoch) {
            continue;
        }
        if after.is_valid() && !after.is_before(epoch) {
            continue;
        }
        let storage = engine
            .storages()
            .array(log.header.storage_id)
            .wrap_err("log names a storage that is not registered")?;
        if log.offset >= storage.array_size() {
            bail!(
                "log record for offset {} outside storage {} of size {}",
                log.offset,
                storage.id(),
                storage.array_size()
            );
        }
        storage.replay_overwrite(&log, record.bytes);
        replayed += 1;
    }
    Ok(replayed)
}

/// Copy a snapshot subtree into the storage's volatile arena.
fn load_subtree(
    engine: &Engine,
    storage: &ArrayStorage,
    pointer: SnapshotPagePointer,
) -> Result<u64> {
    let store = engine.snapshot_manager().page_store();
    let mut page = [0u8; PAGE_SIZE];
    store.read_page(pointer, &mut page)?;
    let header = array_page::read_header(&page);
    let mut loaded = 0;
    if header.is_leaf() {
        let count = header.range_end - header.range_begin;
        for slot in 0..count {
            let (id, payload) = array_page::leaf_record(&page, slot, storage.payload_size());
            if id.is_valid() {
                let offset = header.range_begin + slot;
                storage.apply_unchecked(offset, 0, payload);
                storage.version(offset).store_unfenced(id.without_lock());
                loaded += 1;
            }
        }
    } else {
        for child in 0..array_page::INTERIOR_FANOUT {
            let child_pointer = interior_child(&page, child).snapshot;
            if child_pointer != 0 {
                loaded += load_subtree(engine, storage, child_pointer)?;
            }
        }
    }
    Ok(loaded)
}

//! # Log Mapper
//!
//! One mapper per logger. It reads the logger's durable files front to
//! back, keeps only the overwrite records whose commit epoch falls in the
//! snapshot window `(base, until]`, asks the storage's partitioner which
//! NUMA node owns each record, and appends the record to that node's
//! reducer.
//!
//! Epoch markers and filler records are skipped as data but still parsed:
//! a structurally damaged file fails the snapshot attempt with a corrupt
//! error rather than folding garbage into the image. Records carry their
//! own XctId, so window filtering uses the record's commit epoch directly;
//! markers only delimit streams.

use eyre::{bail, Result, WrapErr};
use hashbrown::HashMap;
use memmap2::Mmap;
use parking_lot::Mutex;

use crate::epoch::Epoch;
use crate::log::types::{codes, ArrayOverwriteLog, LogRecordIter};
use crate::log::Logger;
use crate::snapshot::reducer::ReducerBuffer;
use crate::storage::partitioner::Partitioner;
use crate::storage::StorageId;

/// Whether `epoch` lies in the half-open window `(base, until]`.
fn in_window(epoch: Epoch, base: Epoch, until: Epoch) -> bool {
    if !epoch.is_valid() {
        return false;
    }
    if until.is_before(epoch) {
        return false;
    }
    !base.is_valid() || base.is_before(epoch)
}

/// Map every durable record of `logger` into the reducers. Returns the
/// number of records delivered.
pub fn map_logger_files(
    logger: &Logger,
    base: Epoch,
    until: Epoch,
    partitioners: &HashMap<StorageId, Partitioner>,
    reducers: &[Mutex<ReducerBuffer>],
) -> Result<u64> {
    let mut mapped = 0u64;
    for ordinal in 0..=logger.current_ordinal() {
        let path = logger.file_path(ordinal);
        if !path.exists() {
            continue;
        }
        // Only the current file can have a non-durable tail; older ordinals
        // are fully durable.
        let durable_limit = if ordinal == logger.current_ordinal() {
            logger.current_file_durable_offset()
        } else {
            u64::MAX
        };
        let file = std::fs::File::open(&path)
            .wrap_err_with(|| format!("failed to open log file {:?}", path))?;
        // SAFETY: the logger only appends; the bytes below the durable
        // offset are frozen.
        let map = unsafe {
            Mmap::map(&file).wrap_err_with(|| format!("failed to mmap log file {:?}", path))?
        };
        let limit = (map.len() as u64).min(durable_limit) as usize;
        mapped += map_block(&map[..limit], base, until, partitioners, reducers)
            .wrap_err_with(|| format!("log file {:?} is corrupt", path))?;
    }
    Ok(mapped)
}

/// Map one contiguous block of log records.
pub fn map_block(
    block: &[u8],
    base: Epoch,
    until: Epoch,
    partitioners: &HashMap<StorageId, Partitioner>,
    reducers: &[Mutex<ReducerBuffer>],
) -> Result<u64> {
    let mut mapped = 0u64;
    for record in LogRecordIter::new(block) {
        let record = record?;
        if record.header.log_type_code != codes::ARRAY_OVERWRITE {
            continue;
        }
        let log = ArrayOverwriteLog::parse_prefix(record.bytes);
        if !in_window(log.xct_id().epoch(), base, until) {
            continue;
        }
        let Some(partitioner) = partitioners.get(&log.header.storage_id) else {
            bail!(
                "log names storage {} but no such storage is registered",
                log.header.storage_id
            );
        };
        let partition = partitioner.partition_of(log.offset) as usize;
        debug_assert!(partition < reducers.len());
        reducers[partition].lock().append(&log, record.bytes)?;
        mapped += 1;
    }
    Ok(mapped)
}

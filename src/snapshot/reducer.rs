//! # Log Reducer
//!
//! One reducer per NUMA node. Mappers feed it the durable log records whose
//! partitions the node owns; it groups them per storage and keeps them as
//! *sorted runs* the composer later merges:
//!
//! - Small inputs stay in one in-memory run (a byte arena plus a sort-entry
//!   vector, sorted lazily when the run is taken).
//! - Past `snapshot.reducer_buffer_records` entries, the buffered run is
//!   sorted and spilled to a run file; the file holds the records
//!   back-to-back in sorted order, so reading it back is sequential.
//!
//! Sort order is `(key, epoch, ordinal)` with the epoch compressed relative
//! to the snapshot's base so that the comparison survives epoch wrap.
//! "Newest wins" falls out of the composer applying equal-key records in
//! this order.

use std::io::Write;
use std::path::{Path, PathBuf};

use eyre::{bail, Result, WrapErr};
use hashbrown::HashMap;
use memmap2::Mmap;

use crate::epoch::Epoch;
use crate::log::types::{codes, ArrayOverwriteLog, LogHeader};
use crate::storage::StorageId;
use crate::xct::XctId;
use zerocopy::FromBytes;

/// One record as the composer consumes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverwriteEntry {
    pub key: u64,
    pub xct_id: XctId,
    pub payload_offset: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct SortRecord {
    key: u64,
    compressed_epoch: u32,
    ordinal: u32,
    pos: u32,
    len: u32,
}

#[derive(Default)]
struct StorageRuns {
    arena: Vec<u8>,
    entries: Vec<SortRecord>,
    spill_files: Vec<PathBuf>,
}

pub struct ReducerBuffer {
    node: u8,
    base_epoch: Epoch,
    spill_threshold: usize,
    spill_dir: PathBuf,
    spill_counter: usize,
    runs: HashMap<StorageId, StorageRuns>,
}

impl ReducerBuffer {
    pub fn new(node: u8, base_epoch: Epoch, spill_threshold: usize, spill_dir: &Path) -> Self {
        Self {
            node,
            base_epoch,
            spill_threshold: spill_threshold.max(1),
            spill_dir: spill_dir.to_path_buf(),
            spill_counter: 0,
            runs: HashMap::new(),
        }
    }

    pub fn node(&self) -> u8 {
        self.node
    }

    fn compress_epoch(&self, epoch: Epoch) -> u32 {
        epoch.raw().wrapping_sub(self.base_epoch.raw())
    }

    /// Accept one full overwrite record (header included).
    pub fn append(&mut self, log: &ArrayOverwriteLog, record_bytes: &[u8]) -> Result<()> {
        debug_assert_eq!(log.header.log_length as usize, record_bytes.len());
        let compressed_epoch = self.compress_epoch(log.xct_id().epoch());
        let runs = self.runs.entry(log.header.storage_id).or_default();
        runs.entries.push(SortRecord {
            key: log.offset,
            compressed_epoch,
            ordinal: log.xct_id().ordinal(),
            pos: runs.arena.len() as u32,
            len: record_bytes.len() as u32,
        });
        runs.arena.extend_from_slice(record_bytes);
        if runs.entries.len() >= self.spill_threshold {
            self.spill(log.header.storage_id)?;
        }
        Ok(())
    }

    fn sort(entries: &mut [SortRecord]) {
        entries.sort_unstable_by_key(|e| (e.key, e.compressed_epoch, e.ordinal));
    }

    fn spill(&mut self, storage_id: StorageId) -> Result<()> {
        std::fs::create_dir_all(&self.spill_dir)
            .wrap_err_with(|| format!("failed to create spill dir {:?}", self.spill_dir))?;
        let path = self.spill_dir.join(format!(
            "reducer_{}_{}_{:04}.run",
            self.node, storage_id, self.spill_counter
        ));
        self.spill_counter += 1;
        let runs = self.runs.get_mut(&storage_id).expect("spill of known storage");
        Self::sort(&mut runs.entries);
        let mut file = std::fs::File::create(&path)
            .wrap_err_with(|| format!("failed to create run file {:?}", path))?;
        for entry in &runs.entries {
            let from = entry.pos as usize;
            file.write_all(&runs.arena[from..from + entry.len as usize])
                .wrap_err("failed to write run record")?;
        }
        file.sync_all().wrap_err("failed to sync run file")?;
        runs.arena.clear();
        runs.entries.clear();
        runs.spill_files.push(path);
        Ok(())
    }

    pub fn storages(&self) -> Vec<StorageId> {
        let mut ids: Vec<_> = self
            .runs
            .iter()
            .filter(|(_, r)| !r.entries.is_empty() || !r.spill_files.is_empty())
            .map(|(&id, _)| id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Hand the storage's runs to the composer as independent sorted
    /// streams, leaving the reducer empty for that storage.
    pub fn take_streams(&mut self, storage_id: StorageId) -> Result<Vec<RunCursor>> {
        let Some(mut runs) = self.runs.remove(&storage_id) else {
            return Ok(Vec::new());
        };
        let mut cursors = Vec::new();
        for path in runs.spill_files.drain(..) {
            cursors.push(RunCursor::from_file(&path)?);
        }
        if !runs.entries.is_empty() {
            Self::sort(&mut runs.entries);
            cursors.push(RunCursor::from_memory(runs.arena, runs.entries));
        }
        Ok(cursors)
    }

    /// Run files created so far (for cleanup after composition).
    pub fn spill_paths(&self) -> Vec<PathBuf> {
        self.runs
            .values()
            .flat_map(|r| r.spill_files.iter().cloned())
            .collect()
    }
}

/// A single sorted stream of overwrite records, in memory or on disk.
pub struct RunCursor {
    source: RunSource,
    current: Option<OverwriteEntry>,
}

enum RunSource {
    Memory {
        arena: Vec<u8>,
        order: Vec<SortRecord>,
        next: usize,
    },
    File {
        map: Mmap,
        pos: usize,
        path: PathBuf,
    },
}

impl RunCursor {
    fn from_memory(arena: Vec<u8>, order: Vec<SortRecord>) -> Self {
        let mut cursor = Self {
            source: RunSource::Memory {
                arena,
                order,
                next: 0,
            },
            current: None,
        };
        cursor.advance().expect("in-memory run cannot fail");
        cursor
    }

    fn from_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .wrap_err_with(|| format!("failed to open run file {:?}", path))?;
        // SAFETY: run files are private to this snapshot attempt and are
        // not modified once written.
        let map = unsafe {
            Mmap::map(&file).wrap_err_with(|| format!("failed to mmap run file {:?}", path))?
        };
        let mut cursor = Self {
            source: RunSource::File {
                map,
                pos: 0,
                path: path.to_path_buf(),
            },
            current: None,
        };
        cursor.advance()?;
        Ok(cursor)
    }

    pub fn current(&self) -> Option<&OverwriteEntry> {
        self.current.as_ref()
    }

    /// Move to the next record; `current` becomes `None` at exhaustion.
    pub fn advance(&mut self) -> Result<()> {
        self.current = match &mut self.source {
            RunSource::Memory { arena, order, next } => {
                if *next >= order.len() {
                    None
                } else {
                    let entry = order[*next];
                    *next += 1;
                    let bytes = &arena[entry.pos as usize..(entry.pos + entry.len) as usize];
                    Some(parse_entry(bytes)?)
                }
            }
            RunSource::File { map, pos, path } => {
                if *pos >= map.len() {
                    None
                } else {
                    let remaining = &map[*pos..];
                    if remaining.len() < LogHeader::SIZE {
                        bail!("truncated record in run file {:?}", path);
                    }
                    let header = LogHeader::read_from_bytes(&remaining[..LogHeader::SIZE])
                        .expect("header length checked");
                    let len = header.log_length as usize;
                    if len < LogHeader::SIZE || len > remaining.len() {
                        bail!("corrupt record length {} in run file {:?}", len, path);
                    }
                    let bytes = &remaining[..len];
                    *pos += len;
                    Some(parse_entry(bytes)?)
                }
            }
        };
        Ok(())
    }
}

fn parse_entry(bytes: &[u8]) -> Result<OverwriteEntry> {
    let log = ArrayOverwriteLog::parse_prefix(bytes);
    if log.header.log_type_code != codes::ARRAY_OVERWRITE {
        bail!("run stream holds a non-overwrite record");
    }
    Ok(OverwriteEntry {
        key: log.offset,
        xct_id: log.xct_id(),
        payload_offset: log.payload_offset,
        data: log.payload(bytes).to_vec(),
    })
}

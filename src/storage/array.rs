//! # Array Storage (Volatile Side)
//!
//! The array storage is a fixed-size vector of records addressed by offset.
//! Its volatile image is two flat arenas: a version word per record and one
//! contiguous payload arena. Read- and write-set entries refer to records by
//! `(storage_id, offset)`, never by address, so nothing here needs a
//! self-referential structure.
//!
//! ```text
//! versions:  [ XctId ][ XctId ][ XctId ] ...        (one AtomicU64 each)
//! payloads:  [ payload 0 ][ payload 1 ][ ... ]      (payload_size bytes each)
//! temps:     [ u8 ][ u8 ][ u8 ] ...                 (hotness per record)
//! ```
//!
//! ## Read protocol (serializable)
//!
//! 1. Spin while the version word is locked (commits are short; reading a
//!    locked record is a guaranteed abort later, so waiting is cheaper).
//! 2. Capture the version into the read set.
//! 3. Acquire fence, then copy the payload. A concurrent commit may race
//!    this copy; commit-time validation catches the version change, so a
//!    torn copy is never *used*.
//!
//! Records whose temperature reached `storage.hot_threshold` take a
//! pessimistic variant: re-read until the capture is stable (version
//! unchanged across the copy), trading spin time for a much lower abort
//! rate on contended records. Temperature rises on every race abort that
//! involved the record; 256 disables the pessimistic path.
//!
//! ## Write protocol
//!
//! `overwrite` serializes the redo record into the worker's log buffer and
//! appends a write-set entry; nothing touches the record arena until the
//! commit protocol holds the lock and calls [`ArrayStorage::apply_unchecked`].

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::XctResult;
use crate::log::types::ArrayOverwriteLog;
use crate::log::ThreadLogBuffer;
use crate::storage::array_page::ArrayRoute;
use crate::storage::StorageId;
use crate::xct::xct::{WriteAccess, Xct};
use crate::xct::{AtomicXctId, XctId};

/// Disables the pessimistic read path (temperatures are `u8`, so no record
/// ever reaches it).
pub const HOT_THRESHOLD_DISABLED: u16 = 256;

pub struct ArrayStorage {
    id: StorageId,
    name: String,
    payload_size: u16,
    array_size: u64,
    route: ArrayRoute,
    versions: Box<[AtomicXctId]>,
    payloads: UnsafeCell<Box<[u8]>>,
    temperatures: Box<[AtomicU8]>,
    /// NUMA node assigned to each root-child subtree, round-robin at
    /// creation. Stands in for the volatile page's physical placement and
    /// seeds the partitioner's primary assignment.
    child_nodes: Box<[u8]>,
}

// SAFETY: payload bytes are only mutated by a committing worker that holds
// the record's lock bit (or by replay before concurrent access exists).
// Readers copy payload bytes optimistically and validate the version word
// afterwards; a torn copy is discarded by a race abort before anyone acts
// on it. The version words themselves are atomics.
unsafe impl Sync for ArrayStorage {}
unsafe impl Send for ArrayStorage {}

impl ArrayStorage {
    pub fn new(
        id: StorageId,
        name: impl Into<String>,
        payload_size: u16,
        array_size: u64,
        group_count: u8,
    ) -> Self {
        assert!(array_size > 0);
        assert!(payload_size > 0);
        let route = ArrayRoute::new(array_size, payload_size);
        let children = route.root_children();
        let group_count = group_count.max(1);
        Self {
            id,
            name: name.into(),
            payload_size,
            array_size,
            route,
            versions: (0..array_size).map(|_| AtomicXctId::invalid()).collect(),
            payloads: UnsafeCell::new(
                vec![0u8; array_size as usize * payload_size as usize].into_boxed_slice(),
            ),
            temperatures: (0..array_size).map(|_| AtomicU8::new(0)).collect(),
            child_nodes: (0..children).map(|c| (c % group_count as usize) as u8).collect(),
        }
    }

    pub fn id(&self) -> StorageId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload_size(&self) -> u16 {
        self.payload_size
    }

    pub fn array_size(&self) -> u64 {
        self.array_size
    }

    pub fn route(&self) -> &ArrayRoute {
        &self.route
    }

    pub fn levels(&self) -> u8 {
        self.route.levels
    }

    pub fn child_node(&self, child: usize) -> u8 {
        self.child_nodes[child]
    }

    pub fn version(&self, offset: u64) -> &AtomicXctId {
        &self.versions[offset as usize]
    }

    pub fn temperature(&self, offset: u64) -> u8 {
        self.temperatures[offset as usize].load(Ordering::Relaxed)
    }

    pub fn bump_temperature(&self, offset: u64) {
        let cell = &self.temperatures[offset as usize];
        let cur = cell.load(Ordering::Relaxed);
        if cur < u8::MAX {
            // A lost update here only loses one degree of heat.
            cell.store(cur + 1, Ordering::Relaxed);
        }
    }

    fn payload_range(&self, offset: u64) -> (usize, usize) {
        let start = offset as usize * self.payload_size as usize;
        (start, start + self.payload_size as usize)
    }

    /// Copy the record payload into `out` with no synchronization beyond
    /// the caller's protocol.
    fn copy_payload(&self, offset: u64, out: &mut [u8]) {
        let (start, end) = self.payload_range(offset);
        // SAFETY: see the type-level invariant; callers either validate the
        // version word around this copy or explicitly asked for dirty data.
        let arena = unsafe { &*self.payloads.get() };
        out.copy_from_slice(&arena[start..end]);
    }

    /// Serializable read: capture the version, fence, copy the payload, and
    /// remember the observation for commit-time validation.
    pub fn read_record(
        &self,
        xct: &mut Xct,
        hot_threshold: u16,
        offset: u64,
        out: &mut [u8],
    ) -> XctResult<()> {
        debug_assert!(offset < self.array_size);
        debug_assert_eq!(out.len(), self.payload_size as usize);
        let version = &self.versions[offset as usize];
        let observed = if u16::from(self.temperature(offset)) >= hot_threshold {
            // Pessimistic capture: loop until the copy is provably stable.
            loop {
                let before = version.spin_while_locked();
                self.copy_payload(offset, out);
                let after = version.load();
                if after == before {
                    break before;
                }
                std::hint::spin_loop();
            }
        } else {
            let observed = version.spin_while_locked();
            // The Acquire load above orders the payload copy after the
            // version capture.
            self.copy_payload(offset, out);
            observed
        };
        xct.add_read_access(self.id, offset, observed)
    }

    /// Dirty read: payload only, no bookkeeping, no spinning.
    pub fn read_record_dirty(&self, offset: u64, out: &mut [u8]) {
        debug_assert!(offset < self.array_size);
        self.copy_payload(offset, out);
    }

    /// Current version word without joining any read set.
    pub fn peek_version(&self, offset: u64) -> XctId {
        self.versions[offset as usize].load()
    }

    /// Buffer a partial overwrite: serialize the redo record into the
    /// worker's log buffer and append a write-set entry.
    pub fn overwrite_record(
        &self,
        xct: &mut Xct,
        buffer: &ThreadLogBuffer,
        offset: u64,
        payload_offset: u16,
        data: &[u8],
    ) -> XctResult<()> {
        debug_assert!(offset < self.array_size);
        debug_assert!(payload_offset as usize + data.len() <= self.payload_size as usize);
        let len = ArrayOverwriteLog::record_length(data.len());
        let log_offset = buffer.reserve(len)?;
        let bytes = buffer.speculative_bytes_mut(log_offset, len);
        ArrayOverwriteLog::serialize_into(bytes, self.id, offset, payload_offset, data);
        let observed = self.versions[offset as usize].load();
        xct.add_write_access(WriteAccess {
            storage_id: self.id,
            index: offset,
            observed,
            log_offset,
            log_length: len as u32,
        })
    }

    /// Apply payload bytes outside the OCC read path. The caller must hold
    /// the record lock (commit apply) or guarantee exclusive access (replay).
    pub fn apply_unchecked(&self, offset: u64, payload_offset: u16, data: &[u8]) {
        debug_assert!(payload_offset as usize + data.len() <= self.payload_size as usize);
        let (start, _) = self.payload_range(offset);
        let at = start + payload_offset as usize;
        // SAFETY: exclusivity per the lock-bit protocol.
        let arena = unsafe { &mut *self.payloads.get() };
        arena[at..at + data.len()].copy_from_slice(data);
    }

    /// Replay one durable overwrite record: apply the payload and install
    /// its XctId if it is newer than what the record already holds.
    pub fn replay_overwrite(&self, log: &ArrayOverwriteLog, record_bytes: &[u8]) {
        let id = log.xct_id();
        if !id.is_valid() {
            return;
        }
        let current = self.versions[log.offset as usize].load();
        if current.is_valid() && !current.is_before(id) {
            return;
        }
        self.apply_unchecked(log.offset, log.payload_offset, log.payload(record_bytes));
        self.versions[log.offset as usize].store_unfenced(id);
    }
}

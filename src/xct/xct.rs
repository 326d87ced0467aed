//! # Per-Worker Transaction Context
//!
//! Every worker owns exactly one `Xct`, reused across transactions. It is
//! plain data: isolation mode, bounded read and write sets, and the worker's
//! previous commit id (needed for the in-epoch ordinal rule). The commit
//! protocol itself lives in [`crate::xct::manager`]; storages append to the
//! sets through the accessors here.
//!
//! ## State machine
//!
//! ```text
//!          begin()              precommit()
//! ┌──────┐ ──────> ┌────────┐ ─────────────> ┌────────────┐
//! │ Idle │         │ Active │                │ Committing │
//! └──────┘ <────── └────────┘ <───────────── └────────────┘
//!            abort / commit outcome (both lead back to Idle)
//! ```
//!
//! ## Bounds
//!
//! Both sets are `SmallVec` with inline capacity 16 — the common case stays
//! on the worker's stack — but growth is capped by the configured maxima;
//! exceeding them aborts with `ReadSetOverflow` / `WriteSetOverflow` so a
//! runaway procedure cannot exhaust memory it never registered for.
//!
//! Under dirty-read isolation the read set is not populated at all: nothing
//! will be validated, so there is nothing to remember.

use smallvec::SmallVec;

use crate::error::{XctError, XctResult};
use crate::storage::StorageId;
use crate::xct::xct_id::XctId;

/// How much consistency a transaction asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// No read bookkeeping; prefers snapshot data when both a snapshot and
    /// a volatile record exist (more stale, more consistent).
    DirtyReadPreferSnapshot,
    /// No read bookkeeping; prefers the volatile record (more recent, less
    /// consistent).
    DirtyReadPreferVolatile,
    /// Reads come from the latest published snapshot only.
    Snapshot,
    /// Full OCC validation.
    #[default]
    Serializable,
}

impl IsolationLevel {
    pub fn is_dirty_read(self) -> bool {
        matches!(
            self,
            IsolationLevel::DirtyReadPreferSnapshot | IsolationLevel::DirtyReadPreferVolatile
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XctState {
    Idle,
    Active,
    Committing,
}

#[derive(Debug, Clone, Copy)]
pub struct ReadAccess {
    pub storage_id: StorageId,
    pub index: u64,
    pub observed: XctId,
}

#[derive(Debug, Clone, Copy)]
pub struct WriteAccess {
    pub storage_id: StorageId,
    pub index: u64,
    pub observed: XctId,
    /// Logical offset of the pre-serialized redo record in the worker's
    /// thread log buffer.
    pub log_offset: u64,
    pub log_length: u32,
}

/// Transaction set bounds and thresholds, copied from the engine options at
/// worker start.
#[derive(Debug, Clone, Copy)]
pub struct XctLimits {
    pub max_read_set: usize,
    pub max_write_set: usize,
    pub large_read_set_threshold: usize,
}

impl Default for XctLimits {
    fn default() -> Self {
        Self {
            max_read_set: 4096,
            max_write_set: 1024,
            large_read_set_threshold: 8192,
        }
    }
}

pub struct Xct {
    state: XctState,
    isolation: IsolationLevel,
    limits: XctLimits,
    read_set: SmallVec<[ReadAccess; 16]>,
    write_set: SmallVec<[WriteAccess; 16]>,
    /// The id this worker last committed with; the next commit in the same
    /// epoch must use a strictly greater ordinal.
    last_commit: XctId,
}

impl Xct {
    pub fn new(limits: XctLimits) -> Self {
        Self {
            state: XctState::Idle,
            isolation: IsolationLevel::default(),
            limits,
            read_set: SmallVec::new(),
            write_set: SmallVec::new(),
            last_commit: XctId::default(),
        }
    }

    pub fn state(&self) -> XctState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == XctState::Active
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn limits(&self) -> XctLimits {
        self.limits
    }

    pub fn read_set(&self) -> &[ReadAccess] {
        &self.read_set
    }

    pub fn write_set(&self) -> &[WriteAccess] {
        &self.write_set
    }

    pub fn last_commit_id(&self) -> XctId {
        self.last_commit
    }

    pub fn begin(&mut self, isolation: IsolationLevel) {
        debug_assert_eq!(self.state, XctState::Idle);
        self.state = XctState::Active;
        self.isolation = isolation;
        self.read_set.clear();
        self.write_set.clear();
    }

    pub fn add_read_access(
        &mut self,
        storage_id: StorageId,
        index: u64,
        observed: XctId,
    ) -> XctResult<()> {
        debug_assert!(self.is_active());
        debug_assert!(!self.isolation.is_dirty_read());
        if self.read_set.len() >= self.limits.max_read_set {
            return Err(XctError::ReadSetOverflow);
        }
        self.read_set.push(ReadAccess {
            storage_id,
            index,
            observed,
        });
        Ok(())
    }

    pub fn add_write_access(&mut self, access: WriteAccess) -> XctResult<()> {
        debug_assert!(self.is_active());
        if self.write_set.len() >= self.limits.max_write_set {
            return Err(XctError::WriteSetOverflow);
        }
        self.write_set.push(access);
        Ok(())
    }

    /// Whether `(storage_id, index)` is in this transaction's write set.
    /// Read validation treats locks held by ourselves as benign.
    pub fn wrote_record(&self, storage_id: StorageId, index: u64) -> bool {
        self.write_set
            .iter()
            .any(|w| w.storage_id == storage_id && w.index == index)
    }

    pub fn enter_commit(&mut self) {
        debug_assert_eq!(self.state, XctState::Active);
        self.state = XctState::Committing;
    }

    /// Largest ordinal this transaction observed for `epoch`, folding in the
    /// worker's own previous commit. The commit ordinal must exceed this.
    pub fn max_observed_ordinal(&self, epoch: crate::epoch::Epoch) -> u32 {
        let mut max = 0u32;
        if self.last_commit.is_valid() && self.last_commit.epoch() == epoch {
            max = max.max(self.last_commit.ordinal());
        }
        for r in &self.read_set {
            if r.observed.is_valid() && r.observed.epoch() == epoch {
                max = max.max(r.observed.ordinal());
            }
        }
        for w in &self.write_set {
            if w.observed.is_valid() && w.observed.epoch() == epoch {
                max = max.max(w.observed.ordinal());
            }
        }
        max
    }

    pub fn finish_committed(&mut self, commit_id: XctId) {
        debug_assert_eq!(self.state, XctState::Committing);
        self.last_commit = commit_id;
        self.state = XctState::Idle;
        self.read_set.clear();
        self.write_set.clear();
    }

    pub fn finish_aborted(&mut self) {
        debug_assert_ne!(self.state, XctState::Idle);
        self.state = XctState::Idle;
        self.read_set.clear();
        self.write_set.clear();
    }
}

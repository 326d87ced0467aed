//! # XctId: the Record Version Word
//!
//! Every record carries one 64-bit word that doubles as its version and its
//! write lock. It is the only synchronization primitive readers and writers
//! touch at runtime, so its layout and access protocol are load-bearing.
//!
//! ## Binary layout
//!
//! ```text
//!  63   62......56   55..............32   31...............0
//! +----+-----------+--------------------+-------------------+
//! |lock| reserved  | ordinal (24 bits)  | epoch (32 bits)   |
//! +----+-----------+--------------------+-------------------+
//! ```
//!
//! - `lock`: set only by the committing worker, only for the duration of its
//!   commit phase.
//! - `ordinal`: uniquifier among commits in the same epoch. A committing
//!   transaction picks an ordinal strictly greater than any it observed in
//!   that epoch, which serializes transactions within the epoch.
//! - `epoch`: the commit epoch. Once a record holds a valid epoch, the epoch
//!   never decreases.
//!
//! ## Lock protocol
//!
//! Writers at commit time:
//! 1. `try_lock(observed)` — CAS from the observed unlocked word to the same
//!    word with the lock bit set. Failure means someone else changed or
//!    locked the record: race abort.
//! 2. Apply the redo payload to the record body.
//! 3. `publish(new)` — Release-store the new id with the lock bit clear.
//!    This makes the payload visible; readers fence after loading the word.
//!
//! Readers never block on the word except to spin while it is locked
//! (commits are short; retrying immediately would be a guaranteed abort).

use std::sync::atomic::{AtomicU64, Ordering};

use crate::epoch::Epoch;

const LOCK_BIT: u64 = 1 << 63;
const ORDINAL_SHIFT: u32 = 32;
const ORDINAL_MASK: u64 = 0x00FF_FFFF;
const EPOCH_MASK: u64 = 0xFFFF_FFFF;

/// Largest in-epoch ordinal (24 bits).
pub const MAX_ORDINAL: u32 = ORDINAL_MASK as u32;

/// A snapshot of a record's version word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct XctId(u64);

impl XctId {
    pub fn new(epoch: Epoch, ordinal: u32) -> Self {
        debug_assert!(ordinal <= MAX_ORDINAL);
        XctId((u64::from(ordinal) & ORDINAL_MASK) << ORDINAL_SHIFT | u64::from(epoch.raw()))
    }

    pub fn from_raw(raw: u64) -> Self {
        XctId(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn epoch(self) -> Epoch {
        Epoch::from_raw((self.0 & EPOCH_MASK) as u32)
    }

    pub fn ordinal(self) -> u32 {
        ((self.0 >> ORDINAL_SHIFT) & ORDINAL_MASK) as u32
    }

    pub fn is_valid(self) -> bool {
        self.epoch().is_valid()
    }

    pub fn is_locked(self) -> bool {
        self.0 & LOCK_BIT != 0
    }

    pub fn with_lock(self) -> XctId {
        XctId(self.0 | LOCK_BIT)
    }

    pub fn without_lock(self) -> XctId {
        XctId(self.0 & !LOCK_BIT)
    }

    /// Version equality ignoring the lock bit.
    pub fn equals_version(self, other: XctId) -> bool {
        self.without_lock().0 == other.without_lock().0
    }

    /// Serialization order: `(epoch, ordinal)` with wrap-aware epochs. An
    /// invalid id orders before everything valid.
    pub fn is_before(self, other: XctId) -> bool {
        debug_assert!(other.is_valid());
        if !self.is_valid() {
            return true;
        }
        if self.epoch() != other.epoch() {
            return self.epoch().is_before(other.epoch());
        }
        self.ordinal() < other.ordinal()
    }
}

/// The shared, atomic form of the version word, embedded in every record.
#[derive(Debug)]
pub struct AtomicXctId {
    word: AtomicU64,
}

impl AtomicXctId {
    pub fn invalid() -> Self {
        Self {
            word: AtomicU64::new(0),
        }
    }

    pub fn load(&self) -> XctId {
        XctId(self.word.load(Ordering::Acquire))
    }

    /// Spin until the lock bit is clear, returning the first unlocked word
    /// observed.
    pub fn spin_while_locked(&self) -> XctId {
        loop {
            let id = self.load();
            if !id.is_locked() {
                return id;
            }
            std::hint::spin_loop();
        }
    }

    /// Try to acquire the commit lock, expecting the record to still hold
    /// `observed` (unlocked). Returns false if the word changed or is locked.
    pub fn try_lock(&self, observed: XctId) -> bool {
        let expected = observed.without_lock().0;
        self.word
            .compare_exchange(
                expected,
                expected | LOCK_BIT,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Drop the lock bit without changing the version (abort path).
    pub fn release(&self) {
        let cur = self.word.load(Ordering::Relaxed);
        debug_assert!(cur & LOCK_BIT != 0);
        self.word.store(cur & !LOCK_BIT, Ordering::Release);
    }

    /// Publish a new version and clear the lock bit in one store. The caller
    /// must hold the lock and must have finished applying the payload.
    pub fn publish(&self, new_id: XctId) {
        debug_assert!(!new_id.is_locked());
        debug_assert!(self.load().is_locked());
        debug_assert!(
            !self.load().is_valid() || !new_id.epoch().is_before(self.load().epoch()),
            "record epoch must never decrease"
        );
        self.word.store(new_id.0, Ordering::Release);
    }

    /// Install a version outside the OCC protocol. Only valid when no
    /// concurrent transaction can reach the record (log replay, bulk load).
    pub fn store_unfenced(&self, id: XctId) {
        self.word.store(id.0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_and_unpack_roundtrip() {
        let id = XctId::new(Epoch::from_raw(0xDEAD_BEEF), 0x00AB_CDEF);
        assert_eq!(id.epoch(), Epoch::from_raw(0xDEAD_BEEF));
        assert_eq!(id.ordinal(), 0x00AB_CDEF);
        assert!(!id.is_locked());
    }

    #[test]
    fn lock_bit_is_separate_from_version() {
        let id = XctId::new(Epoch::from_raw(7), 3);
        let locked = id.with_lock();
        assert!(locked.is_locked());
        assert_eq!(locked.epoch(), id.epoch());
        assert_eq!(locked.ordinal(), id.ordinal());
        assert!(id.equals_version(locked));
        assert_eq!(locked.without_lock(), id);
    }

    #[test]
    fn serialization_order_by_epoch_then_ordinal() {
        let a = XctId::new(Epoch::from_raw(5), 10);
        let b = XctId::new(Epoch::from_raw(5), 11);
        let c = XctId::new(Epoch::from_raw(6), 1);
        assert!(a.is_before(b));
        assert!(b.is_before(c));
        assert!(!c.is_before(a));
        assert!(XctId::default().is_before(a));
    }

    #[test]
    fn order_respects_epoch_wrap() {
        let high = XctId::new(Epoch::from_raw(u32::MAX), 9);
        let wrapped = XctId::new(Epoch::from_raw(2), 0);
        assert!(high.is_before(wrapped));
    }

    #[test]
    fn cas_lock_protocol() {
        let cell = AtomicXctId::invalid();
        let v1 = XctId::new(Epoch::from_raw(3), 1);
        cell.store_unfenced(v1);

        let observed = cell.load();
        assert!(cell.try_lock(observed));
        assert!(cell.load().is_locked());
        // A second locker with the same observation must fail.
        assert!(!cell.try_lock(observed));

        let v2 = XctId::new(Epoch::from_raw(4), 1);
        cell.publish(v2);
        assert_eq!(cell.load(), v2);
        assert!(!cell.load().is_locked());
    }

    #[test]
    fn try_lock_fails_on_changed_version() {
        let cell = AtomicXctId::invalid();
        cell.store_unfenced(XctId::new(Epoch::from_raw(3), 1));
        let stale = XctId::new(Epoch::from_raw(2), 9);
        assert!(!cell.try_lock(stale));
    }

    #[test]
    fn release_keeps_version() {
        let cell = AtomicXctId::invalid();
        let v = XctId::new(Epoch::from_raw(8), 2);
        cell.store_unfenced(v);
        assert!(cell.try_lock(v));
        cell.release();
        assert_eq!(cell.load(), v);
    }
}

//! # Xct Manager
//!
//! Owns the two epochs every worker watches and runs the commit protocol.
//!
//! - `current_global_epoch`: commits happen under this. A background thread
//!   ticks it forward every few milliseconds, but only after every worker
//!   with an open transaction has observed the current value, so no
//!   transaction can commit under an epoch that is already two behind.
//! - `grace_epoch`: no worker still holds `grace_epoch - 1` as its active
//!   epoch; resources tagged with older epochs are safe to retire.
//!
//! ## Commit protocol
//!
//! The serializable commit is verification followed by an atomic-looking
//! publish, all under record-word locks held for microseconds:
//!
//! 1. Sort the write set by `(storage, record)` — the global lock order —
//!    and CAS-lock each record, expecting the version observed at write
//!    time. Any mismatch is a race: release and abort.
//! 2. Fence, then re-validate every read-set entry: same version, and not
//!    locked by someone else (our own locks are fine).
//! 3. Open the in-commit window (`in_commit_epoch`), then take the commit
//!    epoch. The window is opened against a value no newer than the commit
//!    epoch, which is what lets loggers rule out racing publication when
//!    they seal an epoch.
//! 4. Pick the ordinal: strictly greater than every same-epoch ordinal this
//!    transaction observed, and than the worker's own last commit.
//! 5. Stamp the redo records, apply them to the record arenas, publish the
//!    new XctId (clearing locks), and release the log bytes to the logger.
//!
//! Aborts restore everything locally: locks released, log buffer truncated,
//! sets cleared. The caller only sees the kind.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

use crate::engine::channel::SharedChannel;
use crate::engine::Engine;
use crate::epoch::{AtomicEpoch, Epoch};
use crate::error::{XctError, XctResult};
use crate::log::types::ArrayOverwriteLog;
use crate::storage::array::ArrayStorage;
use crate::storage::StorageManager;
use crate::thread::pool::WorkerShared;
use crate::xct::xct::Xct;
use crate::xct::xct_id::{XctId, MAX_ORDINAL};

pub struct XctManager {
    current_global_epoch: AtomicEpoch,
    grace_epoch: AtomicEpoch,
    sleep: Mutex<bool>,
    wakeup: Condvar,
    advancer: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl XctManager {
    pub fn new(initial: Epoch) -> Self {
        debug_assert!(initial.is_valid());
        Self {
            current_global_epoch: AtomicEpoch::new(initial),
            grace_epoch: AtomicEpoch::new(initial),
            sleep: Mutex::new(false),
            wakeup: Condvar::new(),
            advancer: Mutex::new(None),
        }
    }

    pub fn current_global_epoch(&self) -> Epoch {
        self.current_global_epoch.load()
    }

    pub fn grace_epoch(&self) -> Epoch {
        self.grace_epoch.load()
    }

    /// One advancement attempt. The epoch moves only when every in-flight
    /// transaction has observed the current value; the grace epoch is
    /// refreshed either way. Returns the epoch after the attempt.
    pub fn advance_epoch_once(&self, workers: &[Arc<WorkerShared>]) -> Epoch {
        let current = self.current_global_epoch();
        let mut oldest_active = current;
        let mut all_observed = true;
        for worker in workers {
            let active = worker.active_epoch();
            if active.is_valid() {
                if active.is_before(current) {
                    all_observed = false;
                }
                oldest_active.store_min(active);
            }
        }
        self.grace_epoch.store_max(oldest_active);
        if all_observed {
            let next = current.one_more();
            self.current_global_epoch.store(next);
            next
        } else {
            current
        }
    }

    /// Spawn the epoch advancer thread.
    pub fn launch(&self, engine: Engine) {
        let interval = Duration::from_millis(engine.options().xct.epoch_advance_interval_ms);
        let handle = std::thread::Builder::new()
            .name("ember-epoch".to_owned())
            .spawn(move || {
                let manager = engine.xct_manager();
                let workers: Vec<_> = engine.pool().workers().to_vec();
                loop {
                    {
                        let mut sleeping = manager.sleep.lock();
                        if !engine.channel().is_stop_requested() {
                            manager.wakeup.wait_for(&mut sleeping, interval);
                        }
                    }
                    if engine.channel().is_stop_requested() {
                        break;
                    }
                    manager.advance_epoch_once(&workers);
                }
            })
            .expect("spawn epoch advancer");
        *self.advancer.lock() = Some(handle);
    }

    pub fn wake(&self) {
        self.wakeup.notify_all();
    }

    pub fn join(&self) {
        if let Some(handle) = self.advancer.lock().take() {
            self.wakeup.notify_all();
            let _ = handle.join();
        }
    }

    /// Run the full commit protocol for the worker's in-progress
    /// transaction. On `Ok` the transaction is committed and its log bytes
    /// are durable-eligible; on `Err` it is fully rolled back.
    pub fn precommit(
        &self,
        storages: &StorageManager,
        channel: &SharedChannel,
        worker: &WorkerShared,
        xct: &mut Xct,
    ) -> XctResult<XctId> {
        debug_assert!(xct.is_active());
        xct.enter_commit();
        match self.precommit_locked(storages, channel, worker, xct) {
            Ok(commit_id) => {
                xct.finish_committed(commit_id);
                Ok(commit_id)
            }
            Err(kind) => {
                worker.log_buffer().discard_current_xct();
                worker.set_in_commit_epoch(Epoch::INVALID);
                xct.finish_aborted();
                Err(kind)
            }
        }
    }

    fn precommit_locked(
        &self,
        storages: &StorageManager,
        channel: &SharedChannel,
        worker: &WorkerShared,
        xct: &mut Xct,
    ) -> XctResult<XctId> {
        if channel.is_stop_requested() || channel.is_fatal() {
            return Err(XctError::UnexpectedAbort);
        }
        if xct.read_set().len() > xct.limits().large_read_set_threshold {
            return Err(XctError::LargeReadSetAbort);
        }

        // Read-only transactions skip locking entirely; they still validate.
        if xct.write_set().is_empty() {
            self.validate_read_set(storages, xct, &[])?;
            let epoch = self.current_global_epoch();
            return Ok(XctId::new(epoch, xct.max_observed_ordinal(epoch)));
        }

        // Global lock order: (storage, record), first occurrence wins.
        let write_set = xct.write_set();
        let mut order: SmallVec<[u16; 16]> = (0..write_set.len() as u16).collect();
        order.sort_unstable_by_key(|&i| {
            let w = &write_set[i as usize];
            (w.storage_id, w.index, i)
        });

        let mut held: SmallVec<[(Arc<ArrayStorage>, u64); 16]> = SmallVec::new();
        for &i in &order {
            let w = &write_set[i as usize];
            if let Some((last, idx)) = held.last() {
                if last.id() == w.storage_id && *idx == w.index {
                    continue;
                }
            }
            let storage = storages
                .array(w.storage_id)
                .map_err(|_| XctError::UnexpectedAbort)?;
            if !storage.version(w.index).try_lock(w.observed) {
                storage.bump_temperature(w.index);
                release_locks(&held);
                return Err(XctError::RaceAbort);
            }
            held.push((storage, w.index));
        }

        std::sync::atomic::fence(std::sync::atomic::Ordering::AcqRel);

        if let Err(kind) = self.validate_read_set(storages, xct, &held) {
            release_locks(&held);
            return Err(kind);
        }

        // Open the in-commit window before taking the commit epoch, so the
        // stored value can never exceed it.
        let observed_global = self.current_global_epoch();
        worker.set_in_commit_epoch(observed_global);
        let commit_epoch = self.current_global_epoch();

        let max_observed = xct.max_observed_ordinal(commit_epoch);
        if max_observed >= MAX_ORDINAL {
            release_locks(&held);
            return Err(XctError::UnexpectedAbort);
        }
        let commit_id = XctId::new(commit_epoch, max_observed + 1);

        // Apply in program order so overlapping overwrites within the
        // transaction land last-writer-wins.
        let buffer = worker.log_buffer();
        for w in xct.write_set() {
            let bytes = buffer.speculative_bytes_mut(w.log_offset, w.log_length as usize);
            ArrayOverwriteLog::fill_xct_id(bytes, commit_id);
            let log = ArrayOverwriteLog::parse_prefix(bytes);
            let payload =
                bytes[ArrayOverwriteLog::PREFIX_SIZE..][..log.payload_count as usize].to_vec();
            let (storage, _) = held
                .iter()
                .find(|(s, idx)| s.id() == w.storage_id && *idx == w.index)
                .expect("every write-set record is locked");
            storage.apply_unchecked(w.index, log.payload_offset, &payload);
        }
        for (storage, index) in &held {
            storage.version(*index).publish(commit_id);
        }

        buffer.publish_committed(commit_epoch);
        worker.set_in_commit_epoch(Epoch::INVALID);
        Ok(commit_id)
    }

    fn validate_read_set(
        &self,
        storages: &StorageManager,
        xct: &Xct,
        held: &[(Arc<ArrayStorage>, u64)],
    ) -> XctResult<()> {
        for r in xct.read_set() {
            let storage = storages
                .array(r.storage_id)
                .map_err(|_| XctError::UnexpectedAbort)?;
            let current = storage.peek_version(r.index);
            if !current.equals_version(r.observed) {
                storage.bump_temperature(r.index);
                return Err(XctError::RaceAbort);
            }
            if current.is_locked()
                && !held
                    .iter()
                    .any(|(s, idx)| s.id() == r.storage_id && *idx == r.index)
            {
                storage.bump_temperature(r.index);
                return Err(XctError::RaceAbort);
            }
        }
        Ok(())
    }
}

fn release_locks(held: &[(Arc<ArrayStorage>, u64)]) {
    for (storage, index) in held {
        storage.version(*index).release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::pool::ThreadPool;
    use crate::xct::xct::{IsolationLevel, XctLimits};

    fn fixture() -> (XctManager, StorageManager, SharedChannel, ThreadPool) {
        let manager = XctManager::new(Epoch::INITIAL);
        let storages = StorageManager::new(1);
        storages.create_array("t", 8, 64).unwrap();
        let channel = SharedChannel::new();
        let pool = ThreadPool::new(1, 1, 8192);
        (manager, storages, channel, pool)
    }

    fn begin(worker: &WorkerShared, manager: &XctManager, xct: &mut Xct) {
        worker.set_active_epoch(manager.current_global_epoch());
        xct.begin(IsolationLevel::Serializable);
    }

    #[test]
    fn single_writer_commit_publishes_version_and_payload() {
        let (manager, storages, channel, pool) = fixture();
        let worker = &pool.workers()[0];
        let storage = storages.array(1).unwrap();
        let mut xct = Xct::new(XctLimits::default());

        begin(worker, &manager, &mut xct);
        storage
            .overwrite_record(&mut xct, worker.log_buffer(), 3, 0, &[0x01; 8])
            .unwrap();
        let id = manager
            .precommit(&storages, &channel, worker, &mut xct)
            .unwrap();

        assert_eq!(id.epoch(), Epoch::INITIAL);
        assert_eq!(id.ordinal(), 1);
        assert_eq!(storage.peek_version(3), id);
        let mut out = [0u8; 8];
        storage.read_record_dirty(3, &mut out);
        assert_eq!(out, [0x01; 8]);
        // The redo bytes became durable-eligible.
        assert!(worker.log_buffer().committed() > 0);
    }

    #[test]
    fn empty_write_set_commits_without_touching_versions() {
        let (manager, storages, channel, pool) = fixture();
        let worker = &pool.workers()[0];
        let storage = storages.array(1).unwrap();
        let mut xct = Xct::new(XctLimits::default());

        begin(worker, &manager, &mut xct);
        let mut out = [0u8; 8];
        storage.read_record(&mut xct, 256, 5, &mut out).unwrap();
        manager
            .precommit(&storages, &channel, worker, &mut xct)
            .unwrap();
        assert!(!storage.peek_version(5).is_valid());
        assert_eq!(worker.log_buffer().committed(), 0);
    }

    #[test]
    fn stale_write_observation_race_aborts() {
        let (manager, storages, channel, pool) = fixture();
        let worker = &pool.workers()[0];
        let storage = storages.array(1).unwrap();

        // T1 stages a write, then T2 commits to the same record first.
        let mut t1 = Xct::new(XctLimits::default());
        begin(worker, &manager, &mut t1);
        storage
            .overwrite_record(&mut t1, worker.log_buffer(), 0, 0, &[0xAA; 8])
            .unwrap();

        storage
            .version(0)
            .store_unfenced(XctId::new(Epoch::from_raw(2), 1));

        let err = manager
            .precommit(&storages, &channel, worker, &mut t1)
            .unwrap_err();
        assert_eq!(err, XctError::RaceAbort);
        assert_eq!(worker.log_buffer().committed(), 0);
        assert!(!storage.peek_version(0).is_locked());
        assert_eq!(storage.temperature(0), 1);
    }

    #[test]
    fn read_validation_catches_concurrent_update() {
        let (manager, storages, channel, pool) = fixture();
        let worker = &pool.workers()[0];
        let storage = storages.array(1).unwrap();
        let mut xct = Xct::new(XctLimits::default());

        begin(worker, &manager, &mut xct);
        let mut out = [0u8; 8];
        storage.read_record(&mut xct, 256, 1, &mut out).unwrap();
        storage
            .overwrite_record(&mut xct, worker.log_buffer(), 2, 0, &[0xBB; 8])
            .unwrap();

        // Someone commits to the *read* record after our observation.
        storage
            .version(1)
            .store_unfenced(XctId::new(Epoch::from_raw(3), 1));

        let err = manager
            .precommit(&storages, &channel, worker, &mut xct)
            .unwrap_err();
        assert_eq!(err, XctError::RaceAbort);
        // The write lock taken on record 2 must have been released.
        assert!(!storage.peek_version(2).is_locked());
    }

    #[test]
    fn own_write_lock_does_not_fail_read_validation() {
        let (manager, storages, channel, pool) = fixture();
        let worker = &pool.workers()[0];
        let storage = storages.array(1).unwrap();
        let mut xct = Xct::new(XctLimits::default());

        begin(worker, &manager, &mut xct);
        let mut out = [0u8; 8];
        // Read then write the same record: validation sees our own lock.
        storage.read_record(&mut xct, 256, 7, &mut out).unwrap();
        storage
            .overwrite_record(&mut xct, worker.log_buffer(), 7, 0, &[0xCC; 8])
            .unwrap();
        let id = manager
            .precommit(&storages, &channel, worker, &mut xct)
            .unwrap();
        assert_eq!(storage.peek_version(7), id);
    }

    #[test]
    fn duplicate_writes_lock_once_and_apply_in_order() {
        let (manager, storages, channel, pool) = fixture();
        let worker = &pool.workers()[0];
        let storage = storages.array(1).unwrap();
        let mut xct = Xct::new(XctLimits::default());

        begin(worker, &manager, &mut xct);
        storage
            .overwrite_record(&mut xct, worker.log_buffer(), 4, 0, &[0xB0; 8])
            .unwrap();
        storage
            .overwrite_record(&mut xct, worker.log_buffer(), 4, 0, &[0xC0; 8])
            .unwrap();
        manager
            .precommit(&storages, &channel, worker, &mut xct)
            .unwrap();
        let mut out = [0u8; 8];
        storage.read_record_dirty(4, &mut out);
        assert_eq!(out, [0xC0; 8], "later write in program order wins");
    }

    #[test]
    fn commit_after_stop_flag_aborts() {
        let (manager, storages, channel, pool) = fixture();
        let worker = &pool.workers()[0];
        let storage = storages.array(1).unwrap();
        let mut xct = Xct::new(XctLimits::default());

        begin(worker, &manager, &mut xct);
        storage
            .overwrite_record(&mut xct, worker.log_buffer(), 0, 0, &[1; 8])
            .unwrap();
        channel.request_stop();
        assert_eq!(
            manager.precommit(&storages, &channel, worker, &mut xct),
            Err(XctError::UnexpectedAbort)
        );
    }

    #[test]
    fn large_read_set_refused_before_locking() {
        let (manager, storages, channel, pool) = fixture();
        let worker = &pool.workers()[0];
        let storage = storages.array(1).unwrap();
        let mut xct = Xct::new(XctLimits {
            max_read_set: 64,
            max_write_set: 16,
            large_read_set_threshold: 4,
        });

        begin(worker, &manager, &mut xct);
        let mut out = [0u8; 8];
        for i in 0..5 {
            storage.read_record(&mut xct, 256, i, &mut out).unwrap();
        }
        assert_eq!(
            manager.precommit(&storages, &channel, worker, &mut xct),
            Err(XctError::LargeReadSetAbort)
        );
    }

    #[test]
    fn epoch_advances_only_when_workers_observed_it() {
        let (manager, _, _, pool) = fixture();
        let workers: Vec<_> = pool.workers().to_vec();
        let e1 = manager.current_global_epoch();

        // An idle pool never blocks advancement.
        let e2 = manager.advance_epoch_once(&workers);
        assert_eq!(e2, e1.one_more());

        // A worker still active in the previous epoch pins the clock.
        workers[0].set_active_epoch(e1);
        assert_eq!(manager.advance_epoch_once(&workers), e2);
        assert_eq!(manager.grace_epoch(), e1);

        // Once it moves to the current epoch, the clock ticks again.
        workers[0].set_active_epoch(e2);
        assert_eq!(manager.advance_epoch_once(&workers), e2.one_more());
        assert_eq!(manager.grace_epoch(), e2);
    }

    #[test]
    fn ordinals_grow_within_an_epoch() {
        let (manager, storages, channel, pool) = fixture();
        let worker = &pool.workers()[0];
        let storage = storages.array(1).unwrap();
        let mut xct = Xct::new(XctLimits::default());

        for expected_ordinal in 1..=3 {
            begin(worker, &manager, &mut xct);
            storage
                .overwrite_record(&mut xct, worker.log_buffer(), 0, 0, &[expected_ordinal; 8])
                .unwrap();
            let id = manager
                .precommit(&storages, &channel, worker, &mut xct)
                .unwrap();
            assert_eq!(id.ordinal(), u32::from(expected_ordinal));
        }
    }
}

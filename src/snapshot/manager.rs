//! # Snapshot Manager
//!
//! Owns the latest published [`Snapshot`], the snapshot-epoch watermark,
//! and the background thread that runs the gleaner when a snapshot is
//! triggered.
//!
//! ## One snapshot attempt
//!
//! ```text
//! durable log files          reducers (per node)        new snapshot files
//!  logger 0 ──mapper──┐   ┌──────────────────────┐   ┌───────────────────┐
//!  logger 1 ──mapper──┼──>│ sorted runs per      │──>│ composer: pages,  │
//!  logger N ──mapper──┘   │ (storage, partition) │   │ then one root per │
//!                         └──────────────────────┘   │ storage           │
//!                                                    └───────────────────┘
//! ```
//!
//! The window is `(base, until]` with `until = durable_global_epoch` at
//! trigger time: everything folded is already on disk in the log, so a
//! failed attempt loses nothing — the previous snapshot stays valid and the
//! log is still there for the retry. Publication is a single pointer swap
//! plus the savepoint rewrite.

use std::sync::Arc;
use std::time::Duration;

use eyre::{bail, eyre, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::engine::Engine;
use crate::epoch::{AtomicEpoch, Epoch};
use crate::snapshot::cache::SnapshotPageStore;
use crate::snapshot::mapper;
use crate::snapshot::reducer::ReducerBuffer;
use crate::snapshot::snapshot::{Snapshot, SnapshotId};
use crate::snapshot::writer::SnapshotWriter;
use crate::storage::array::ArrayStorage;
use crate::storage::array_page::{self, interior_child};
use crate::storage::composer::{construct_root, ArrayComposer, RootInfo};
use crate::storage::page_id::{SnapshotPagePointer, PAGE_SIZE};
use crate::storage::partitioner::Partitioner;
use crate::storage::StorageId;

#[derive(Default)]
struct TriggerState {
    requested: bool,
    generation: u64,
    last_error: Option<String>,
}

pub struct SnapshotManager {
    latest: RwLock<Option<Arc<Snapshot>>>,
    snapshot_epoch: AtomicEpoch,
    page_store: SnapshotPageStore,
    state: Mutex<TriggerState>,
    trigger: Condvar,
    done: Condvar,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl SnapshotManager {
    pub fn new(cache_enabled: bool, cache_capacity_bytes_per_node: usize) -> Self {
        Self {
            latest: RwLock::new(None),
            snapshot_epoch: AtomicEpoch::invalid(),
            page_store: SnapshotPageStore::new(cache_enabled, cache_capacity_bytes_per_node),
            state: Mutex::new(TriggerState::default()),
            trigger: Condvar::new(),
            done: Condvar::new(),
            handle: Mutex::new(None),
        }
    }

    pub fn page_store(&self) -> &SnapshotPageStore {
        &self.page_store
    }

    /// Epoch of the latest published snapshot; invalid before the first.
    pub fn snapshot_epoch(&self) -> Epoch {
        self.snapshot_epoch.load()
    }

    pub fn latest_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.latest.read().clone()
    }

    /// Re-adopt a snapshot found in the savepoint at engine start.
    pub fn install_recovered(&self, snapshot: Snapshot, file_paths: Vec<(u8, std::path::PathBuf)>) {
        let ordinal = Snapshot::file_ordinal(snapshot.id);
        for (node, path) in file_paths {
            self.page_store.register_file(node, ordinal, path);
        }
        self.snapshot_epoch.store(snapshot.valid_until_epoch);
        *self.latest.write() = Some(Arc::new(snapshot));
    }

    pub fn launch(&self, engine: Engine) {
        let handle = std::thread::Builder::new()
            .name("ember-snapshot".to_owned())
            .spawn(move || {
                let manager = engine.snapshot_manager();
                loop {
                    let requested = {
                        let mut state = manager.state.lock();
                        if !state.requested && !engine.channel().is_stop_requested() {
                            manager
                                .trigger
                                .wait_for(&mut state, Duration::from_millis(100));
                        }
                        std::mem::take(&mut state.requested)
                    };
                    if engine.channel().is_stop_requested() {
                        break;
                    }
                    if !requested {
                        continue;
                    }
                    let outcome = manager.take_snapshot(&engine);
                    let mut state = manager.state.lock();
                    state.generation += 1;
                    state.last_error = outcome.err().map(|e| format!("{:#}", e));
                    drop(state);
                    manager.done.notify_all();
                }
            })
            .expect("spawn snapshot manager thread");
        *self.handle.lock() = Some(handle);
    }

    pub fn join(&self) {
        if let Some(handle) = self.handle.lock().take() {
            self.trigger.notify_all();
            let _ = handle.join();
        }
    }

    /// Ask for a snapshot of everything durable right now. With `wait`, the
    /// call blocks until that attempt published (or failed).
    pub fn trigger_snapshot_immediate(
        &self,
        engine: &Engine,
        wait: bool,
    ) -> Result<Option<Arc<Snapshot>>> {
        let target = {
            let mut state = self.state.lock();
            state.requested = true;
            self.trigger.notify_all();
            state.generation + 1
        };
        if !wait {
            return Ok(None);
        }
        let mut state = self.state.lock();
        while state.generation < target {
            if engine.channel().is_stop_requested() {
                bail!("engine stopped while waiting for a snapshot");
            }
            self.done.wait_for(&mut state, Duration::from_millis(10));
        }
        if let Some(error) = state.last_error.take() {
            return Err(eyre!("snapshot attempt failed: {}", error));
        }
        drop(state);
        Ok(self.latest_snapshot())
    }

    /// The gleaner: map durable log, reduce into sorted runs, compose new
    /// pages, splice roots, publish.
    fn take_snapshot(&self, engine: &Engine) -> Result<()> {
        let until = engine.log_manager().durable_global_epoch();
        if !until.is_valid() {
            bail!("no durable epoch yet; nothing to snapshot");
        }
        let previous = self.latest_snapshot();
        let base = previous
            .as_ref()
            .map(|s| s.valid_until_epoch)
            .unwrap_or(Epoch::INVALID);
        let id: SnapshotId = previous.as_ref().map(|s| s.id + 1).unwrap_or(1);
        let options = engine.options();
        let nodes = options.thread.group_count;

        let mut partitioners: HashMap<StorageId, Partitioner> = HashMap::new();
        let storages = engine.storages().all_arrays();
        for storage in &storages {
            partitioners.insert(storage.id(), Partitioner::for_array(storage, nodes));
        }

        let reducers: Vec<Mutex<ReducerBuffer>> = (0..nodes)
            .map(|node| {
                Mutex::new(ReducerBuffer::new(
                    node,
                    base,
                    options.snapshot.reducer_buffer_records,
                    &options.snapshot_dir(node),
                ))
            })
            .collect();

        // One mapper per logger, all at once; any corrupt file fails the
        // whole attempt before anything is written.
        std::thread::scope(|scope| -> Result<()> {
            let mut handles = Vec::new();
            for logger in engine.log_manager().loggers() {
                let reducers = &reducers;
                let partitioners = &partitioners;
                handles.push(scope.spawn(move || {
                    mapper::map_logger_files(logger, base, until, partitioners, reducers)
                }));
            }
            for handle in handles {
                handle
                    .join()
                    .map_err(|_| eyre!("mapper thread panicked"))??;
            }
            Ok(())
        })?;

        let mut writers: Vec<SnapshotWriter> = Vec::new();
        for node in 0..nodes {
            writers.push(SnapshotWriter::new(
                node,
                id,
                &options.snapshot_dir(node),
                engine.page_pool(node).clone(),
            )?);
        }

        let mut spill_files = Vec::new();
        let mut infos: HashMap<StorageId, Vec<RootInfo>> = HashMap::new();
        for (node, reducer_mutex) in reducers.into_iter().enumerate() {
            let mut reducer = reducer_mutex.into_inner();
            spill_files.extend(reducer.spill_paths());
            for storage_id in reducer.storages() {
                let streams = reducer.take_streams(storage_id)?;
                let storage = engine.storages().array(storage_id)?;
                let prev_root = previous.as_ref().and_then(|s| s.root_of(storage_id));
                let info =
                    ArrayComposer::new(&storage, &mut writers[node], prev_root, &self.page_store)
                        .compose(streams)
                        .wrap_err_with(|| {
                            format!("composing storage {} on node {}", storage_id, node)
                        })?;
                infos.entry(storage_id).or_default().push(info);
            }
        }

        let mut root_pointers = HashMap::new();
        for storage in &storages {
            let prev_root = previous.as_ref().and_then(|s| s.root_of(storage.id()));
            let storage_infos = infos.remove(&storage.id()).unwrap_or_default();
            if storage_infos.is_empty() && prev_root.is_none() {
                continue;
            }
            let root = construct_root(
                storage,
                &storage_infos,
                prev_root,
                &mut writers[0],
                &self.page_store,
            )?;
            root_pointers.insert(storage.id(), root);
        }

        let ordinal = Snapshot::file_ordinal(id);
        for writer in writers {
            let node = writer.node();
            if let Some(path) = writer.finish()? {
                self.page_store.register_file(node, ordinal, path);
            }
        }
        for path in spill_files {
            let _ = std::fs::remove_file(path);
        }

        let snapshot = Arc::new(Snapshot {
            id,
            base_epoch: base,
            valid_until_epoch: until,
            root_pointers,
        });
        *self.latest.write() = Some(Arc::clone(&snapshot));
        self.snapshot_epoch.store(until);

        if engine
            .channel()
            .preload_snapshot_pages
            .load(std::sync::atomic::Ordering::Acquire)
        {
            self.preload(&snapshot)?;
        }
        engine.persist_savepoint()?;
        Ok(())
    }

    /// Read a record's payload out of the latest snapshot. Returns false
    /// when no snapshot is published; a published snapshot that never wrote
    /// the record yields its zero state.
    pub fn read_array_record(
        &self,
        storage: &ArrayStorage,
        offset: u64,
        out: &mut [u8],
    ) -> Result<bool> {
        let Some(snapshot) = self.latest_snapshot() else {
            return Ok(false);
        };
        let Some(root) = snapshot.root_of(storage.id()) else {
            return Ok(false);
        };
        let route = storage.route();
        let mut page = [0u8; PAGE_SIZE];
        let mut pointer = root;
        for level in (1..route.levels).rev() {
            self.page_store.read_page(pointer, &mut page)?;
            pointer = interior_child(&page, route.child_index(level, offset)).snapshot;
            if pointer == 0 {
                out.fill(0);
                return Ok(true);
            }
        }
        self.page_store.read_page(pointer, &mut page)?;
        let (_, payload) = array_page::leaf_record(&page, route.leaf_slot(offset), route.payload_size);
        out.copy_from_slice(payload);
        Ok(true)
    }

    /// Walk every root and fault all pages into the snapshot cache.
    pub fn preload(&self, snapshot: &Snapshot) -> Result<u64> {
        let mut loaded = 0;
        for &root in snapshot.root_pointers.values() {
            if root != 0 {
                loaded += self.preload_page(root)?;
            }
        }
        Ok(loaded)
    }

    fn preload_page(&self, pointer: SnapshotPagePointer) -> Result<u64> {
        let mut page = [0u8; PAGE_SIZE];
        self.page_store.read_page(pointer, &mut page)?;
        let header = array_page::read_header(&page);
        let mut loaded = 1;
        if !header.is_leaf() {
            for child in 0..array_page::INTERIOR_FANOUT {
                let child_pointer = interior_child(&page, child).snapshot;
                if child_pointer != 0 {
                    loaded += self.preload_page(child_pointer)?;
                }
            }
        }
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_epoch_starts_invalid() {
        let manager = SnapshotManager::new(true, 1 << 20);
        assert!(!manager.snapshot_epoch().is_valid());
        assert!(manager.latest_snapshot().is_none());
    }

    #[test]
    fn read_without_snapshot_reports_absent() {
        let manager = SnapshotManager::new(false, 0);
        let storage = ArrayStorage::new(1, "t", 8, 100, 1);
        let mut out = [0u8; 8];
        assert!(!manager.read_array_record(&storage, 5, &mut out).unwrap());
    }

    #[test]
    fn install_recovered_publishes_metadata() {
        let manager = SnapshotManager::new(false, 0);
        let snapshot = Snapshot {
            id: 3,
            base_epoch: Epoch::INVALID,
            valid_until_epoch: Epoch::from_raw(12),
            root_pointers: HashMap::new(),
        };
        manager.install_recovered(snapshot, Vec::new());
        assert_eq!(manager.snapshot_epoch(), Epoch::from_raw(12));
        assert_eq!(manager.latest_snapshot().unwrap().id, 3);
    }
}

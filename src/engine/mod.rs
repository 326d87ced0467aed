//! # Engine
//!
//! The single handle that owns every subsystem. There are no ambient
//! globals anywhere in the crate: the procedure registry, the global epoch,
//! the durable-epoch watermark, and the shared channel all live behind this
//! handle, and every subsystem receives it explicitly.
//!
//! ## Lifecycle
//!
//! ```text
//! Engine::new(options)        build everything, load the savepoint
//!   engine.create_array(...)  register storages
//!   engine.register_procedure(...)
//!   engine.recover()?         optional: restore volatile state from disk
//! engine.start()?             spawn workers, loggers, epoch advancer,
//!                             snapshot manager; signal the rendezvous
//!   ... impersonate / wait_for_durable / trigger_snapshot_immediate ...
//! engine.stop()?              stop flags, joins, final savepoint
//! ```
//!
//! `soc.soc_type=child_processes` is recognized and rejected at
//! construction; this build runs workers as threads of the embedding
//! process.

pub mod channel;
pub mod options;
pub mod restart;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::{bail, Result};
use parking_lot::Mutex;

use crate::engine::channel::SharedChannel;
use crate::engine::options::{EngineOptions, SocType};
use crate::engine::restart::RecoveryStats;
use crate::epoch::Epoch;
use crate::log::LogManager;
use crate::memory::PagePool;
use crate::proc::ProcRegistry;
use crate::savepoint::Savepoint;
use crate::snapshot::{Snapshot, SnapshotManager, SnapshotWriter};
use crate::storage::array::ArrayStorage;
use crate::storage::{StorageId, StorageManager};
use crate::thread::pool::{Session, ThreadPool};
use crate::xct::XctManager;

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    options: EngineOptions,
    channel: SharedChannel,
    procedures: ProcRegistry,
    storages: StorageManager,
    pools: Vec<PagePool>,
    pool: ThreadPool,
    xct: XctManager,
    log: LogManager,
    snapshot: SnapshotManager,
    savepoint: Mutex<Savepoint>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Engine {
    pub fn new(options: EngineOptions) -> Result<Engine> {
        if options.soc.soc_type == SocType::ChildProcesses {
            bail!("forked-worker mode is not available in this build; set soc.soc_type=threads");
        }
        let nodes = options.thread.group_count;
        if nodes == 0 || nodes > 16 {
            bail!("thread.group_count must be 1..=16, got {}", nodes);
        }
        if options.thread.thread_count_per_group == 0 {
            bail!("thread.thread_count_per_group must be at least 1");
        }

        let savepoint = Savepoint::load(&options.savepoint_file())?.unwrap_or_default();

        let pool = ThreadPool::new(
            nodes,
            options.thread.thread_count_per_group,
            options.log_buffer_bytes(),
        );
        let log = LogManager::new(&options, &pool, &savepoint.loggers);
        let initial_epoch = if savepoint.durable_global_epoch.is_valid() {
            savepoint.durable_global_epoch.one_more()
        } else {
            Epoch::INITIAL
        };
        let xct = XctManager::new(initial_epoch);
        let snapshot = SnapshotManager::new(
            options.cache.snapshot_cache_enabled,
            (options.cache.snapshot_cache_size_mb_per_node as usize) << 20,
        );
        if savepoint.has_snapshot() {
            let id = savepoint.latest_snapshot_id;
            let mut files = Vec::new();
            for node in 0..nodes {
                let path = options.snapshot_dir(node).join(SnapshotWriter::file_name(id));
                if path.exists() {
                    files.push((node, path));
                }
            }
            snapshot.install_recovered(
                Snapshot {
                    id,
                    base_epoch: Epoch::INVALID,
                    valid_until_epoch: savepoint.latest_snapshot_epoch,
                    root_pointers: savepoint.storage_roots.iter().copied().collect(),
                },
                files,
            );
        }
        let pools = (0..nodes)
            .map(|node| {
                PagePool::new(
                    node,
                    (options.memory.page_pool_size_mb_per_node as usize) << 20,
                )
            })
            .collect();

        Ok(Engine {
            inner: Arc::new(EngineInner {
                storages: StorageManager::new(nodes),
                channel: SharedChannel::new(),
                procedures: ProcRegistry::new(),
                pools,
                pool,
                xct,
                log,
                snapshot,
                savepoint: Mutex::new(savepoint),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                options,
            }),
        })
    }

    // ── subsystem access ───────────────────────────────────────────────

    pub fn options(&self) -> &EngineOptions {
        &self.inner.options
    }

    pub fn channel(&self) -> &SharedChannel {
        &self.inner.channel
    }

    pub fn procedures(&self) -> &ProcRegistry {
        &self.inner.procedures
    }

    pub fn storages(&self) -> &StorageManager {
        &self.inner.storages
    }

    pub fn pool(&self) -> &ThreadPool {
        &self.inner.pool
    }

    pub fn xct_manager(&self) -> &XctManager {
        &self.inner.xct
    }

    pub fn log_manager(&self) -> &LogManager {
        &self.inner.log
    }

    pub fn snapshot_manager(&self) -> &SnapshotManager {
        &self.inner.snapshot
    }

    pub fn page_pool(&self, node: u8) -> &PagePool {
        &self.inner.pools[node as usize]
    }

    // ── setup phase ────────────────────────────────────────────────────

    pub fn register_procedure<F>(&self, name: &str, proc_fn: F) -> Result<()>
    where
        F: Fn(&mut crate::thread::ProcContext<'_>) -> Result<u32> + Send + Sync + 'static,
    {
        self.inner.procedures.register(name, proc_fn)
    }

    pub fn create_array(
        &self,
        name: &str,
        payload_size: u16,
        array_size: u64,
    ) -> Result<Arc<ArrayStorage>> {
        self.inner.storages.create_array(name, payload_size, array_size)
    }

    pub fn array(&self, id: StorageId) -> Result<Arc<ArrayStorage>> {
        self.inner.storages.array(id)
    }

    /// Restore volatile storages from the latest snapshot plus the durable
    /// log. Storages must be registered first; must run before `start`.
    pub fn recover(&self) -> Result<RecoveryStats> {
        if self.inner.started.load(Ordering::Acquire) {
            bail!("recover must run before the engine starts");
        }
        let savepoint = self.inner.savepoint.lock().clone();
        restart::recover(self, &savepoint)
    }

    // ── lifecycle ──────────────────────────────────────────────────────

    pub fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            bail!("engine already started");
        }
        self.inner.procedures.freeze();
        self.inner.pool.launch(self.clone());
        self.inner.log.launch(self);
        self.inner.xct.launch(self.clone());
        self.inner.snapshot.launch(self.clone());
        self.inner.log.refresh_durable();
        self.inner.channel.start_rendezvous.signal();
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// Stop every long-running thread, join them, and write the final
    /// savepoint. Reports the first background error collected, if any.
    pub fn stop(&self) -> Result<()> {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.channel.request_stop();
        self.inner.xct.wake();
        self.inner.log.wake_all();
        self.inner.pool.join_all();
        self.inner.xct.join();
        self.inner.log.join_all();
        self.inner.snapshot.join();
        for node in 0..self.inner.options.thread.group_count {
            self.inner.channel.mark_node_exited(node);
        }
        self.persist_savepoint()?;
        if let Some(error) = self.inner.log.collect_error() {
            bail!("logger failed during the run: {}", error);
        }
        Ok(())
    }

    /// Write the savepoint reflecting the current durable state.
    pub fn persist_savepoint(&self) -> Result<()> {
        let mut savepoint = self.inner.savepoint.lock();
        let durable = self.inner.log.durable_global_epoch();
        if durable.is_valid() {
            savepoint.durable_global_epoch = durable;
        }
        savepoint.loggers = self.inner.log.savepoint_info();
        if let Some(snapshot) = self.inner.snapshot.latest_snapshot() {
            savepoint.latest_snapshot_id = snapshot.id;
            savepoint.latest_snapshot_epoch = snapshot.valid_until_epoch;
            savepoint.storage_roots = {
                let mut roots: Vec<_> = snapshot
                    .root_pointers
                    .iter()
                    .map(|(&id, &root)| (id, root))
                    .collect();
                roots.sort_unstable_by_key(|(id, _)| *id);
                roots
            };
        }
        savepoint.save(&self.inner.options.savepoint_file())
    }

    // ── runtime operations ─────────────────────────────────────────────

    /// Claim any free worker for the named procedure. `None` when every
    /// worker is busy.
    pub fn try_impersonate(&self, proc_name: &str, input: &[u8]) -> Result<Option<Session>> {
        self.check_running()?;
        Ok(self.inner.pool.impersonate(proc_name, input))
    }

    pub fn try_impersonate_on_numa_node(
        &self,
        node: u8,
        proc_name: &str,
        input: &[u8],
    ) -> Result<Option<Session>> {
        self.check_running()?;
        Ok(self
            .inner
            .pool
            .impersonate_on_numa_node(node, proc_name, input))
    }

    /// Like [`try_impersonate`](Engine::try_impersonate), but waits for a
    /// worker to free up.
    pub fn impersonate(&self, proc_name: &str, input: &[u8]) -> Result<Session> {
        loop {
            match self.try_impersonate(proc_name, input)? {
                Some(session) => return Ok(session),
                None => std::thread::sleep(std::time::Duration::from_millis(1)),
            }
        }
    }

    fn check_running(&self) -> Result<()> {
        if !self.inner.started.load(Ordering::Acquire) {
            bail!("engine is not started");
        }
        if self.inner.channel.is_stop_requested() {
            bail!("engine is stopping");
        }
        if self.inner.channel.is_fatal() {
            bail!("engine hit a fatal background error");
        }
        Ok(())
    }

    /// Block until everything committed at `epoch` is on disk in every
    /// logger's file.
    pub fn wait_for_durable(&self, epoch: Epoch) -> Result<()> {
        self.inner.log.wait_for_durable(epoch, &self.inner.channel)
    }

    /// Fold everything durable into a new snapshot. With `wait`, returns
    /// the published snapshot.
    pub fn trigger_snapshot_immediate(&self, wait: bool) -> Result<Option<Arc<Snapshot>>> {
        self.inner.snapshot.trigger_snapshot_immediate(self, wait)
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        // Belt-and-suspenders: a handle dropped without stop() still stops
        // its threads (join_all on unlaunched pools is a no-op).
        self.channel.request_stop();
        self.pool.join_all();
        self.xct.join();
        self.log.join_all();
        self.snapshot.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_forked_worker_mode() {
        let mut options = EngineOptions::default();
        options.soc.soc_type = SocType::ChildProcesses;
        assert!(Engine::new(options).is_err());
    }

    #[test]
    fn rejects_zero_and_oversized_groups() {
        let mut options = EngineOptions::default();
        options.thread.group_count = 0;
        assert!(Engine::new(options).is_err());
        let mut options = EngineOptions::default();
        options.thread.group_count = 17;
        assert!(Engine::new(options).is_err());
    }

    #[test]
    fn impersonation_requires_start() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(EngineOptions::with_root(dir.path())).unwrap();
        assert!(engine.try_impersonate("p", &[]).is_err());
    }

    #[test]
    fn fresh_engine_starts_at_the_initial_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(EngineOptions::with_root(dir.path())).unwrap();
        assert_eq!(engine.xct_manager().current_global_epoch(), Epoch::INITIAL);
        assert!(!engine.log_manager().durable_global_epoch().is_valid());
        assert!(!engine.is_started());
    }
}

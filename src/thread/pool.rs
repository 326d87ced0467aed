//! # Worker Pool and Impersonation
//!
//! The engine pre-allocates every execution thread at start: a fixed set of
//! workers per NUMA node, each owning a transaction context and a thread
//! log buffer for its whole life. Clients never get a thread of their own;
//! they *impersonate* a worker by handing it a named procedure and input
//! bytes, then watch the session handle for the result.
//!
//! ```text
//! client ──impersonate("transfer", input)──> [ free worker? ]
//!                                                  │ yes: claim slot
//!                                                  v
//!                                     worker thread: wait → run proc → store
//!                                                  │        result/output
//! client <──Session::wait()/result()──────────────┘
//! ```
//!
//! `impersonate` returns `None` when every worker is busy; the caller
//! decides whether that is `NoFreeWorker` or a reason to retry.
//!
//! ## What a worker owns
//!
//! - its [`ThreadLogBuffer`], drained by exactly one logger
//! - its `Xct` context, lent to the running procedure
//! - `active_epoch`: the epoch its current transaction runs under, read by
//!   the epoch advancer
//! - `in_commit_epoch`: set for the publication window of a commit so
//!   loggers do not declare an epoch durable under a racing commit
//! - abort counters, reported per worker and in aggregate

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eyre::{eyre, Result};
use parking_lot::{Condvar, Mutex};

use crate::engine::Engine;
use crate::epoch::{AtomicEpoch, Epoch};
use crate::error::{XctError, XctResult};
use crate::log::ThreadLogBuffer;
use crate::storage::array::ArrayStorage;
use crate::xct::xct::{IsolationLevel, Xct, XctLimits};
use crate::xct::XctId;

/// Fixed size of a session's raw output region.
pub const OUTPUT_BUFFER_SIZE: usize = 4096;

pub type WorkerId = u16;

#[derive(Debug, Default)]
pub struct WorkerStats {
    pub race_aborts: AtomicU64,
    pub largereadset_aborts: AtomicU64,
    pub user_requested_aborts: AtomicU64,
    pub unexpected_aborts: AtomicU64,
}

impl WorkerStats {
    fn bump(&self, kind: XctError) {
        match kind {
            XctError::RaceAbort => &self.race_aborts,
            XctError::LargeReadSetAbort => &self.largereadset_aborts,
            XctError::UserRequestedAbort => &self.user_requested_aborts,
            _ => &self.unexpected_aborts,
        }
        .fetch_add(1, Ordering::Relaxed);
    }
}

/// Aggregate of [`WorkerStats`] across the pool.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AbortCounters {
    pub race_aborts: u64,
    pub largereadset_aborts: u64,
    pub user_requested_aborts: u64,
    pub unexpected_aborts: u64,
}

struct ProcRequest {
    proc_name: String,
    input: Vec<u8>,
    session: Arc<SessionShared>,
}

#[derive(Default)]
struct WorkerSlot {
    busy: bool,
    request: Option<ProcRequest>,
}

pub struct WorkerShared {
    id: WorkerId,
    node: u8,
    buffer: ThreadLogBuffer,
    active_epoch: AtomicEpoch,
    in_commit_epoch: AtomicEpoch,
    pub stats: WorkerStats,
    slot: Mutex<WorkerSlot>,
    wakeup: Condvar,
}

impl WorkerShared {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn numa_node(&self) -> u8 {
        self.node
    }

    pub fn log_buffer(&self) -> &ThreadLogBuffer {
        &self.buffer
    }

    pub fn active_epoch(&self) -> Epoch {
        self.active_epoch.load()
    }

    pub fn in_commit_epoch(&self) -> Epoch {
        self.in_commit_epoch.load()
    }

    pub(crate) fn set_active_epoch(&self, epoch: Epoch) {
        self.active_epoch.store(epoch);
    }

    pub(crate) fn set_in_commit_epoch(&self, epoch: Epoch) {
        self.in_commit_epoch.store(epoch);
    }
}

struct SessionState {
    running: bool,
    result: Option<Result<u32, String>>,
    output: Vec<u8>,
}

struct SessionShared {
    state: Mutex<SessionState>,
    done: Condvar,
}

/// Handle to one impersonated execution.
pub struct Session {
    shared: Arc<SessionShared>,
    worker: WorkerId,
}

impl Session {
    pub fn worker_id(&self) -> WorkerId {
        self.worker
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    /// Block until the procedure finished.
    pub fn wait(&self) {
        let mut state = self.shared.state.lock();
        while state.running {
            self.shared.done.wait(&mut state);
        }
    }

    /// The procedure's result: output length on success, the collected
    /// error stack otherwise. Blocks until done.
    pub fn result(&self) -> Result<u32> {
        self.wait();
        let state = self.shared.state.lock();
        match state.result.as_ref() {
            Some(Ok(len)) => Ok(*len),
            Some(Err(stack)) => Err(eyre!("{}", stack)),
            None => Err(eyre!("session finished without a result")),
        }
    }

    /// Copy of the raw output region the worker filled.
    pub fn output(&self) -> Vec<u8> {
        self.wait();
        self.shared.state.lock().output.clone()
    }

    pub fn release(self) {}
}

pub struct ThreadPool {
    workers: Vec<Arc<WorkerShared>>,
    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl ThreadPool {
    /// Build the workers (but no threads yet): `group_count` nodes with
    /// `per_group` workers each, ids dense in node-major order.
    pub fn new(group_count: u8, per_group: u8, log_buffer_bytes: usize) -> Self {
        let mut workers = Vec::new();
        for node in 0..group_count {
            for _ in 0..per_group {
                let id = workers.len() as WorkerId;
                workers.push(Arc::new(WorkerShared {
                    id,
                    node,
                    buffer: ThreadLogBuffer::new(log_buffer_bytes),
                    active_epoch: AtomicEpoch::invalid(),
                    in_commit_epoch: AtomicEpoch::invalid(),
                    stats: WorkerStats::default(),
                    slot: Mutex::new(WorkerSlot::default()),
                    wakeup: Condvar::new(),
                }));
            }
        }
        Self {
            workers,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn workers(&self) -> &[Arc<WorkerShared>] {
        &self.workers
    }

    pub fn workers_on_node(&self, node: u8) -> Vec<Arc<WorkerShared>> {
        self.workers
            .iter()
            .filter(|w| w.node == node)
            .cloned()
            .collect()
    }

    /// Spawn one OS thread per worker.
    pub fn launch(&self, engine: Engine) {
        let mut handles = self.handles.lock();
        debug_assert!(handles.is_empty());
        for worker in &self.workers {
            let worker = Arc::clone(worker);
            let engine = engine.clone();
            let handle = std::thread::Builder::new()
                .name(format!("ember-worker-{}", worker.id))
                .spawn(move || worker_main(engine, worker))
                .expect("spawn worker thread");
            handles.push(handle);
        }
    }

    /// Claim any free worker for `proc_name`. `None` means every worker is
    /// busy right now.
    pub fn impersonate(&self, proc_name: &str, input: &[u8]) -> Option<Session> {
        self.impersonate_filtered(proc_name, input, |_| true)
    }

    /// Claim a free worker pinned to `node`.
    pub fn impersonate_on_numa_node(
        &self,
        node: u8,
        proc_name: &str,
        input: &[u8],
    ) -> Option<Session> {
        self.impersonate_filtered(proc_name, input, |w| w.node == node)
    }

    fn impersonate_filtered(
        &self,
        proc_name: &str,
        input: &[u8],
        eligible: impl Fn(&WorkerShared) -> bool,
    ) -> Option<Session> {
        for worker in &self.workers {
            if !eligible(worker) {
                continue;
            }
            let mut slot = worker.slot.lock();
            if slot.busy {
                continue;
            }
            let session = Arc::new(SessionShared {
                state: Mutex::new(SessionState {
                    running: true,
                    result: None,
                    output: Vec::new(),
                }),
                done: Condvar::new(),
            });
            slot.busy = true;
            slot.request = Some(ProcRequest {
                proc_name: proc_name.to_owned(),
                input: input.to_vec(),
                session: Arc::clone(&session),
            });
            worker.wakeup.notify_one();
            return Some(Session {
                shared: session,
                worker: worker.id,
            });
        }
        None
    }

    /// Join all worker threads. The engine must have requested stop first.
    pub fn join_all(&self) {
        for worker in &self.workers {
            worker.wakeup.notify_all();
        }
        let mut handles = self.handles.lock();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }

    pub fn aggregate_aborts(&self) -> AbortCounters {
        let mut total = AbortCounters::default();
        for w in &self.workers {
            total.race_aborts += w.stats.race_aborts.load(Ordering::Relaxed);
            total.largereadset_aborts += w.stats.largereadset_aborts.load(Ordering::Relaxed);
            total.user_requested_aborts += w.stats.user_requested_aborts.load(Ordering::Relaxed);
            total.unexpected_aborts += w.stats.unexpected_aborts.load(Ordering::Relaxed);
        }
        total
    }
}

/// Fail a request the worker will never run, so its session cannot hang.
fn fail_pending(slot: &mut WorkerSlot) {
    if let Some(request) = slot.request.take() {
        {
            let mut state = request.session.state.lock();
            state.result = Some(Err("engine stopped before the procedure ran".to_owned()));
            state.running = false;
        }
        request.session.done.notify_all();
    }
}

fn worker_main(engine: Engine, worker: Arc<WorkerShared>) {
    // Nothing runs before the engine finished initializing.
    while !engine.channel().start_rendezvous.wait_for(Duration::from_millis(10)) {
        if engine.channel().is_stop_requested() {
            fail_pending(&mut worker.slot.lock());
            return;
        }
    }
    let mut xct = Xct::new(XctLimits {
        max_read_set: engine.options().xct.max_read_set_size,
        max_write_set: engine.options().xct.max_write_set_size,
        large_read_set_threshold: engine.options().xct.large_read_set_threshold,
    });

    loop {
        let request = {
            let mut slot = worker.slot.lock();
            loop {
                if engine.channel().is_stop_requested() {
                    fail_pending(&mut slot);
                    return;
                }
                if let Some(request) = slot.request.take() {
                    break request;
                }
                worker
                    .wakeup
                    .wait_for(&mut slot, Duration::from_millis(10));
            }
        };

        let mut ctx = ProcContext {
            engine: &engine,
            worker: &worker,
            xct: &mut xct,
            input: request.input,
            output: Box::new([0u8; OUTPUT_BUFFER_SIZE]),
            output_len: 0,
        };
        let outcome = match engine.procedures().get(&request.proc_name) {
            Some(proc_fn) => proc_fn(&mut ctx),
            None => Err(eyre!("no procedure named {:?}", request.proc_name)),
        };
        let output_len = ctx.output_len as usize;
        let output = ctx.output[..output_len.min(OUTPUT_BUFFER_SIZE)].to_vec();

        // A procedure that returned mid-transaction leaks nothing: roll its
        // speculative state back before the worker goes idle.
        if xct.is_active() {
            worker.buffer.discard_current_xct();
            xct.finish_aborted();
        }
        worker.set_active_epoch(Epoch::INVALID);

        {
            let mut state = request.session.state.lock();
            state.result = Some(outcome.map_err(|e| format!("{:#}", e)));
            state.output = output;
            state.running = false;
        }
        request.session.done.notify_all();
        worker.slot.lock().busy = false;
    }
}

/// What a procedure sees while it runs on a worker.
pub struct ProcContext<'a> {
    engine: &'a Engine,
    worker: &'a Arc<WorkerShared>,
    xct: &'a mut Xct,
    input: Vec<u8>,
    output: Box<[u8; OUTPUT_BUFFER_SIZE]>,
    output_len: u32,
}

impl<'a> ProcContext<'a> {
    pub fn engine(&self) -> &Engine {
        self.engine
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker.id
    }

    pub fn numa_node(&self) -> u8 {
        self.worker.node
    }

    pub fn input(&self) -> &[u8] {
        &self.input
    }

    /// Write `bytes` into the session's raw output region.
    pub fn set_output(&mut self, bytes: &[u8]) -> Result<u32> {
        if bytes.len() > OUTPUT_BUFFER_SIZE {
            return Err(eyre!(
                "output of {} bytes exceeds the {} byte session buffer",
                bytes.len(),
                OUTPUT_BUFFER_SIZE
            ));
        }
        self.output[..bytes.len()].copy_from_slice(bytes);
        self.output_len = bytes.len() as u32;
        Ok(self.output_len)
    }

    pub fn begin(&mut self, isolation: IsolationLevel) -> XctResult<()> {
        if self.engine.channel().is_stop_requested() || self.engine.channel().is_fatal() {
            return Err(XctError::UnexpectedAbort);
        }
        self.worker
            .set_active_epoch(self.engine.xct_manager().current_global_epoch());
        self.xct.begin(isolation);
        Ok(())
    }

    pub fn read(&mut self, storage: &ArrayStorage, offset: u64, out: &mut [u8]) -> XctResult<()> {
        match self.xct.isolation() {
            IsolationLevel::Serializable => storage.read_record(
                self.xct,
                self.engine.options().storage.hot_threshold,
                offset,
                out,
            ),
            IsolationLevel::DirtyReadPreferVolatile => {
                storage.read_record_dirty(offset, out);
                Ok(())
            }
            IsolationLevel::DirtyReadPreferSnapshot | IsolationLevel::Snapshot => {
                let from_snapshot = self
                    .engine
                    .snapshot_manager()
                    .read_array_record(storage, offset, out)
                    .map_err(|_| XctError::UnexpectedAbort)?;
                if !from_snapshot {
                    match self.xct.isolation() {
                        // Prefer-snapshot falls back to volatile data.
                        IsolationLevel::DirtyReadPreferSnapshot => {
                            storage.read_record_dirty(offset, out)
                        }
                        // Pure snapshot isolation sees the pre-snapshot
                        // (zero) state.
                        _ => out.fill(0),
                    }
                }
                Ok(())
            }
        }
    }

    pub fn overwrite(
        &mut self,
        storage: &ArrayStorage,
        offset: u64,
        payload_offset: u16,
        data: &[u8],
    ) -> XctResult<()> {
        storage.overwrite_record(self.xct, &self.worker.buffer, offset, payload_offset, data)
    }

    /// Run the commit protocol. On failure the transaction is already rolled
    /// back and the matching abort counter bumped.
    pub fn commit(&mut self) -> XctResult<XctId> {
        let result = self.engine.xct_manager().precommit(
            self.engine.storages(),
            self.engine.channel(),
            self.worker,
            self.xct,
        );
        self.worker.set_active_epoch(Epoch::INVALID);
        if let Err(kind) = result {
            self.worker.stats.bump(kind);
        }
        result
    }

    /// Abort the in-progress transaction at the procedure's request.
    pub fn abort(&mut self) {
        if self.xct.is_active() {
            self.worker.buffer.discard_current_xct();
            self.xct.finish_aborted();
        }
        self.worker.set_active_epoch(Epoch::INVALID);
        self.worker.stats.bump(XctError::UserRequestedAbort);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_lays_workers_out_node_major() {
        let pool = ThreadPool::new(2, 3, 4096);
        assert_eq!(pool.workers().len(), 6);
        assert_eq!(pool.workers()[0].numa_node(), 0);
        assert_eq!(pool.workers()[3].numa_node(), 1);
        assert_eq!(pool.workers_on_node(1).len(), 3);
        assert_eq!(pool.workers()[5].id(), 5);
    }

    #[test]
    fn stats_bump_routes_kinds() {
        let stats = WorkerStats::default();
        stats.bump(XctError::RaceAbort);
        stats.bump(XctError::RaceAbort);
        stats.bump(XctError::LargeReadSetAbort);
        stats.bump(XctError::UserRequestedAbort);
        stats.bump(XctError::UnexpectedAbort);
        stats.bump(XctError::LogBufferFull);
        assert_eq!(stats.race_aborts.load(Ordering::Relaxed), 2);
        assert_eq!(stats.largereadset_aborts.load(Ordering::Relaxed), 1);
        assert_eq!(stats.user_requested_aborts.load(Ordering::Relaxed), 1);
        assert_eq!(stats.unexpected_aborts.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn aggregate_sums_workers() {
        let pool = ThreadPool::new(1, 2, 4096);
        pool.workers()[0].stats.bump(XctError::RaceAbort);
        pool.workers()[1].stats.bump(XctError::RaceAbort);
        let total = pool.aggregate_aborts();
        assert_eq!(total.race_aborts, 2);
        assert_eq!(total.user_requested_aborts, 0);
    }
}

//! # Logger
//!
//! One writer thread per (node, logger) pair. Each logger owns a disjoint
//! set of that node's workers and is the only consumer of their log
//! buffers; it drains committed bytes into its current log file in strictly
//! non-decreasing epoch order and publishes a `durable_epoch` watermark
//! that the engine-wide durable epoch is the minimum of.
//!
//! ## Epoch sealing
//!
//! The logger works on one *target* epoch at a time: `durable + 1`. A pass
//! drains every assigned worker's bytes attributed to epochs `<= target`
//! (the buffer's epoch-mark ring says which bytes those are). The target is
//! sealed — flushed, fsynced, and published as durable — once:
//!
//! - the global epoch has moved past it (nobody can begin a commit in it),
//! - every worker's drained cursor covers all bytes marked `<= target`, and
//! - no worker is inside the commit publication window for an epoch
//!   `<= target` (the `in_commit_epoch` check; a racing commit that read
//!   the global epoch before it advanced is still allowed to append bytes
//!   for the target).
//!
//! Epoch markers are written lazily: whenever the staged stream switches to
//! a newer epoch, a marker record `{old, new}` precedes the bytes. Every
//! file also begins with a marker, which makes each file self-describing
//! for replay and the snapshot mapper.
//!
//! ## File discipline
//!
//! Writes are staged in an I/O buffer and flushed in multiples of 4 KiB
//! with filler-record padding, so the file is always a valid record stream
//! of aligned length. When the file reaches `log.log_file_size_mb` at a
//! flush boundary, the logger fsyncs and closes it, bumps its ordinal, and
//! starts `<path>.<ordinal+1>` fresh. On initialize, the file is truncated
//! back to the savepoint's durable offset (a crash can leave a torn tail).
//!
//! `log.emulation.null_device` keeps all of the bookkeeping but discards
//! the bytes.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eyre::{Result, WrapErr};
use parking_lot::{Condvar, Mutex};

use crate::engine::Engine;
use crate::epoch::{AtomicEpoch, Epoch};
use crate::log::types::{
    align_to_write_unit, write_filler, EpochMarkerLog, LOG_WRITE_UNIT,
};
use crate::thread::pool::WorkerShared;
use zerocopy::IntoBytes;

/// Flush the I/O buffer once it holds this much, even mid-epoch.
const IO_BUFFER_FLUSH_THRESHOLD: usize = 1 << 20;

/// Timeout of the logger's idle sleep.
const WAKEUP_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, Default)]
pub struct LoggerSavepoint {
    pub current_ordinal: u32,
    pub durable_offset: u64,
    pub durable_epoch: Epoch,
}

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Path prefix; the actual file is `<base>.<ordinal>`.
    pub path_base: PathBuf,
    pub rotate_bytes: u64,
    pub null_device: bool,
}

pub struct Logger {
    id: u16,
    numa_node: u8,
    config: LoggerConfig,
    workers: Vec<Arc<WorkerShared>>,
    durable_epoch: AtomicEpoch,
    current_ordinal: AtomicU32,
    current_file_durable_offset: AtomicU64,
    sleep: Mutex<bool>,
    wakeup: Condvar,
    error: Mutex<Option<String>>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Logger {
    pub fn new(
        id: u16,
        numa_node: u8,
        config: LoggerConfig,
        workers: Vec<Arc<WorkerShared>>,
        savepoint: LoggerSavepoint,
    ) -> Self {
        Self {
            id,
            numa_node,
            config,
            workers,
            durable_epoch: AtomicEpoch::new(savepoint.durable_epoch),
            current_ordinal: AtomicU32::new(savepoint.current_ordinal),
            current_file_durable_offset: AtomicU64::new(savepoint.durable_offset),
            sleep: Mutex::new(false),
            wakeup: Condvar::new(),
            error: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn numa_node(&self) -> u8 {
        self.numa_node
    }

    /// Highest epoch fully on disk for every worker this logger owns.
    pub fn durable_epoch(&self) -> Epoch {
        self.durable_epoch.load()
    }

    pub fn current_ordinal(&self) -> u32 {
        self.current_ordinal.load(Ordering::Acquire)
    }

    pub fn current_file_durable_offset(&self) -> u64 {
        self.current_file_durable_offset.load(Ordering::Acquire)
    }

    pub fn current_file_path(&self) -> PathBuf {
        self.file_path(self.current_ordinal())
    }

    pub fn file_path(&self, ordinal: u32) -> PathBuf {
        let mut path = self.config.path_base.clone().into_os_string();
        path.push(format!(".{}", ordinal));
        PathBuf::from(path)
    }

    pub fn take_error(&self) -> Option<String> {
        self.error.lock().take()
    }

    pub fn wake(&self) {
        self.wakeup.notify_all();
    }

    /// Open (and recover) the current file and build the drain state. Also
    /// writes the initial epoch marker so the file tail is self-describing.
    pub(crate) fn make_core(self: &Arc<Self>) -> Result<LoggerCore> {
        let mut core = LoggerCore {
            logger: Arc::clone(self),
            file: None,
            file_offset: self.current_file_durable_offset.load(Ordering::Acquire),
            io_buffer: Vec::with_capacity(IO_BUFFER_FLUSH_THRESHOLD + LOG_WRITE_UNIT),
            marked_epoch: self.durable_epoch().one_more(),
            dirty_since_sync: false,
            watches: self.workers.iter().map(|_| BufferWatch::default()).collect(),
        };
        core.open_current_file()?;
        core.stage_marker(core.marked_epoch)?;
        core.flush()?;
        core.sync()?;
        Ok(core)
    }

    /// Spawn the logger thread.
    pub fn launch(self: &Arc<Self>, engine: Engine) {
        let logger = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("ember-logger-{}", self.id))
            .spawn(move || {
                let mut core = match logger.make_core() {
                    Ok(core) => core,
                    Err(e) => {
                        *logger.error.lock() = Some(format!("{:#}", e));
                        engine.channel().raise_fatal();
                        return;
                    }
                };
                while !engine.channel().is_stop_requested() {
                    {
                        let mut sleeping = logger.sleep.lock();
                        logger.wakeup.wait_for(&mut sleeping, WAKEUP_INTERVAL);
                    }
                    loop {
                        if engine.channel().is_stop_requested() {
                            break;
                        }
                        let global = engine.xct_manager().current_global_epoch();
                        match core.pass(global) {
                            Ok(true) => engine.log_manager().refresh_durable(),
                            Ok(false) => break,
                            Err(e) => {
                                *logger.error.lock() = Some(format!("{:#}", e));
                                engine.channel().raise_fatal();
                                return;
                            }
                        }
                    }
                }
                // Final drain so shutdown does not strand committed bytes.
                let global = engine.xct_manager().current_global_epoch();
                for _ in 0..2 {
                    if core.pass(global).is_err() {
                        break;
                    }
                }
                let _ = core.flush();
                let _ = core.sync();
                engine.log_manager().refresh_durable();
            })
            .expect("spawn logger thread");
        *self.handle.lock() = Some(handle);
    }

    pub fn join(&self) {
        if let Some(handle) = self.handle.lock().take() {
            self.wakeup.notify_all();
            let _ = handle.join();
        }
    }
}

/// Logger-side view of one worker's epoch marks: which epoch the bytes at
/// the drain cursor belong to, and where that epoch's bytes end (`None`
/// while it is open-ended).
#[derive(Debug, Default, Clone, Copy)]
struct BufferWatch {
    epoch: Epoch,
    limit: Option<u64>,
}

pub(crate) struct LoggerCore {
    logger: Arc<Logger>,
    file: Option<File>,
    file_offset: u64,
    io_buffer: Vec<u8>,
    /// Epoch of the byte stream currently being appended to the file.
    marked_epoch: Epoch,
    dirty_since_sync: bool,
    watches: Vec<BufferWatch>,
}

impl LoggerCore {
    fn open_current_file(&mut self) -> Result<()> {
        if self.logger.config.null_device {
            return Ok(());
        }
        let path = self.logger.current_file_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .wrap_err_with(|| format!("failed to create log directory {:?}", parent))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .wrap_err_with(|| format!("failed to open log file {:?}", path))?;
        let physical_len = file
            .metadata()
            .wrap_err("failed to stat log file")?
            .len();
        if physical_len > self.file_offset {
            // Torn tail from a crash: everything past the savepoint's
            // durable offset is discarded.
            file.set_len(self.file_offset)
                .wrap_err_with(|| format!("failed to truncate log file {:?}", path))?;
            file.sync_all().wrap_err("failed to sync truncated log file")?;
        }
        use std::io::Seek;
        let mut file = file;
        file.seek(std::io::SeekFrom::Start(self.file_offset))
            .wrap_err("failed to seek log file")?;
        self.file = Some(file);
        Ok(())
    }

    pub(crate) fn durable_epoch(&self) -> Epoch {
        self.logger.durable_epoch()
    }

    /// One drain pass over all assigned workers. Returns whether anything
    /// progressed (bytes staged or an epoch sealed); callers keep passing
    /// while it does.
    pub(crate) fn pass(&mut self, global: Epoch) -> Result<bool> {
        let target = self.logger.durable_epoch().one_more();
        let mut progressed = false;

        for i in 0..self.watches.len() {
            progressed |= self.drain_worker(i, target)?;
        }

        if !target.is_before(global) {
            // The target epoch is still open globally; nothing to seal.
            return Ok(progressed);
        }
        if self.all_workers_sealed(target) {
            self.flush()?;
            self.sync()?;
            self.rotate_if_needed()?;
            self.logger.durable_epoch.store(target);
            progressed = true;
        }
        Ok(progressed)
    }

    /// Drain every byte attributed to an epoch `<= target` from worker `i`.
    fn drain_worker(&mut self, i: usize, target: Epoch) -> Result<bool> {
        let worker = Arc::clone(&self.logger.workers[i]);
        let buffer = worker.log_buffer();
        let mut progressed = false;
        loop {
            // Read the committed cursor first; the mark ring is consulted
            // afterwards, so bytes committed after this read can never be
            // attributed to an older epoch.
            let committed = buffer.committed();
            self.refresh_watch(i);
            let watch = self.watches[i];
            if !watch.epoch.is_valid() || target.is_before(watch.epoch) {
                break;
            }
            let upto = match watch.limit {
                Some(limit) => limit.min(committed),
                None => committed,
            };
            let durable = buffer.durable();
            if upto <= durable {
                break;
            }
            let epoch = watch.epoch;
            let (first, second) = buffer.committed_slices(durable, upto);
            self.stage_bytes(epoch, first, second)?;
            buffer.advance_durable(upto);
            progressed = true;
            if watch.limit != Some(upto) && watch.limit.is_some() {
                // Mid-epoch: committed stopped short of the next mark.
                break;
            }
            if watch.limit.is_none() {
                break;
            }
        }
        Ok(progressed)
    }

    /// Pop epoch-mark transitions the drain cursor has fully passed.
    fn refresh_watch(&mut self, i: usize) {
        let buffer = self.logger.workers[i].log_buffer();
        let watch = &mut self.watches[i];
        loop {
            if !watch.epoch.is_valid() {
                match buffer.consume_epoch_mark() {
                    Some(mark) => {
                        watch.epoch = mark.epoch;
                        watch.limit = None;
                    }
                    None => return,
                }
                continue;
            }
            if watch.limit.is_none() {
                match buffer.peek_epoch_mark() {
                    Some(mark) => watch.limit = Some(mark.begin_offset),
                    None => return,
                }
            }
            if let Some(limit) = watch.limit {
                if buffer.durable() >= limit {
                    let mark = buffer
                        .consume_epoch_mark()
                        .expect("peeked mark cannot vanish");
                    watch.epoch = mark.epoch;
                    watch.limit = None;
                    continue;
                }
            }
            return;
        }
    }

    fn all_workers_sealed(&mut self, target: Epoch) -> bool {
        for i in 0..self.watches.len() {
            self.refresh_watch(i);
            let worker = &self.logger.workers[i];
            let buffer = worker.log_buffer();
            let watch = self.watches[i];
            let sealed = if watch.epoch.is_valid() && target.is_before(watch.epoch) {
                // Everything at the cursor already belongs to a later epoch.
                true
            } else if watch.limit.is_some() {
                // A transition mark means undrained bytes at or below the
                // target remain.
                false
            } else {
                // Open-ended (or no epoch seen yet): sealed once the buffer
                // is drained and no commit is publishing into the target.
                buffer.durable() == buffer.committed() && {
                    let in_commit = worker.in_commit_epoch();
                    !in_commit.is_valid() || target.is_before(in_commit)
                }
            };
            if !sealed {
                return false;
            }
        }
        true
    }

    /// Append committed bytes for `epoch`, preceded by an epoch marker when
    /// the stream switches epochs.
    fn stage_bytes(&mut self, epoch: Epoch, first: &[u8], second: &[u8]) -> Result<()> {
        if self.marked_epoch != epoch {
            self.stage_marker(epoch)?;
            self.marked_epoch = epoch;
        }
        self.io_buffer.extend_from_slice(first);
        self.io_buffer.extend_from_slice(second);
        if self.io_buffer.len() >= IO_BUFFER_FLUSH_THRESHOLD {
            self.flush()?;
        }
        Ok(())
    }

    fn stage_marker(&mut self, new_epoch: Epoch) -> Result<()> {
        let marker = EpochMarkerLog::new(self.logger.durable_epoch(), new_epoch, self.logger.id);
        self.io_buffer.extend_from_slice(marker.as_bytes());
        Ok(())
    }

    /// Pad the staged bytes to the 4 KiB write unit and hand them to the
    /// file. Does not fsync.
    pub(crate) fn flush(&mut self) -> Result<()> {
        if self.io_buffer.is_empty() {
            return Ok(());
        }
        let len = self.io_buffer.len();
        let padded = align_to_write_unit(len);
        if padded > len {
            let start = self.io_buffer.len();
            self.io_buffer.resize(padded, 0);
            write_filler(&mut self.io_buffer[start..], padded - len);
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(&self.io_buffer)
                .wrap_err("failed to write log block")?;
        }
        self.file_offset += padded as u64;
        self.io_buffer.clear();
        self.dirty_since_sync = true;
        Ok(())
    }

    /// fsync and publish the durable file offset for the savepoint.
    pub(crate) fn sync(&mut self) -> Result<()> {
        if self.dirty_since_sync {
            if let Some(file) = self.file.as_ref() {
                file.sync_all().wrap_err("failed to fsync log file")?;
            }
            self.dirty_since_sync = false;
        }
        self.logger
            .current_file_durable_offset
            .store(self.file_offset, Ordering::Release);
        Ok(())
    }

    fn rotate_if_needed(&mut self) -> Result<()> {
        if self.file_offset < self.logger.config.rotate_bytes {
            return Ok(());
        }
        debug_assert!(self.io_buffer.is_empty());
        self.file = None;
        let next = self.logger.current_ordinal() + 1;
        self.logger.current_ordinal.store(next, Ordering::Release);
        self.file_offset = 0;
        self.logger
            .current_file_durable_offset
            .store(0, Ordering::Release);
        self.open_current_file()?;
        // A fresh file starts with a marker naming the stream's epoch.
        self.stage_marker(self.marked_epoch)?;
        self.flush()?;
        self.sync()?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn file_offset(&self) -> u64 {
        self.file_offset
    }
}

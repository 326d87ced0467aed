//! # Log Manager
//!
//! Builds the logger fleet (loggers per node × nodes, each owning a
//! disjoint slice of its node's workers), publishes the engine-wide durable
//! epoch, and hosts the durability fence.
//!
//! The durable global epoch is the minimum of every logger's watermark: an
//! epoch is durable for the engine only when *every* logger has it fully on
//! disk. `wait_for_durable` parks on a condvar that loggers poke after each
//! watermark advance.

use std::sync::Arc;
use std::time::Duration;

use eyre::{bail, Result};
use parking_lot::{Condvar, Mutex};

use crate::engine::channel::SharedChannel;
use crate::engine::options::EngineOptions;
use crate::engine::Engine;
use crate::epoch::{AtomicEpoch, Epoch};
use crate::log::logger::{Logger, LoggerConfig, LoggerSavepoint};
use crate::thread::pool::ThreadPool;

pub struct LogManager {
    loggers: Vec<Arc<Logger>>,
    durable_global_epoch: AtomicEpoch,
    sleep: Mutex<bool>,
    durable_advanced: Condvar,
}

impl LogManager {
    /// Wire loggers to workers: worker `w` on node `n` belongs to the
    /// logger `(n, w_in_node % loggers_per_node)`.
    pub fn new(
        options: &EngineOptions,
        pool: &ThreadPool,
        savepoints: &[LoggerSavepoint],
    ) -> Self {
        let per_node = options.log.loggers_per_node.max(1);
        let mut loggers = Vec::new();
        for node in 0..options.thread.group_count {
            let node_workers = pool.workers_on_node(node);
            for logger_in_node in 0..per_node {
                let id = loggers.len() as u16;
                let assigned: Vec<_> = node_workers
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| (*i as u8) % per_node == logger_in_node)
                    .map(|(_, w)| Arc::clone(w))
                    .collect();
                let savepoint = savepoints.get(id as usize).copied().unwrap_or_default();
                loggers.push(Arc::new(Logger::new(
                    id,
                    node,
                    LoggerConfig {
                        path_base: options.log_path(node, u16::from(logger_in_node)),
                        rotate_bytes: options.log_file_rotate_bytes(),
                        null_device: options.log.emulation_null_device,
                    },
                    assigned,
                    savepoint,
                )));
            }
        }
        Self {
            loggers,
            // Computed by the first refresh; stays invalid until every
            // logger has a valid watermark.
            durable_global_epoch: AtomicEpoch::new(Epoch::INVALID),
            sleep: Mutex::new(false),
            durable_advanced: Condvar::new(),
        }
    }

    pub fn loggers(&self) -> &[Arc<Logger>] {
        &self.loggers
    }

    pub fn launch(&self, engine: &Engine) {
        for logger in &self.loggers {
            logger.launch(engine.clone());
        }
    }

    pub fn wake_all(&self) {
        for logger in &self.loggers {
            logger.wake();
        }
    }

    pub fn join_all(&self) {
        for logger in &self.loggers {
            logger.join();
        }
    }

    pub fn durable_global_epoch(&self) -> Epoch {
        self.durable_global_epoch.load()
    }

    /// Recompute `min` over the loggers' watermarks and wake any durability
    /// waiters that the advance unblocked.
    pub fn refresh_durable(&self) {
        let mut min: Option<Epoch> = None;
        for logger in &self.loggers {
            let epoch = logger.durable_epoch();
            if !epoch.is_valid() {
                return;
            }
            min = Some(match min {
                Some(m) => m.min_with(epoch),
                None => epoch,
            });
        }
        if let Some(min) = min {
            if self.durable_global_epoch.store_max(min) {
                self.durable_advanced.notify_all();
            }
        }
    }

    /// Block until `durable_global_epoch >= epoch`. Fails when the engine
    /// stops or goes fatal while waiting.
    pub fn wait_for_durable(&self, epoch: Epoch, channel: &SharedChannel) -> Result<()> {
        debug_assert!(epoch.is_valid());
        loop {
            let durable = self.durable_global_epoch();
            if durable.is_valid() && !durable.is_before(epoch) {
                return Ok(());
            }
            if channel.is_fatal() {
                bail!("engine went fatal while waiting for {} to be durable", epoch);
            }
            if channel.is_stop_requested() {
                bail!("engine stopped while waiting for {} to be durable", epoch);
            }
            self.wake_all();
            let mut sleeping = self.sleep.lock();
            self.durable_advanced
                .wait_for(&mut sleeping, Duration::from_millis(10));
        }
    }

    /// Current per-logger positions, as persisted into the savepoint.
    pub fn savepoint_info(&self) -> Vec<LoggerSavepoint> {
        self.loggers
            .iter()
            .map(|l| LoggerSavepoint {
                current_ordinal: l.current_ordinal(),
                durable_offset: l.current_file_durable_offset(),
                durable_epoch: l.durable_epoch(),
            })
            .collect()
    }

    /// First error any logger recorded, for shutdown reporting.
    pub fn collect_error(&self) -> Option<String> {
        self.loggers.iter().find_map(|l| l.take_error())
    }
}

//! # Procedure Registry
//!
//! Clients never run transactions on their own threads; they register named
//! procedures before engine start and later impersonate a pooled worker to
//! execute one. The registry is the process-wide name → function table that
//! impersonation dispatches through.
//!
//! A procedure receives a [`ProcContext`](crate::thread::pool::ProcContext)
//! (engine handle, the worker's transaction context, input bytes, output
//! buffer) and returns the number of output bytes it produced.
//!
//! The registry freezes when the engine starts: worker threads read it
//! without locking assumptions beyond the map's own, and late registration
//! would be a race with dispatch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::{bail, Result};
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::thread::pool::ProcContext;

pub type ProcFn = Arc<dyn Fn(&mut ProcContext<'_>) -> Result<u32> + Send + Sync>;

#[derive(Default)]
pub struct ProcRegistry {
    procs: RwLock<HashMap<String, ProcFn>>,
    frozen: AtomicBool,
}

impl ProcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, name: &str, proc_fn: F) -> Result<()>
    where
        F: Fn(&mut ProcContext<'_>) -> Result<u32> + Send + Sync + 'static,
    {
        if self.frozen.load(Ordering::Acquire) {
            bail!("cannot register procedure {:?} after engine start", name);
        }
        let mut procs = self.procs.write();
        if procs.contains_key(name) {
            bail!("procedure {:?} already registered", name);
        }
        procs.insert(name.to_owned(), Arc::new(proc_fn));
        Ok(())
    }

    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn get(&self, name: &str) -> Option<ProcFn> {
        self.procs.read().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.procs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.read().is_empty()
    }
}

//! # Shared Channel
//!
//! The process-wide coordination region every long-running thread watches.
//! In the in-process mode this is a plain struct of atomics behind the
//! engine handle; the forked-worker mode would place the same layout in a
//! shared-memory segment, which is why everything here is flat and atomic.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};

use crate::thread::Rendezvous;

pub struct SharedChannel {
    /// Signaled once when the engine finished initializing; workers block
    /// on it before accepting work.
    pub start_rendezvous: Rendezvous,
    stop_flag: AtomicBool,
    /// Engine-fatal flag: a background thread hit an unrecoverable error.
    fatal_flag: AtomicBool,
    pub warmup_complete_counter: AtomicU32,
    /// Bitmap of NUMA nodes whose threads have fully exited.
    exit_nodes: AtomicU16,
    pub preload_snapshot_pages: AtomicBool,
}

impl Default for SharedChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedChannel {
    pub fn new() -> Self {
        Self {
            start_rendezvous: Rendezvous::new(),
            stop_flag: AtomicBool::new(false),
            fatal_flag: AtomicBool::new(false),
            warmup_complete_counter: AtomicU32::new(0),
            exit_nodes: AtomicU16::new(0),
            preload_snapshot_pages: AtomicBool::new(false),
        }
    }

    pub fn request_stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_flag.load(Ordering::Acquire)
    }

    pub fn raise_fatal(&self) {
        self.fatal_flag.store(true, Ordering::Release);
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal_flag.load(Ordering::Acquire)
    }

    pub fn mark_node_exited(&self, node: u8) {
        debug_assert!(node < 16);
        self.exit_nodes.fetch_or(1 << node, Ordering::AcqRel);
    }

    pub fn exited_nodes(&self) -> u16 {
        self.exit_nodes.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_and_fatal_start_clear() {
        let ch = SharedChannel::new();
        assert!(!ch.is_stop_requested());
        assert!(!ch.is_fatal());
        ch.request_stop();
        ch.raise_fatal();
        assert!(ch.is_stop_requested());
        assert!(ch.is_fatal());
    }

    #[test]
    fn exit_nodes_accumulate_as_bitmap() {
        let ch = SharedChannel::new();
        ch.mark_node_exited(0);
        ch.mark_node_exited(3);
        assert_eq!(ch.exited_nodes(), 0b1001);
    }
}

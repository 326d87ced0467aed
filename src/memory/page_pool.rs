//! # Per-Node Page Pool
//!
//! Pre-allocated pool of 4 KiB page frames, one pool per NUMA node. The
//! snapshot composer borrows frames for the pages it builds and the snapshot
//! cache borrows frames for resident pages, so steady-state operation
//! allocates nothing. Frames return to their pool on drop.
//!
//! The pool is sharded 16 ways to keep the free-list lock out of the way
//! when many composer threads run on one node.

use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::storage::page_id::PAGE_SIZE;

const SHARD_COUNT: usize = 16;

pub struct PagePool {
    inner: Arc<PagePoolInner>,
}

struct PagePoolInner {
    node: u8,
    shards: [Mutex<Vec<Box<[u8; PAGE_SIZE]>>>; SHARD_COUNT],
    next_shard: AtomicUsize,
}

impl PagePool {
    /// Pre-allocate `capacity_bytes` worth of frames for `node`, spread
    /// evenly across the shards.
    pub fn new(node: u8, capacity_bytes: usize) -> Self {
        let frames = capacity_bytes / PAGE_SIZE;
        let shards: [Mutex<Vec<Box<[u8; PAGE_SIZE]>>>; SHARD_COUNT] =
            std::array::from_fn(|_| Mutex::new(Vec::new()));
        let per_shard = frames / SHARD_COUNT;
        let remainder = frames % SHARD_COUNT;
        for (i, shard) in shards.iter().enumerate() {
            let count = per_shard + usize::from(i < remainder);
            let mut guard = shard.lock();
            for _ in 0..count {
                guard.push(Box::new([0u8; PAGE_SIZE]));
            }
        }
        Self {
            inner: Arc::new(PagePoolInner {
                node,
                shards,
                next_shard: AtomicUsize::new(0),
            }),
        }
    }

    pub fn node(&self) -> u8 {
        self.inner.node
    }

    /// Take a zeroed frame, allocating if the chosen shard ran dry.
    pub fn acquire(&self) -> PageFrame {
        let shard_idx = self.inner.next_shard.fetch_add(1, Ordering::Relaxed) % SHARD_COUNT;
        let frame = self.inner.shards[shard_idx].lock().pop();
        let mut frame = frame.unwrap_or_else(|| Box::new([0u8; PAGE_SIZE]));
        frame.fill(0);
        PageFrame {
            bytes: ManuallyDrop::new(frame),
            pool: Arc::clone(&self.inner),
            shard_idx,
        }
    }

    pub fn available(&self) -> usize {
        self.inner.shards.iter().map(|s| s.lock().len()).sum()
    }
}

impl Clone for PagePool {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// A 4 KiB frame that returns to its shard when dropped.
pub struct PageFrame {
    bytes: ManuallyDrop<Box<[u8; PAGE_SIZE]>>,
    pool: Arc<PagePoolInner>,
    shard_idx: usize,
}

impl std::fmt::Debug for PageFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageFrame")
            .field("node", &self.pool.node)
            .field("shard_idx", &self.shard_idx)
            .finish()
    }
}

impl Deref for PageFrame {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.bytes
    }
}

impl DerefMut for PageFrame {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.bytes
    }
}

impl Drop for PageFrame {
    fn drop(&mut self) {
        // SAFETY: drop runs once; after `take` the field is never touched
        // again.
        let bytes = unsafe { ManuallyDrop::take(&mut self.bytes) };
        self.pool.shards[self.shard_idx].lock().push(bytes);
    }
}

//! # Memory
//!
//! Per-node memories. Each NUMA node gets its own [`PagePool`] of 4 KiB
//! frames sized by `memory.page_pool_size_mb_per_node`; node-local
//! subsystems (composer, snapshot cache) draw from their node's pool so
//! page frames stay on the memory of the node that works on them.

pub mod page_pool;

pub use page_pool::{PageFrame, PagePool};

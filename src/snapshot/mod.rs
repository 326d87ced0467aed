//! # Snapshots
//!
//! The map-reduce pipeline that folds durable log into immutable on-disk
//! images, plus the read side (page store and cache) that serves them back.
//! A snapshot never blocks the transaction fabric: mappers read only
//! durable file bytes, composers write only fresh pages, and publication is
//! a pointer swap.

pub mod cache;
pub mod manager;
pub mod mapper;
pub mod reducer;
#[allow(clippy::module_inception)]
pub mod snapshot;
pub mod writer;

pub use cache::SnapshotPageStore;
pub use manager::SnapshotManager;
pub use snapshot::{Snapshot, SnapshotId};
pub use writer::SnapshotWriter;

//! # EmberDB - NUMA-Aware In-Memory OLTP Engine
//!
//! EmberDB is the storage-engine core for many-core machines: serializable
//! transactions over typed in-memory storages, redo-only write-ahead
//! logging with epoch-based durability, and a map-reduce pipeline that
//! periodically folds durable log into immutable snapshot images. This
//! Rust implementation prioritizes:
//!
//! - **One atomic word per record**: the XctId is the only synchronization
//!   readers and writers touch; commits lock, validate, publish, unlock in
//!   microseconds
//! - **No coordination on the hot path**: per-worker log buffers are
//!   single-producer/single-consumer with their logger; epochs batch all
//!   global agreement into a few-millisecond cadence
//! - **Node-local everything**: workers, loggers, page pools, and snapshot
//!   files all carry a NUMA node id, so memory traffic stays local
//!
//! ## Quick Start
//!
//! ```ignore
//! use emberdb::{Engine, EngineOptions, IsolationLevel};
//!
//! let engine = Engine::new(EngineOptions::with_root("./data"))?;
//! let accounts = engine.create_array("accounts", 16, 1 << 20)?;
//! engine.register_procedure("deposit", move |ctx| {
//!     ctx.begin(IsolationLevel::Serializable)?;
//!     ctx.overwrite(&accounts, 42, 0, &amount.to_le_bytes())?;
//!     ctx.commit()?;
//!     Ok(0)
//! })?;
//! engine.start()?;
//!
//! let session = engine.impersonate("deposit", &[])?;
//! session.result()?;
//! engine.wait_for_durable(engine.xct_manager().current_global_epoch())?;
//! engine.stop()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │        Engine (options, shared channel)       │
//! ├───────────────┬───────────────┬───────────────┤
//! │  Thread Pool  │  Xct Manager  │   Snapshot    │
//! │ impersonation │ epochs + OCC  │   Manager     │
//! ├───────────────┴───────┬───────┴───────────────┤
//! │  Storages (array: version arena + payloads)   │
//! ├───────────────────────┼───────────────────────┤
//! │ Thread log buffers ──> per-node Loggers ──> WAL
//! ├───────────────────────┴───────────────────────┤
//! │  Gleaner: mapper → reducer → composer → root  │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## On-Disk Layout
//!
//! ```text
//! data_dir/
//! ├── savepoint.xml            # durable offsets, epochs, snapshot roots
//! ├── log/
//! │   ├── node_0_logger_0.0    # rotating per-logger log files
//! │   └── node_1_logger_0.0
//! └── snapshots/
//!     ├── node_0/snapshot_00001.pages
//!     └── node_1/snapshot_00001.pages
//! ```
//!
//! ## Module Overview
//!
//! - [`engine`]: the handle owning every subsystem; options; restart
//! - [`epoch`]: wrap-aware 32-bit engine time
//! - [`xct`]: transaction contexts, the version word, the commit protocol
//! - [`log`]: thread log buffers, loggers, the durable watermark
//! - [`storage`]: array storage, pages, partitioner, composer
//! - [`snapshot`]: mapper/reducer, snapshot writer, page store, manager
//! - [`thread`]: worker pool, impersonation, rendezvous
//! - [`memory`]: per-node page pools

pub mod engine;
pub mod epoch;
pub mod error;
pub mod log;
pub mod memory;
pub mod proc;
pub mod savepoint;
pub mod snapshot;
pub mod storage;
pub mod thread;
pub mod xct;

pub use engine::options::{EngineOptions, SocType};
pub use engine::Engine;
pub use epoch::Epoch;
pub use error::{XctError, XctResult};
pub use snapshot::Snapshot;
pub use storage::array::ArrayStorage;
pub use thread::{ProcContext, Session};
pub use xct::{IsolationLevel, XctId};

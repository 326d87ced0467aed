//! # Threads
//!
//! The pinned worker pool, the impersonation protocol clients drive it
//! with, and the small synchronization pieces the engine's long-running
//! threads share.

pub mod pool;
pub mod rendezvous;

pub use pool::{ProcContext, Session, ThreadPool, WorkerId, WorkerShared};
pub use rendezvous::Rendezvous;

//! # Write-Ahead Log
//!
//! Redo-only logging under epoch-based durability. Workers serialize their
//! intended changes into private circular buffers; per-node logger threads
//! drain those buffers into rotating files in strictly non-decreasing epoch
//! order; the log manager publishes the engine-wide durable epoch (the min
//! across loggers) that `wait_for_durable` fences on.

pub mod logger;
pub mod manager;
pub mod thread_buffer;
pub mod types;

pub use logger::Logger;
pub use manager::LogManager;
pub use thread_buffer::ThreadLogBuffer;

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Store implementations for dagflow
//!
//! File-backed attempts, dag-runs, queues, scheduler state, and the service
//! registry, plus in-memory variants where a process-local store suffices.

pub mod attempt;
pub mod dagdb;
pub mod dagrun;
pub mod fsutil;
pub mod memory;
pub mod noop;
pub mod queue;
pub mod registry;
pub mod watermark;

pub use attempt::FileRunAttempt;
pub use dagdb::{FileDagDatabase, InMemoryDagDatabase};
pub use dagrun::FileDagRunStore;
pub use memory::InMemoryQueueStore;
pub use noop::NoopRunAttempt;
pub use queue::FileQueueStore;
pub use registry::FileServiceRegistry;
pub use watermark::FileWatermarkStore;

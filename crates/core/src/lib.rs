#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Core model and interfaces for dagflow
//!
//! This crate defines the DAG/status data model and the store, registry,
//! dispatcher, and executor abstractions used throughout the system.

pub mod context;
pub mod dag;
pub mod dispatch;
pub mod executor;
pub mod registry;
pub mod status;
pub mod store;

pub use context::{EnvScope, RunContext};
pub use dag::{CatchupPolicy, Dag, Step};
pub use dispatch::{Dispatcher, Task, TaskOperation};
pub use registry::ServiceRegistry;
pub use status::{CreateAttemptOptions, DagRunStatus, Node, OutputVariables, SubDagRun};
pub use store::{
    DagDatabase, DagRunStore, ListStatusOptions, QueueStore, QueuedItem, RunAttempt,
    WatermarkStore,
};

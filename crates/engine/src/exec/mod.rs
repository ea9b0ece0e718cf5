//! Step executors: command, sub-DAG, and the chat variant from
//! `dagflow-agents`. Callers dispatch on the capabilities a variant exposes.

pub mod command;
pub mod subdag;

pub use command::CommandExecutor;
pub use subdag::{LocalToolDagRunner, SubDagExecutor};

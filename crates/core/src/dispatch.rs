//! Distributed dispatch contract

use crate::status::DagRunStatus;
use async_trait::async_trait;
use dagflow_common::error::Result;
use dagflow_common::types::DagRunRef;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What a dispatched task asks the remote worker to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOperation {
    Start,
    Retry,
    Cancel,
}

/// A unit of work shipped to a remote worker.
///
/// The dispatcher only shuttles tasks and status; the task's business logic
/// runs on the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub operation: TaskOperation,
    pub dag_name: String,
    pub dag_run_id: String,
    #[serde(default, skip_serializing_if = "DagRunRef::is_zero")]
    pub root: DagRunRef,
    #[serde(default, skip_serializing_if = "DagRunRef::is_zero")]
    pub parent: DagRunRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<String>,
    /// Labels a worker must match to accept the task
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub worker_selector: HashMap<String, String>,
}

/// Shuttle for tasks and status between this process and remote workers
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Send a task to a worker selected from the coordinator members
    async fn dispatch(&self, task: Task) -> Result<()>;

    /// Poll a remote dag-run's status; `Ok(None)` when the run is unknown
    /// (distinguishable from transport errors)
    async fn get_dag_run_status(
        &self,
        dag_name: &str,
        dag_run_id: &str,
        root: Option<&DagRunRef>,
    ) -> Result<Option<DagRunStatus>>;

    /// Ask the remote worker to begin cancellation
    async fn request_cancel(
        &self,
        dag_name: &str,
        dag_run_id: &str,
        root: Option<&DagRunRef>,
    ) -> Result<()>;

    /// Release client resources
    async fn cleanup(&self) -> Result<()>;
}

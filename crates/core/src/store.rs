//! Store contracts: attempts, dag-runs, queues, watermarks, DAG lookup

use crate::dag::Dag;
use crate::status::{CreateAttemptOptions, DagRunStatus, OutputVariables};
use async_trait::async_trait;
use dagflow_common::error::Result;
use dagflow_common::llm::LlmMessage;
use dagflow_common::timeutil::TimeInUtc;
use dagflow_common::types::{DagRunRef, QueuePriority, RunStatus, SchedulerState};
use std::sync::Arc;

/// Filters for [`DagRunStore::list_statuses`]
#[derive(Debug, Clone, Default)]
pub struct ListStatusOptions {
    pub dag_run_id: Option<String>,
    /// Substring match on the DAG name
    pub name: Option<String>,
    /// Exact match on the DAG name; overrides `name`
    pub exact_name: Option<String>,
    /// Inclusive lower bound on creation time
    pub from: Option<TimeInUtc>,
    /// Exclusive upper bound on creation time
    pub to: Option<TimeInUtc>,
    pub statuses: Vec<RunStatus>,
    /// All listed tags must be present
    pub tags: Vec<String>,
    pub limit: Option<usize>,
}

/// Capability set of one attempt, as exposed to runners.
///
/// `open` acquires the exclusive writer lock; every mutation requires it.
/// The abort flag is a persistent signal visible across processes.
#[async_trait]
pub trait RunAttempt: Send + Sync + std::fmt::Debug {
    /// Attempt id, unique within its dag-run
    fn id(&self) -> String;

    /// Acquire the exclusive writer lock; a second open fails with
    /// `Error::AttemptLocked`
    async fn open(&self) -> Result<()>;

    /// Release the writer lock
    async fn close(&self) -> Result<()>;

    /// Atomic replacement of the persisted status
    async fn write(&self, status: &DagRunStatus) -> Result<()>;

    /// Current coherent snapshot
    async fn read_status(&self) -> Result<DagRunStatus>;

    /// The DAG bound to the attempt at create time
    async fn read_dag(&self) -> Result<Dag>;

    async fn set_dag(&self, dag: &Dag) -> Result<()>;

    /// Set the sticky cross-process cancellation flag
    async fn abort(&self) -> Result<()>;

    async fn is_aborting(&self) -> Result<bool>;

    /// Soft-delete: remove from default listings but keep data
    async fn hide(&self) -> Result<()>;

    async fn hidden(&self) -> bool;

    async fn write_outputs(&self, outputs: &OutputVariables) -> Result<()>;

    async fn read_outputs(&self) -> Result<OutputVariables>;

    /// Persist one chat step's conversation
    async fn write_step_messages(&self, step: &str, messages: &[LlmMessage]) -> Result<()>;

    async fn read_step_messages(&self, step: &str) -> Result<Vec<LlmMessage>>;
}

/// Store of dag-run attempts
#[async_trait]
pub trait DagRunStore: Send + Sync {
    /// Materialize a new attempt.
    ///
    /// Idempotency contract: fails with `Error::DagRunAlreadyExists` only if
    /// the same `(dag, dag_run_id, attempt_id)` is already materialized.
    async fn create_attempt(
        &self,
        dag: &Dag,
        ts: TimeInUtc,
        dag_run_id: &str,
        opts: CreateAttemptOptions,
    ) -> Result<Arc<dyn RunAttempt>>;

    /// Most recent attempt across all run ids of the named DAG
    async fn latest_attempt(&self, name: &str) -> Result<Arc<dyn RunAttempt>>;

    /// Latest attempt for one specific dag-run
    async fn find_attempt(&self, dag_run: &DagRunRef) -> Result<Arc<dyn RunAttempt>>;

    /// Search a root run's tree for a child attempt
    async fn find_sub_attempt(
        &self,
        root: &DagRunRef,
        sub_dag_run_id: &str,
    ) -> Result<Arc<dyn RunAttempt>>;

    async fn list_statuses(&self, opts: ListStatusOptions) -> Result<Vec<DagRunStatus>>;

    /// Delete old runs.
    ///
    /// `retention_days < 0` is a no-op; `0` deletes every run in a final
    /// status; non-final runs are always preserved. Returns removed (or, in
    /// dry-run, candidate) run ids.
    async fn remove_old_dag_runs(
        &self,
        name: &str,
        retention_days: i32,
        dry_run: bool,
    ) -> Result<Vec<String>>;

    /// Rewrite the DAG name on every stored run so history follows rename
    async fn rename_dag_runs(&self, old_name: &str, new_name: &str) -> Result<()>;
}

/// Opaque handle to one queued entry
pub trait QueuedItem: Send + Sync + std::fmt::Debug {
    fn id(&self) -> String;

    /// Lazily decode the queued dag-run reference
    fn data(&self) -> Result<DagRunRef>;
}

/// Coalesced queue-change notifications: the value increments on any mutation
pub type QueueEvents = tokio::sync::watch::Receiver<u64>;

/// Named priority queues of dag-run references
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn enqueue(
        &self,
        name: &str,
        priority: QueuePriority,
        dag_run: DagRunRef,
    ) -> Result<()>;

    /// Atomically remove and return the head item, respecting strict
    /// priority-then-FIFO order; `Error::QueueEmpty` when nothing is queued
    async fn dequeue_by_name(&self, name: &str) -> Result<Box<dyn QueuedItem>>;

    /// Remove and return all items whose data equals `dag_run`; idempotent
    async fn dequeue_by_dag_run_id(
        &self,
        name: &str,
        dag_run: &DagRunRef,
    ) -> Result<Vec<Box<dyn QueuedItem>>>;

    async fn len(&self, name: &str) -> Result<usize>;

    async fn list(&self, name: &str) -> Result<Vec<Box<dyn QueuedItem>>>;

    async fn list_paginated(
        &self,
        name: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Box<dyn QueuedItem>>>;

    async fn list_by_dag_name(
        &self,
        name: &str,
        dag_name: &str,
    ) -> Result<Vec<Box<dyn QueuedItem>>>;

    /// Every queued item across all queues
    async fn all(&self) -> Result<Vec<Box<dyn QueuedItem>>>;

    /// Names of queues currently holding at least one item
    async fn queue_list(&self) -> Result<Vec<String>>;

    /// Subscribe to coalesced change notifications
    fn subscribe(&self) -> QueueEvents;
}

/// Persistence of scheduler state between ticks
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Load persisted state; corruption degrades to an empty state
    async fn load(&self) -> Result<SchedulerState>;

    async fn save(&self, state: &SchedulerState) -> Result<()>;
}

/// Lookup of DAG definitions by name
#[async_trait]
pub trait DagDatabase: Send + Sync {
    async fn get_dag(&self, name: &str) -> Result<Dag>;

    async fn list_dags(&self) -> Result<Vec<Dag>>;
}

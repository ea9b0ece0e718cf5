//! Safe retry enqueue: enqueue first, then persist.
//!
//! The ordering guarantees the queue processor can never observe a `Queued`
//! status without a corresponding queue entry. A failed enqueue leaves the
//! status untouched; a failed write after a successful enqueue leaves a
//! queue entry whose attempt is not Queued, which the processor drops.

use dagflow_common::error::{Result, ResultExt};
use dagflow_common::timeutil::TimeInUtc;
use dagflow_common::types::{DagRunRef, QueuePriority, RunStatus, TriggerType};
use dagflow_core::dag::Dag;
use dagflow_core::status::DagRunStatus;
use dagflow_core::store::{DagRunStore, QueueStore, RunAttempt};
use tracing::{info, instrument};

/// Re-queue a finished run for another attempt.
///
/// Idempotent on an already-Queued status: returns success without touching
/// any store.
#[instrument(skip_all, fields(dag = %dag.name, dag_run_id))]
pub async fn enqueue_retry(
    queue: &dyn QueueStore,
    store: &dyn DagRunStore,
    dag: &Dag,
    status: &mut DagRunStatus,
    dag_run_id: &str,
) -> Result<()> {
    if status.status == RunStatus::Queued {
        return Ok(());
    }

    let dag_run = DagRunRef::new(dag.name.clone(), dag_run_id.to_string());

    // Open before enqueue: if the attempt cannot be written, fail without
    // creating an orphan queue entry
    let attempt = store
        .find_attempt(&dag_run)
        .await
        .ctx("enqueue retry: finding attempt")?;
    attempt.open().await.ctx("enqueue retry: opening attempt")?;

    let enqueue_result = queue
        .enqueue(dag.proc_group(), QueuePriority::Low, dag_run.clone())
        .await;
    if let Err(e) = enqueue_result {
        let _ = attempt.close().await;
        return Err(e.context("enqueue retry: enqueue"));
    }

    // Only after a successful enqueue does the status change
    status.mark_queued(TriggerType::Retry, TimeInUtc::now());
    let write_result = attempt.write(status).await;
    let _ = attempt.close().await;
    write_result.ctx("enqueue retry: writing queued status")?;

    info!(queue = dag.proc_group(), %dag_run, "retry enqueued");
    Ok(())
}

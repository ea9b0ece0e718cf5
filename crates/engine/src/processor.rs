//! Queue processor: watches one named queue and admits work.
//!
//! Wakes on coalesced queue-change events plus a coarse timer. Capacity is
//! checked before dequeuing, so a refusal leaves the item exactly where it
//! was; dequeue is the atomic point of admission.

use crate::runner::AttemptRunner;
use dagflow_common::error::{Error, Result};
use dagflow_common::metrics::{MetricsCollector, NoopMetricsCollector};
use dagflow_common::timeutil::TimeInUtc;
use dagflow_common::types::{DagRunRef, RunStatus};
use dagflow_core::dag::Dag;
use dagflow_core::dispatch::{Task, TaskOperation};
use dagflow_core::store::{DagDatabase, DagRunStore, ListStatusOptions, QueueStore, RunAttempt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub struct QueueProcessor {
    queue_name: String,
    queue: Arc<dyn QueueStore>,
    run_store: Arc<dyn DagRunStore>,
    dag_db: Arc<dyn DagDatabase>,
    runner: Arc<AttemptRunner>,
    dispatcher: Option<Arc<dyn dagflow_core::dispatch::Dispatcher>>,
    global_slots: Arc<Semaphore>,
    wake_interval: Duration,
    metrics: Arc<dyn MetricsCollector>,
}

impl QueueProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue_name: impl Into<String>,
        queue: Arc<dyn QueueStore>,
        run_store: Arc<dyn DagRunStore>,
        dag_db: Arc<dyn DagDatabase>,
        runner: Arc<AttemptRunner>,
        dispatcher: Option<Arc<dyn dagflow_core::dispatch::Dispatcher>>,
        global_slots: Arc<Semaphore>,
        wake_interval: Duration,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            queue,
            run_store,
            dag_db,
            runner,
            dispatcher,
            global_slots,
            wake_interval,
            metrics: Arc::new(NoopMetricsCollector),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Watch the queue until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        let mut events = self.queue.subscribe();
        let mut ticker = tokio::time::interval(self.wake_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(queue = %self.queue_name, "queue processor started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = events.changed() => {}
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.drain(&cancel).await {
                warn!(queue = %self.queue_name, error = %e, "drain failed");
            }
        }
        info!(queue = %self.queue_name, "queue processor stopped");
    }

    /// Admit items until the queue is empty or admission is refused.
    ///
    /// Runs one item at a time; parallelism comes from running one
    /// processor per queue name and from node-level concurrency inside the
    /// runner.
    #[instrument(skip_all, fields(queue = %self.queue_name))]
    pub async fn drain(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            // Global capacity gates before any dequeue
            let Ok(permit) = Arc::clone(&self.global_slots).try_acquire_owned() else {
                debug!("no global slots free; leaving items queued");
                return Ok(());
            };

            // Peek the head to resolve the DAG and apply per-DAG limits
            // without removing the item
            let head = self.queue.list_paginated(&self.queue_name, 0, 1).await?;
            let Some(head_item) = head.first() else {
                drop(permit);
                return Ok(());
            };
            let dag_run = head_item.data()?;

            let dag = match self.dag_db.get_dag(&dag_run.name).await {
                Ok(dag) => dag,
                Err(e) => {
                    warn!(dag = %dag_run.name, error = %e, "cannot resolve DAG; dropping item");
                    let _ = self
                        .queue
                        .dequeue_by_dag_run_id(&self.queue_name, &dag_run)
                        .await;
                    self.fail_attempt(&dag_run, &format!("DAG not resolvable: {e}"))
                        .await;
                    drop(permit);
                    continue;
                }
            };

            if let Some(max) = dag.max_active_runs {
                let active = self.active_run_count(&dag.name).await?;
                if active >= max {
                    debug!(dag = %dag.name, active, max, "per-DAG limit reached; refusing");
                    drop(permit);
                    return Ok(());
                }
            }

            let item = match self.queue.dequeue_by_name(&self.queue_name).await {
                Ok(item) => item,
                Err(e) if matches!(e.root(), Error::QueueEmpty(_)) => {
                    drop(permit);
                    return Ok(());
                }
                Err(e) => {
                    drop(permit);
                    return Err(e);
                }
            };
            let dag_run = item.data()?;
            if let Ok(depth) = self.queue.len(&self.queue_name).await {
                self.metrics.record_queue_depth(&self.queue_name, depth);
            }

            self.process_item(&dag, &dag_run, cancel).await;
            drop(permit);
        }
    }

    async fn active_run_count(&self, dag_name: &str) -> Result<usize> {
        let running = self
            .run_store
            .list_statuses(ListStatusOptions {
                exact_name: Some(dag_name.to_string()),
                statuses: vec![RunStatus::Running],
                ..ListStatusOptions::default()
            })
            .await?;
        Ok(running.len())
    }

    async fn process_item(&self, dag: &Dag, dag_run: &DagRunRef, cancel: &CancellationToken) {
        let attempt = match self.run_store.find_attempt(dag_run).await {
            Ok(attempt) => attempt,
            Err(e) => {
                warn!(%dag_run, error = %e, "queued item has no attempt; dropping");
                return;
            }
        };

        let status = match attempt.read_status().await {
            Ok(status) => status,
            Err(e) => {
                warn!(%dag_run, error = %e, "unreadable attempt status; dropping");
                return;
            }
        };
        if status.status != RunStatus::Queued {
            // Enqueue-first ordering means a stray entry can outlive a
            // failed status write; drop it rather than double-run
            warn!(%dag_run, status = %status.status, "attempt is not queued; dropping item");
            return;
        }

        if dag.is_distributed() {
            if let Some(dispatcher) = &self.dispatcher {
                let task = Task {
                    operation: TaskOperation::Start,
                    dag_name: dag.name.clone(),
                    dag_run_id: dag_run.id.clone(),
                    root: status.root.clone(),
                    parent: status.parent.clone(),
                    params: status.params.clone(),
                    worker_selector: dag.worker_selector.clone(),
                };
                match dispatcher.dispatch(task).await {
                    Ok(()) => {
                        info!(%dag_run, "dispatched to remote worker");
                    }
                    Err(e) => {
                        warn!(%dag_run, error = %e, "dispatch failed");
                        self.fail_attempt(dag_run, &format!("dispatch failed: {e}"))
                            .await;
                    }
                }
                return;
            }
            warn!(%dag_run, "distributed DAG but no dispatcher; running locally");
        }

        let started = Instant::now();
        let outcome = self
            .runner
            .run_attempt(dag, Arc::clone(&attempt), cancel.child_token())
            .await;

        match outcome {
            Ok(final_status) => {
                self.metrics.record_dag_run(
                    &dag.name,
                    final_status.as_str(),
                    status.trigger_type.as_str(),
                    started.elapsed().as_secs_f64(),
                );
            }
            Err(e) => {
                warn!(%dag_run, error = %e, "runner failed");
                self.metrics.record_error("processor", "high");
                self.fail_attempt(dag_run, &format!("runner error: {e}")).await;
            }
        }
    }

    /// Best-effort terminal Failed write for an attempt the processor
    /// cannot run
    async fn fail_attempt(&self, dag_run: &DagRunRef, reason: &str) {
        let Ok(attempt) = self.run_store.find_attempt(dag_run).await else {
            return;
        };
        if attempt.open().await.is_err() {
            return;
        }
        if let Ok(mut status) = attempt.read_status().await {
            if !status.status.is_final() {
                status.error = Some(reason.to_string());
                status.mark_finished(RunStatus::Failed, TimeInUtc::now());
                let _ = attempt.write(&status).await;
            }
        }
        let _ = attempt.close().await;
    }
}

/// Convenience used by tests and the engine wiring to mark a fresh attempt
/// Queued after its enqueue succeeded
pub async fn mark_attempt_queued(attempt: &Arc<dyn RunAttempt>) -> Result<()> {
    attempt.open().await?;
    let mut status = attempt.read_status().await?;
    let trigger = status.trigger_type;
    status.mark_queued(trigger, TimeInUtc::now());
    let write_result = attempt.write(&status).await;
    let _ = attempt.close().await;
    write_result
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagflow_agents::ClientFactory;
    use dagflow_common::types::QueuePriority;
    use dagflow_core::dag::Step;
    use dagflow_core::status::CreateAttemptOptions;
    use dagflow_store::{FileDagRunStore, InMemoryDagDatabase, InMemoryQueueStore};
    use mockall::mock;

    mock! {
        Database {}

        #[async_trait::async_trait]
        impl DagDatabase for Database {
            async fn get_dag(&self, name: &str) -> dagflow_common::error::Result<Dag>;
            async fn list_dags(&self) -> dagflow_common::error::Result<Vec<Dag>>;
        }
    }

    struct Harness {
        processor: QueueProcessor,
        queue: Arc<InMemoryQueueStore>,
        store: Arc<FileDagRunStore>,
        dag_db: Arc<InMemoryDagDatabase>,
        _dir: tempfile::TempDir,
    }

    fn harness(slots: usize) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileDagRunStore::new(dir.path()));
        let queue = Arc::new(InMemoryQueueStore::new());
        let dag_db = Arc::new(InMemoryDagDatabase::new());
        let factory: ClientFactory =
            Arc::new(|_| Err(Error::Provider("no provider in tests".to_string())));
        let runner = Arc::new(AttemptRunner::new(
            Arc::clone(&store) as Arc<dyn DagRunStore>,
            Arc::clone(&queue) as Arc<dyn QueueStore>,
            Arc::clone(&dag_db) as Arc<dyn DagDatabase>,
            None,
            factory,
            dir.path().join("logs"),
            Duration::from_millis(10),
        ));
        let processor = QueueProcessor::new(
            "default",
            Arc::clone(&queue) as Arc<dyn QueueStore>,
            Arc::clone(&store) as Arc<dyn DagRunStore>,
            Arc::clone(&dag_db) as Arc<dyn DagDatabase>,
            runner,
            None,
            Arc::new(Semaphore::new(slots)),
            Duration::from_secs(60),
        );
        Harness {
            processor,
            queue,
            store,
            dag_db,
            _dir: dir,
        }
    }

    fn dag(name: &str, run: &str) -> Dag {
        Dag {
            name: name.to_string(),
            proc_group: Some("default".to_string()),
            steps: vec![Step {
                name: "work".to_string(),
                run: Some(run.to_string()),
                ..Step::default()
            }],
            ..Dag::default()
        }
    }

    async fn enqueue_run(h: &Harness, dag: &Dag, run_id: &str) -> Arc<dyn RunAttempt> {
        let attempt = h
            .store
            .create_attempt(dag, TimeInUtc::now(), run_id, CreateAttemptOptions::default())
            .await
            .unwrap();
        h.queue
            .enqueue(
                "default",
                QueuePriority::Low,
                DagRunRef::new(dag.name.clone(), run_id.to_string()),
            )
            .await
            .unwrap();
        mark_attempt_queued(&attempt).await.unwrap();
        attempt
    }

    #[tokio::test]
    async fn drains_and_runs_queued_item() {
        let h = harness(4);
        let d = dag("etl", "echo done");
        h.dag_db.insert(d.clone());
        let attempt = enqueue_run(&h, &d, "r1").await;

        h.processor.drain(&CancellationToken::new()).await.unwrap();

        assert_eq!(h.queue.len("default").await.unwrap(), 0);
        let status = attempt.read_status().await.unwrap();
        assert_eq!(status.status, RunStatus::Succeeded);
        assert_ne!(status.started_at, "-");
        assert_ne!(status.finished_at, "-");
    }

    #[tokio::test]
    async fn capacity_refusal_leaves_item_queued() {
        let h = harness(0);
        let d = dag("etl", "echo done");
        h.dag_db.insert(d.clone());
        enqueue_run(&h, &d, "r1").await;

        h.processor.drain(&CancellationToken::new()).await.unwrap();

        // No slots: the item must still be exactly where it was
        assert_eq!(h.queue.len("default").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn not_queued_attempt_is_dropped_without_running() {
        let h = harness(4);
        let d = dag("etl", "echo done");
        h.dag_db.insert(d.clone());

        // Attempt exists but was never marked Queued (failed status write
        // after a successful enqueue)
        let attempt = h
            .store
            .create_attempt(&d, TimeInUtc::now(), "r1", CreateAttemptOptions::default())
            .await
            .unwrap();
        h.queue
            .enqueue("default", QueuePriority::Low, DagRunRef::new("etl", "r1"))
            .await
            .unwrap();

        h.processor.drain(&CancellationToken::new()).await.unwrap();

        assert_eq!(h.queue.len("default").await.unwrap(), 0);
        let status = attempt.read_status().await.unwrap();
        assert_eq!(status.status, RunStatus::NotStarted);
    }

    #[tokio::test]
    async fn unresolvable_dag_fails_the_attempt() {
        let h = harness(4);
        let d = dag("ghost", "echo done");
        // Not inserted into the DAG database
        let attempt = enqueue_run(&h, &d, "r1").await;

        h.processor.drain(&CancellationToken::new()).await.unwrap();

        assert_eq!(h.queue.len("default").await.unwrap(), 0);
        let status = attempt.read_status().await.unwrap();
        assert_eq!(status.status, RunStatus::Failed);
        assert!(status.error.as_deref().unwrap().contains("not resolvable"));
    }

    #[tokio::test]
    async fn per_dag_limit_refuses_admission() {
        let h = harness(4);
        let mut d = dag("limited", "echo done");
        d.max_active_runs = Some(1);
        h.dag_db.insert(d.clone());

        // A run already marked Running occupies the only slot
        let running = h
            .store
            .create_attempt(&d, TimeInUtc::now(), "busy", CreateAttemptOptions::default())
            .await
            .unwrap();
        running.open().await.unwrap();
        let mut status = running.read_status().await.unwrap();
        status.mark_running(TimeInUtc::now());
        running.write(&status).await.unwrap();
        running.close().await.unwrap();

        enqueue_run(&h, &d, "r2").await;
        h.processor.drain(&CancellationToken::new()).await.unwrap();

        assert_eq!(h.queue.len("default").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dag_resolution_goes_through_the_database() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileDagRunStore::new(dir.path()));
        let queue = Arc::new(InMemoryQueueStore::new());
        let d = dag("etl", "echo done");

        // One queued item means exactly one lookup; list_dags stays unused
        let mut db = MockDatabase::new();
        let resolved = d.clone();
        db.expect_get_dag()
            .withf(|name| name == "etl")
            .times(1)
            .returning(move |_| Ok(resolved.clone()));
        let dag_db: Arc<dyn DagDatabase> = Arc::new(db);

        let factory: ClientFactory =
            Arc::new(|_| Err(Error::Provider("no provider in tests".to_string())));
        let runner = Arc::new(AttemptRunner::new(
            Arc::clone(&store) as Arc<dyn DagRunStore>,
            Arc::clone(&queue) as Arc<dyn QueueStore>,
            Arc::clone(&dag_db),
            None,
            factory,
            dir.path().join("logs"),
            Duration::from_millis(10),
        ));
        let processor = QueueProcessor::new(
            "default",
            Arc::clone(&queue) as Arc<dyn QueueStore>,
            Arc::clone(&store) as Arc<dyn DagRunStore>,
            Arc::clone(&dag_db),
            runner,
            None,
            Arc::new(Semaphore::new(4)),
            Duration::from_secs(60),
        );

        let attempt = store
            .create_attempt(&d, TimeInUtc::now(), "r1", CreateAttemptOptions::default())
            .await
            .unwrap();
        queue
            .enqueue("default", QueuePriority::Low, DagRunRef::new("etl", "r1"))
            .await
            .unwrap();
        mark_attempt_queued(&attempt).await.unwrap();

        processor.drain(&CancellationToken::new()).await.unwrap();

        assert_eq!(queue.len("default").await.unwrap(), 0);
        assert_eq!(
            attempt.read_status().await.unwrap().status,
            RunStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn multiple_items_run_in_queue_order() {
        let h = harness(4);
        let d = dag("etl", "echo done");
        h.dag_db.insert(d.clone());
        let first = enqueue_run(&h, &d, "r1").await;
        let second = enqueue_run(&h, &d, "r2").await;

        h.processor.drain(&CancellationToken::new()).await.unwrap();

        assert_eq!(h.queue.len("default").await.unwrap(), 0);
        for attempt in [first, second] {
            assert_eq!(
                attempt.read_status().await.unwrap().status,
                RunStatus::Succeeded
            );
        }
    }
}

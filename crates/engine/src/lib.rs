#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Execution engine for dagflow: scheduler, queue processors, the attempt
//! runner, and the remote dispatcher client.

pub mod dispatcher;
pub mod enqueue;
pub mod exec;
pub mod processor;
pub mod runner;
pub mod scheduler;

pub use dispatcher::HttpDispatcher;
pub use enqueue::enqueue_retry;
pub use processor::QueueProcessor;
pub use runner::AttemptRunner;
pub use scheduler::Scheduler;

use dagflow_agents::{default_client_factory, ClientFactory};
use dagflow_common::config::Config;
use dagflow_common::error::{Result, ResultExt};
use dagflow_common::metrics::{DefaultMetricsCollector, MetricsCollector};
use dagflow_common::types::{HostInfo, HostStatus, ServiceRole};
use dagflow_core::context::EnvScope;
use dagflow_core::dispatch::Dispatcher;
use dagflow_core::registry::ServiceRegistry;
use dagflow_core::store::{DagDatabase, DagRunStore, QueueStore, WatermarkStore};
use dagflow_store::{
    FileDagDatabase, FileDagRunStore, FileQueueStore, FileServiceRegistry, FileWatermarkStore,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Fully wired engine: stores, scheduler, and one processor per queue
pub struct Engine {
    config: Config,
    host_id: String,
    pub run_store: Arc<dyn DagRunStore>,
    pub queue_store: Arc<FileQueueStore>,
    pub dag_db: Arc<dyn DagDatabase>,
    pub watermarks: Arc<dyn WatermarkStore>,
    pub registry: Arc<dyn ServiceRegistry>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub runner: Arc<AttemptRunner>,
    metrics: Arc<dyn MetricsCollector>,
}

impl Engine {
    pub fn new(config: Config) -> Result<Self> {
        let data_dir = &config.paths.data_dir;
        let run_store: Arc<dyn DagRunStore> = Arc::new(FileDagRunStore::new(data_dir));
        let queue_store = Arc::new(FileQueueStore::new(data_dir));
        let dag_db: Arc<dyn DagDatabase> = Arc::new(FileDagDatabase::new(&config.paths.dags_dir));
        let watermarks: Arc<dyn WatermarkStore> = Arc::new(FileWatermarkStore::new(data_dir));
        let registry: Arc<dyn ServiceRegistry> = Arc::new(FileServiceRegistry::new(
            data_dir,
            Duration::from_secs(config.registry.heartbeat_ttl_secs),
        ));
        let dispatcher: Arc<dyn Dispatcher> = Arc::new(HttpDispatcher::new(
            Arc::clone(&registry),
            &config.dispatcher,
        )?);

        let client_factory: ClientFactory =
            default_client_factory(EnvScope::from_os(), config.clone());
        let runner = Arc::new(AttemptRunner::new(
            Arc::clone(&run_store),
            Arc::clone(&queue_store) as Arc<dyn QueueStore>,
            Arc::clone(&dag_db),
            Some(Arc::clone(&dispatcher)),
            client_factory,
            config.paths.log_dir.clone(),
            Duration::from_millis(config.engine.status_write_coalesce_ms),
        ));

        let host_id = format!("dagflow-{}", Uuid::new_v4().simple());
        Ok(Self {
            config,
            host_id,
            run_store,
            queue_store,
            dag_db,
            watermarks,
            registry,
            dispatcher,
            runner,
            metrics: Arc::new(DefaultMetricsCollector),
        })
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// Register this host, start the scheduler and processors, and block
    /// until cancelled.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let host = HostInfo {
            id: self.host_id.clone(),
            host: hostname(),
            port: 0,
            status: HostStatus::Active,
            started_at: None,
            namespace: self.config.paths.namespace.clone(),
        };
        for role in [ServiceRole::Scheduler, ServiceRole::Worker] {
            self.registry
                .register(role, host.clone())
                .await
                .ctx("registering host")?;
        }

        let mut tasks = JoinSet::new();

        // Heartbeat
        {
            let registry = Arc::clone(&self.registry);
            let host_id = self.host_id.clone();
            let interval = Duration::from_secs(self.config.registry.heartbeat_interval_secs);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    for role in [ServiceRole::Scheduler, ServiceRole::Worker] {
                        if let Err(e) = registry.heartbeat(role, &host_id).await {
                            warn!(error = %e, "heartbeat failed");
                        }
                    }
                }
            });
        }

        // Scheduler (leader-gated internally)
        {
            let scheduler = Scheduler::new(
                Arc::clone(&self.dag_db),
                Arc::clone(&self.run_store),
                Arc::clone(&self.queue_store) as Arc<dyn QueueStore>,
                Arc::clone(&self.watermarks),
                Arc::clone(&self.registry),
                self.host_id.clone(),
                self.config.scheduler.clone(),
            );
            let cancel = cancel.clone();
            tasks.spawn(async move {
                if let Err(e) = scheduler.run(cancel).await {
                    warn!(error = %e, "scheduler exited with error");
                }
            });
        }

        // One processor per process group; external enqueues wake them
        // through the queue directory watcher
        let _watcher = self
            .queue_store
            .start_dir_watcher()
            .ctx("starting queue watcher")?;
        let global_slots = Arc::new(Semaphore::new(self.config.engine.max_concurrent_runs));
        for queue_name in self.process_groups().await? {
            let processor = QueueProcessor::new(
                queue_name.clone(),
                Arc::clone(&self.queue_store) as Arc<dyn QueueStore>,
                Arc::clone(&self.run_store),
                Arc::clone(&self.dag_db),
                Arc::clone(&self.runner),
                Some(Arc::clone(&self.dispatcher)),
                Arc::clone(&global_slots),
                Duration::from_secs(self.config.engine.processor_wake_interval_secs),
            )
            .with_metrics(Arc::clone(&self.metrics));
            let cancel = cancel.clone();
            tasks.spawn(async move {
                processor.run(cancel).await;
            });
            info!(queue = %queue_name, "processor spawned");
        }

        cancel.cancelled().await;
        while tasks.join_next().await.is_some() {}

        for role in [ServiceRole::Scheduler, ServiceRole::Worker] {
            let _ = self.registry.unregister(role, &self.host_id).await;
        }
        Ok(())
    }

    /// Queue names this instance serves: every DAG's process group plus
    /// queues that already hold items
    async fn process_groups(&self) -> Result<Vec<String>> {
        let mut names = BTreeSet::new();
        for dag in self.dag_db.list_dags().await? {
            names.insert(dag.proc_group().to_string());
        }
        for name in self.queue_store.queue_list().await? {
            names.insert(name);
        }
        Ok(names.into_iter().collect())
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

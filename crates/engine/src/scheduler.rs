//! Watermark-driven scheduler.
//!
//! A single leader (gated by the service registry) ticks on an interval,
//! computes the firings due per DAG since its watermark, applies the
//! catchup policy, and admits runs with enqueue-first persistence.

use dagflow_common::config::SchedulerConfig;
use dagflow_common::error::{Error, Result, ResultExt};
use dagflow_common::timeutil::TimeInUtc;
use dagflow_common::types::{
    DagRunRef, QueuePriority, SchedulerState, ServiceRole, TriggerType,
};
use dagflow_core::dag::{CatchupPolicy, Dag};
use dagflow_core::registry::ServiceRegistry;
use dagflow_core::status::CreateAttemptOptions;
use dagflow_core::store::{DagDatabase, DagRunStore, QueueStore, RunAttempt, WatermarkStore};
use parking_lot::Mutex;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// One firing the scheduler decided to admit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedFiring {
    pub scheduled_time: TimeInUtc,
    pub trigger: TriggerType,
}

/// Apply a catchup policy to the firings in `(watermark, now]`.
///
/// `epsilon` separates "current" firings (within the live tick window) from
/// missed ones. Firings strictly in the past get `TriggerType::Catchup`
/// when the policy admits them.
pub fn plan_firings(
    policy: CatchupPolicy,
    firings: &[TimeInUtc],
    now: TimeInUtc,
    epsilon: Duration,
    cap: usize,
) -> Vec<PlannedFiring> {
    let live_cutoff = now.epoch_millis() - epsilon.as_millis() as i64;
    let trigger_for = |t: TimeInUtc| {
        if t.epoch_millis() >= live_cutoff {
            TriggerType::Schedule
        } else {
            TriggerType::Catchup
        }
    };

    match policy {
        CatchupPolicy::Off => firings
            .iter()
            .filter(|t| t.epoch_millis() >= live_cutoff)
            .map(|&t| PlannedFiring {
                scheduled_time: t,
                trigger: TriggerType::Schedule,
            })
            .collect(),
        CatchupPolicy::Latest => firings
            .last()
            .map(|&t| PlannedFiring {
                scheduled_time: t,
                trigger: trigger_for(t),
            })
            .into_iter()
            .collect(),
        CatchupPolicy::All => {
            let skip = firings.len().saturating_sub(cap);
            if skip > 0 {
                warn!(dropped = skip, cap, "catchup window overflow; newest firings win");
            }
            firings[skip..]
                .iter()
                .map(|&t| PlannedFiring {
                    scheduled_time: t,
                    trigger: trigger_for(t),
                })
                .collect()
        }
    }
}

/// Parse a cron expression, accepting the standard 5-field form
pub fn parse_cron(expr: &str) -> Result<cron::Schedule> {
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|e| Error::Validation(format!("invalid cron expression {expr:?}: {e}")))
}

/// All firing times of a DAG's schedules in `(after, until]`, merged and
/// de-duplicated in chronological order
pub fn firing_times(dag: &Dag, after: TimeInUtc, until: TimeInUtc) -> Result<Vec<TimeInUtc>> {
    let mut firings = Vec::new();
    for expr in &dag.schedule {
        let schedule = parse_cron(expr).ctx(format!("DAG {}", dag.name))?;
        for t in schedule.after(&after.inner()) {
            if t > until.inner() {
                break;
            }
            firings.push(TimeInUtc::from_datetime(t));
        }
    }
    firings.sort();
    firings.dedup();
    Ok(firings)
}

/// Deterministic run id for one scheduled firing, so a crash between
/// enqueue and watermark save cannot double-admit the same firing
pub fn scheduled_run_id(firing: TimeInUtc) -> String {
    format!("scheduled-{}", firing.inner().format("%Y%m%dT%H%M%SZ"))
}

pub struct Scheduler {
    dag_db: Arc<dyn DagDatabase>,
    run_store: Arc<dyn DagRunStore>,
    queue: Arc<dyn QueueStore>,
    watermarks: Arc<dyn WatermarkStore>,
    registry: Arc<dyn ServiceRegistry>,
    host_id: String,
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    pub fn new(
        dag_db: Arc<dyn DagDatabase>,
        run_store: Arc<dyn DagRunStore>,
        queue: Arc<dyn QueueStore>,
        watermarks: Arc<dyn WatermarkStore>,
        registry: Arc<dyn ServiceRegistry>,
        host_id: impl Into<String>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            dag_db,
            run_store,
            queue,
            watermarks,
            registry,
            host_id: host_id.into(),
            config,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.config.tick_interval_secs)
    }

    /// Load state once, then tick until cancelled; state is saved
    /// periodically and on clean shutdown.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        *self.state.lock() = self.watermarks.load().await?;
        info!(host = %self.host_id, "scheduler started");

        let mut ticker = tokio::time::interval(self.tick_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut ticks_since_save = 0u64;
        let save_every = (self.config.state_save_interval_secs
            / self.config.tick_interval_secs.max(1))
        .max(1);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.registry.is_leader(ServiceRole::Scheduler, &self.host_id).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(host = %self.host_id, "standby; another scheduler leads");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "leadership check failed; skipping tick");
                    continue;
                }
            }

            if let Err(e) = self.tick(TimeInUtc::now()).await {
                warn!(error = %e, "scheduler tick failed");
            }

            ticks_since_save += 1;
            if ticks_since_save >= save_every {
                ticks_since_save = 0;
                self.save_state().await;
            }
        }

        self.save_state().await;
        info!(host = %self.host_id, "scheduler stopped");
        Ok(())
    }

    async fn save_state(&self) {
        let snapshot = self.state.lock().clone();
        if let Err(e) = self.watermarks.save(&snapshot).await {
            warn!(error = %e, "failed to save scheduler state");
        }
    }

    /// One scheduler pass over every scheduled DAG
    #[instrument(skip(self), fields(host = %self.host_id))]
    pub async fn tick(&self, now: TimeInUtc) -> Result<()> {
        let dags = self.dag_db.list_dags().await.ctx("scheduler tick")?;
        for dag in dags.iter().filter(|d| !d.schedule.is_empty()) {
            if let Err(e) = self.tick_dag(dag, now).await {
                warn!(dag = %dag.name, error = %e, "skipping DAG this tick");
            }
        }
        self.state.lock().last_tick = Some(now);
        Ok(())
    }

    async fn tick_dag(&self, dag: &Dag, now: TimeInUtc) -> Result<()> {
        let after = {
            let state = self.state.lock();
            state.watermark(&dag.name).unwrap_or_else(|| {
                // First sight of this DAG: look back one tick, no backfill
                TimeInUtc::from_epoch_millis(
                    now.epoch_millis() - self.tick_interval().as_millis() as i64,
                )
                .unwrap_or(now)
            })
        };

        let firings = firing_times(dag, after, now)?;
        if firings.is_empty() {
            return Ok(());
        }

        let plan = plan_firings(
            dag.catchup_policy,
            &firings,
            now,
            self.tick_interval(),
            self.config.catchup_window_limit,
        );

        for firing in plan {
            self.admit_firing(dag, firing, now).await?;
            self.state
                .lock()
                .advance(&dag.name, firing.scheduled_time);
        }

        // Discarded firings still advance the watermark so they are not
        // reconsidered forever
        if let Some(&latest) = firings.last() {
            self.state.lock().advance(&dag.name, latest);
        }
        Ok(())
    }

    /// Create the attempt, enqueue, and only then persist the Queued status
    async fn admit_firing(
        &self,
        dag: &Dag,
        firing: PlannedFiring,
        now: TimeInUtc,
    ) -> Result<()> {
        let run_id = scheduled_run_id(firing.scheduled_time);
        let opts = CreateAttemptOptions {
            trigger: firing.trigger,
            scheduled_time: Some(firing.scheduled_time),
            ..CreateAttemptOptions::default()
        };

        let attempt = match self.run_store.create_attempt(dag, now, &run_id, opts).await {
            Ok(attempt) => attempt,
            Err(e) if matches!(e.root(), Error::DagRunAlreadyExists(_)) => {
                debug!(dag = %dag.name, %run_id, "firing already admitted");
                return Ok(());
            }
            Err(e) => return Err(e.context("admitting scheduled firing")),
        };

        let dag_run = DagRunRef::new(dag.name.clone(), run_id);
        self.queue
            .enqueue(dag.proc_group(), QueuePriority::Low, dag_run.clone())
            .await
            .ctx("enqueueing scheduled firing")?;

        attempt.open().await?;
        let mut status = attempt.read_status().await?;
        status.mark_queued(firing.trigger, now);
        let write_result = attempt.write(&status).await;
        let _ = attempt.close().await;
        write_result?;

        info!(
            dag = %dag.name,
            %dag_run,
            scheduled = %firing.scheduled_time,
            trigger = firing.trigger.as_str(),
            "run admitted"
        );
        Ok(())
    }
}

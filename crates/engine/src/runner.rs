//! Attempt runner: drives one attempt's node DAG to terminal status.
//!
//! Nodes whose dependencies are satisfied run concurrently as a batch; the
//! full status is persisted after every node transition with writes
//! coalesced per attempt, except terminal transitions which always write
//! synchronously. The cross-process abort flag is polled at node
//! boundaries.

use crate::exec::{CommandExecutor, LocalToolDagRunner, SubDagExecutor};
use dagflow_agents::{ChatExecutor, ClientFactory};
use dashmap::DashMap;
use dagflow_common::error::{Error, Result, ResultExt};
use dagflow_common::llm::LlmMessage;
use dagflow_common::metrics::{MetricsCollector, NoopMetricsCollector};
use dagflow_common::timeutil::TimeInUtc;
use dagflow_common::types::{NodeStatus, RunStatus};
use dagflow_core::context::{EnvScope, RunContext};
use dagflow_core::dag::{Condition, Dag, ExecutorKind, RetryPolicy};
use dagflow_core::dispatch::Dispatcher;
use dagflow_core::executor::{ChatMessageHandler, StepExecutor};
use dagflow_core::status::{DagRunStatus, Node};
use dagflow_core::store::{DagDatabase, DagRunStore, QueueStore, RunAttempt};
use futures::future::join_all;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Coalesces non-terminal status writes to one per interval
struct StatusWriter {
    attempt: Arc<dyn RunAttempt>,
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl StatusWriter {
    fn new(attempt: Arc<dyn RunAttempt>, min_interval: Duration) -> Self {
        Self {
            attempt,
            min_interval,
            last: Mutex::new(None),
        }
    }

    async fn write(&self, status: &DagRunStatus, force: bool) -> Result<()> {
        if !force {
            let last = *self.last.lock();
            if let Some(last) = last {
                if last.elapsed() < self.min_interval {
                    return Ok(());
                }
            }
        }
        self.attempt.write(status).await?;
        *self.last.lock() = Some(Instant::now());
        Ok(())
    }
}

pub struct AttemptRunner {
    run_store: Arc<dyn DagRunStore>,
    queue_store: Arc<dyn QueueStore>,
    dag_db: Arc<dyn DagDatabase>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    client_factory: ClientFactory,
    log_dir: PathBuf,
    coalesce: Duration,
    metrics: Arc<dyn MetricsCollector>,
    /// Runs currently executing in this process, keyed by attempt key
    active: DashMap<String, CancellationToken>,
}

impl AttemptRunner {
    pub fn new(
        run_store: Arc<dyn DagRunStore>,
        queue_store: Arc<dyn QueueStore>,
        dag_db: Arc<dyn DagDatabase>,
        dispatcher: Option<Arc<dyn Dispatcher>>,
        client_factory: ClientFactory,
        log_dir: PathBuf,
        coalesce: Duration,
    ) -> Self {
        Self {
            run_store,
            queue_store,
            dag_db,
            dispatcher,
            client_factory,
            log_dir,
            coalesce,
            metrics: Arc::new(NoopMetricsCollector),
            active: DashMap::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Cancel a run this process is currently executing, addressed by its
    /// globally-unique attempt key. Returns false when no such run is
    /// active here.
    pub fn cancel_attempt(&self, attempt_key: &str) -> bool {
        match self.active.get(attempt_key) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drive one attempt to a terminal (or Waiting) status. Acquires and
    /// releases the attempt's writer lock.
    #[instrument(skip_all, fields(dag = %dag.name))]
    pub async fn run_attempt(
        self: &Arc<Self>,
        dag: &Dag,
        attempt: Arc<dyn RunAttempt>,
        cancel: CancellationToken,
    ) -> Result<RunStatus> {
        attempt.open().await.ctx("runner: opening attempt")?;
        let result = self.run_locked(dag, &attempt, cancel).await;
        let _ = attempt.close().await;
        result
    }

    async fn run_locked(
        self: &Arc<Self>,
        dag: &Dag,
        attempt: &Arc<dyn RunAttempt>,
        cancel: CancellationToken,
    ) -> Result<RunStatus> {
        let mut status = attempt.read_status().await?;

        // Index the run while it executes, so in-process cancellation can
        // reach it by attempt key without touching the store
        let attempt_key = status.attempt_key.clone();
        self.active.insert(attempt_key.clone(), cancel.clone());
        let result = self.drive(dag, attempt, &mut status, cancel).await;
        self.active.remove(&attempt_key);
        result
    }

    async fn drive(
        self: &Arc<Self>,
        dag: &Dag,
        attempt: &Arc<dyn RunAttempt>,
        status: &mut DagRunStatus,
        cancel: CancellationToken,
    ) -> Result<RunStatus> {
        let mut ctx = self.build_context(dag, status, cancel);
        let writer = StatusWriter::new(Arc::clone(attempt), self.coalesce);

        status.mark_running(TimeInUtc::now());
        status.pid = Some(std::process::id());
        writer.write(&status, true).await?;

        // OnInit runs before any step; its failure fails the run outright
        let mut init_failed = false;
        if let Some(node) = status.on_init.take() {
            let node = if node.status.is_final() {
                node
            } else {
                self.execute_node(node, dag, &ctx, Vec::new()).await
            };
            init_failed = matches!(node.status, NodeStatus::Failed | NodeStatus::Aborted);
            status.on_init = Some(node);
            writer.write(&status, true).await?;
        }

        let outcome = if init_failed {
            status.error = Some("init handler failed".to_string());
            RunStatus::Failed
        } else if !self.run_preconditions_met(&status, &ctx).await {
            // An unmet run-level gate turns the run into a no-op
            let now = TimeInUtc::now();
            for node in &mut status.nodes {
                node.error = Some("run precondition not met".to_string());
                node.finish(NodeStatus::Skipped, now);
            }
            RunStatus::Succeeded
        } else {
            self.run_nodes(dag, &mut *status, &mut ctx, attempt, &writer)
                .await?
        };

        if outcome == RunStatus::Waiting {
            status.status = RunStatus::Waiting;
            self.run_handler_slot(&mut status.on_wait, dag, &ctx).await;
            writer.write(&status, true).await?;
            info!(dag = %dag.name, run = %status.dag_run_id, "run is waiting for approval");
            return Ok(RunStatus::Waiting);
        }

        let mut final_status = outcome;
        let condition_slot = match outcome {
            RunStatus::Succeeded | RunStatus::PartiallySucceeded => {
                self.run_handler_slot(&mut status.on_success, dag, &ctx).await
            }
            RunStatus::Failed | RunStatus::Rejected => {
                self.run_handler_slot(&mut status.on_failure, dag, &ctx).await
            }
            RunStatus::Aborted => {
                self.run_handler_slot(&mut status.on_cancel, dag, &ctx).await
            }
            _ => true,
        };
        let exit_ok = self.run_handler_slot(&mut status.on_exit, dag, &ctx).await;

        // A handler failure downgrades success but never promotes a failure
        if !(condition_slot && exit_ok) && final_status == RunStatus::Succeeded {
            final_status = RunStatus::PartiallySucceeded;
        }

        if final_status == RunStatus::Failed && status.error.is_none() {
            status.error = status
                .nodes
                .iter()
                .find_map(|n| n.error.clone());
        }

        attempt.write_outputs(&status.outputs()).await?;
        status.mark_finished(final_status, TimeInUtc::now());
        writer.write(&status, true).await?;

        info!(
            dag = %dag.name,
            run = %status.dag_run_id,
            status = %final_status,
            "attempt finished"
        );
        Ok(final_status)
    }

    async fn run_preconditions_met(&self, status: &DagRunStatus, ctx: &RunContext) -> bool {
        for condition in &status.preconditions {
            match eval_condition(condition, ctx).await {
                Ok(true) => {}
                Ok(false) => {
                    info!(condition = %condition.condition, "run precondition not met");
                    return false;
                }
                Err(e) => {
                    warn!(condition = %condition.condition, error = %e, "run precondition errored");
                    return false;
                }
            }
        }
        true
    }

    /// Run one handler node in place; true means it did not fail
    async fn run_handler_slot(
        self: &Arc<Self>,
        slot: &mut Option<Node>,
        dag: &Dag,
        ctx: &RunContext,
    ) -> bool {
        let Some(node) = slot.take() else {
            return true;
        };
        let node = if node.status.is_final() {
            node
        } else {
            self.execute_node(node, dag, ctx, Vec::new()).await
        };
        let ok = !matches!(node.status, NodeStatus::Failed | NodeStatus::Aborted);
        if !ok {
            warn!(handler = %node.step.name, "handler failed");
        }
        *slot = Some(node);
        ok
    }

    fn build_context(
        &self,
        dag: &Dag,
        status: &DagRunStatus,
        cancel: CancellationToken,
    ) -> RunContext {
        let params_map = parse_params(status.params.as_deref().unwrap_or_default());

        let mut secrets = HashMap::new();
        for name in &dag.secrets {
            let value = dag
                .env
                .get(name)
                .cloned()
                .or_else(|| std::env::var(name).ok());
            if let Some(value) = value {
                secrets.insert(name.clone(), value);
            } else {
                warn!(secret = %name, dag = %dag.name, "declared secret has no value");
            }
        }

        let env = EnvScope::from_os()
            .with_params(params_map)
            .with_dag_env(dag.env.clone())
            .with_secrets(secrets);

        let mut ctx = RunContext {
            env,
            run_store: Arc::clone(&self.run_store),
            queue_store: Arc::clone(&self.queue_store),
            dag_db: Arc::clone(&self.dag_db),
            dispatcher: self.dispatcher.clone(),
            cancel,
            root: status.root_ref(),
            dag_name: status.name.clone(),
            dag_run_id: status.dag_run_id.clone(),
        };
        ctx.export_run_vars(&status.log);
        ctx
    }

    async fn run_nodes(
        self: &Arc<Self>,
        dag: &Dag,
        status: &mut DagRunStatus,
        ctx: &mut RunContext,
        attempt: &Arc<dyn RunAttempt>,
        writer: &StatusWriter,
    ) -> Result<RunStatus> {
        loop {
            if attempt.is_aborting().await.unwrap_or(false) || ctx.cancel.is_cancelled() {
                return Ok(RunStatus::Aborted);
            }

            // Re-admit approved waiters; finalize rejected ones
            let mut changed = false;
            for node in &mut status.nodes {
                if node.status == NodeStatus::Waiting {
                    if node.rejected() {
                        node.finish(NodeStatus::Rejected, TimeInUtc::now());
                        changed = true;
                    } else if node.approved() {
                        node.status = NodeStatus::NotStarted;
                        changed = true;
                    }
                }
            }

            // Cascade skips for nodes whose dependencies settled unsatisfied
            for i in 0..status.nodes.len() {
                if status.nodes[i].status != NodeStatus::NotStarted {
                    continue;
                }
                let deps = status.nodes[i].step.depends.clone();
                let all_final = deps
                    .iter()
                    .all(|d| status.node(d).map_or(true, |n| n.status.is_final()));
                if !all_final {
                    continue;
                }
                let satisfied = deps
                    .iter()
                    .all(|d| status.node(d).map_or(true, dependency_satisfied));
                if !satisfied {
                    let now = TimeInUtc::now();
                    let node = &mut status.nodes[i];
                    node.error = Some("upstream dependency not satisfied".to_string());
                    node.finish(NodeStatus::Skipped, now);
                    changed = true;
                }
            }

            // Ready set: not started, all dependencies final and satisfied
            let mut ready: Vec<usize> = (0..status.nodes.len())
                .filter(|&i| {
                    let node = &status.nodes[i];
                    node.status == NodeStatus::NotStarted
                        && node.step.depends.iter().all(|d| {
                            status
                                .node(d)
                                .map_or(true, |n| n.status.is_final() && dependency_satisfied(n))
                        })
                })
                .collect();

            if ready.is_empty() {
                if changed {
                    writer.write(status, false).await?;
                    continue;
                }
                break;
            }

            // Human-in-the-loop gate: unapproved nodes park the run
            let mut waiting = false;
            for &i in &ready {
                let node = &mut status.nodes[i];
                if node.step.approval.is_some() && !node.approved() {
                    if node.rejected() {
                        node.finish(NodeStatus::Rejected, TimeInUtc::now());
                    } else {
                        node.status = NodeStatus::Waiting;
                        waiting = true;
                    }
                }
            }
            if waiting {
                writer.write(status, true).await?;
                return Ok(RunStatus::Waiting);
            }
            ready.retain(|&i| status.nodes[i].status == NodeStatus::NotStarted);
            if ready.is_empty() {
                writer.write(status, true).await?;
                continue;
            }

            // Chat steps inherit the conversations of finished chat steps
            let inherited_chat: Vec<LlmMessage> = status
                .nodes
                .iter()
                .filter(|n| n.status.is_final())
                .flat_map(|n| n.chat_messages.iter().cloned())
                .collect();

            // Abort monitor: flips the batch token when the cross-process
            // flag appears mid-batch
            let batch_cancel = ctx.cancel.child_token();
            let monitor = {
                let attempt = Arc::clone(attempt);
                let token = batch_cancel.clone();
                tokio::spawn(async move {
                    loop {
                        if attempt.is_aborting().await.unwrap_or(false) {
                            token.cancel();
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(250)).await;
                    }
                })
            };

            let mut batch_ctx = ctx.clone();
            batch_ctx.cancel = batch_cancel;

            let futures = ready.iter().map(|&i| {
                let runner = Arc::clone(self);
                let node = status.nodes[i].clone();
                let ctx = batch_ctx.clone();
                let dag = dag.clone();
                let inherited = inherited_chat.clone();
                async move { (i, runner.execute_node(node, &dag, &ctx, inherited).await) }
            });
            let results = join_all(futures).await;
            monitor.abort();

            let mut any_final = false;
            for (i, node) in results {
                if node.step.kind() == ExecutorKind::Chat && !node.chat_messages.is_empty() {
                    if let Err(e) = attempt
                        .write_step_messages(&node.step.name, &node.chat_messages)
                        .await
                    {
                        warn!(step = %node.step.name, error = %e, "failed to persist chat messages");
                    }
                }
                any_final |= node.status.is_final();
                // Outputs become environment for downstream steps
                for (k, v) in node.output_variables.iter() {
                    ctx.env.set(k, v);
                }
                status.nodes[i] = node;
            }
            // Terminal node transitions always write synchronously
            writer.write(status, any_final).await?;
        }

        let outcome = if status.nodes.iter().any(|n| n.status == NodeStatus::Waiting) {
            // Re-entered without approval: stay parked
            RunStatus::Waiting
        } else if status.nodes.iter().any(|n| n.status == NodeStatus::Rejected) {
            RunStatus::Rejected
        } else if status.nodes.iter().any(|n| n.status == NodeStatus::Aborted) {
            RunStatus::Aborted
        } else if status.nodes.iter().any(|n| n.status == NodeStatus::Failed) {
            RunStatus::Failed
        } else if status
            .nodes
            .iter()
            .any(|n| n.status == NodeStatus::PartiallySucceeded)
        {
            RunStatus::PartiallySucceeded
        } else {
            RunStatus::Succeeded
        };
        Ok(outcome)
    }

    /// Run one node to its terminal status, applying preconditions, the
    /// retry policy with jittered exponential backoff, and the repeat
    /// policy.
    async fn execute_node(
        self: &Arc<Self>,
        mut node: Node,
        dag: &Dag,
        ctx: &RunContext,
        inherited_chat: Vec<LlmMessage>,
    ) -> Node {
        for condition in &node.step.preconditions {
            match eval_condition(condition, ctx).await {
                Ok(true) => {}
                Ok(false) => {
                    node.error = Some(format!(
                        "precondition not met: {}",
                        condition.condition
                    ));
                    node.finish(NodeStatus::Skipped, TimeInUtc::now());
                    return node;
                }
                Err(e) => {
                    node.error = Some(format!("precondition error: {e}"));
                    node.finish(NodeStatus::Skipped, TimeInUtc::now());
                    return node;
                }
            }
        }

        node.start(TimeInUtc::now());
        loop {
            let result = self
                .execute_step_once(&mut node, dag, ctx, &inherited_chat)
                .await;

            if ctx.cancel.is_cancelled() {
                if node.error.is_none() {
                    node.error = Some("aborted".to_string());
                }
                node.finish(NodeStatus::Aborted, TimeInUtc::now());
                return node;
            }

            match result {
                Ok(()) => {
                    node.error = None;
                    node.done_count += 1;
                    if self.should_repeat(&node) {
                        node.repeated = true;
                        node.status = NodeStatus::Running;
                        self.sleep_repeat(&node, ctx).await;
                        continue;
                    }
                    node.finish(NodeStatus::Succeeded, TimeInUtc::now());
                    return node;
                }
                Err(e) => {
                    node.error = Some(e.to_string());
                    if let Some(policy) = node.step.retry_policy.clone() {
                        if node.retry_count < policy.limit {
                            node.retry_count += 1;
                            self.metrics.record_node_retry(&dag.name, &node.step.name);
                            node.status = NodeStatus::Running;
                            let delay = retry_delay(&policy, node.retry_count);
                            warn!(
                                step = %node.step.name,
                                attempt = node.retry_count,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "retrying step"
                            );
                            tokio::select! {
                                () = tokio::time::sleep(delay) => {}
                                () = ctx.cancel.cancelled() => {}
                            }
                            continue;
                        }
                    }
                    node.done_count += 1;
                    if self.should_repeat(&node) {
                        node.repeated = true;
                        node.status = NodeStatus::Running;
                        self.sleep_repeat(&node, ctx).await;
                        continue;
                    }
                    node.finish(NodeStatus::Failed, TimeInUtc::now());
                    return node;
                }
            }
        }
    }

    fn should_repeat(&self, node: &Node) -> bool {
        node.step
            .repeat_policy
            .as_ref()
            .map_or(false, |p| p.repeat && node.done_count < p.limit)
    }

    async fn sleep_repeat(&self, node: &Node, ctx: &RunContext) {
        let interval = node
            .step
            .repeat_policy
            .as_ref()
            .map_or(0, |p| p.interval_secs);
        if interval > 0 {
            tokio::select! {
                () = tokio::time::sleep(Duration::from_secs(interval)) => {}
                () = ctx.cancel.cancelled() => {}
            }
        }
    }

    async fn execute_step_once(
        self: &Arc<Self>,
        node: &mut Node,
        dag: &Dag,
        ctx: &RunContext,
        inherited_chat: &[LlmMessage],
    ) -> Result<()> {
        let timeout = node.step.timeout_secs.map(Duration::from_secs);
        let execution = async {
            match node.step.kind() {
                ExecutorKind::Command => {
                    let mut executor = CommandExecutor::new(self.log_dir.clone());
                    executor.execute(ctx, node).await
                }
                ExecutorKind::SubDag => {
                    let mut executor = SubDagExecutor::new(Arc::clone(self), dag.clone());
                    executor.execute(ctx, node).await
                }
                ExecutorKind::Chat => {
                    let config = node.step.llm.clone().ok_or_else(|| {
                        Error::Validation(format!("step {:?} has no chat config", node.step.name))
                    })?;
                    let tool_runner =
                        Arc::new(LocalToolDagRunner::new(Arc::clone(self)));
                    let mut executor = ChatExecutor::new(
                        node.step.name.clone(),
                        config,
                        dag.clone(),
                        tool_runner,
                        self.client_factory.clone(),
                    );
                    executor.set_context(inherited_chat.to_vec());
                    executor.execute(ctx, node).await
                }
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, execution)
                .await
                .map_err(|_| {
                    Error::Timeout(format!(
                        "step {:?} exceeded {}s",
                        node.step.name,
                        limit.as_secs()
                    ))
                })?,
            None => execution.await,
        }
    }
}

/// Whether a settled dependency lets its dependents run
fn dependency_satisfied(node: &Node) -> bool {
    match node.status {
        NodeStatus::Succeeded | NodeStatus::PartiallySucceeded => true,
        NodeStatus::Failed => node.step.continue_on.failure,
        NodeStatus::Skipped => node.step.continue_on.skipped,
        _ => false,
    }
}

/// Jittered exponential backoff for step retries
fn retry_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy.interval_secs.max(1) as f64;
    let factor = policy.backoff.max(1.0).powi(attempt.saturating_sub(1) as i32);
    let mut delay = base * factor;
    if let Some(max) = policy.max_interval_secs {
        delay = delay.min(max as f64);
    }
    let jittered = rand::thread_rng().gen_range(0.0..=delay);
    Duration::from_secs_f64(jittered)
}

/// Parse a params string into named variables; bare tokens get positional
/// names starting at "1"
fn parse_params(params: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let mut position = 0usize;
    for token in dagflow_common::params::split_params(params) {
        let spec = dagflow_common::params::parse_token(&token);
        match spec.default {
            Some(value) => {
                map.insert(spec.name, value);
            }
            None => {
                position += 1;
                map.insert(position.to_string(), spec.name);
            }
        }
    }
    map
}

/// A precondition with an expected value compares expansions; without one
/// it runs as a shell command and passes on exit 0
async fn eval_condition(condition: &Condition, ctx: &RunContext) -> Result<bool> {
    let expanded = ctx.env.expand(&condition.condition);
    if !condition.expected.is_empty() {
        return Ok(expanded == ctx.env.expand(&condition.expected));
    }
    let status = tokio::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(&expanded)
        .envs(ctx.env.vars())
        .status()
        .await?;
    Ok(status.success())
}

//! Sub-DAG executor: deterministic child spawn plus synchronous wait

use crate::runner::AttemptRunner;
use async_trait::async_trait;
use dagflow_agents::ToolDagRunner;
use dagflow_common::error::{Error, Result, ResultExt};
use dagflow_common::keys::sub_run_id;
use dagflow_common::timeutil::TimeInUtc;
use dagflow_common::types::{DagRunRef, RunStatus, TriggerType};
use dagflow_core::context::RunContext;
use dagflow_core::dag::Dag;
use dagflow_core::executor::StepExecutor;
use dagflow_core::status::{CreateAttemptOptions, Node, OutputVariables, SubDagRun};
use dagflow_core::store::RunAttempt;
use parking_lot::Mutex;
use rand::RngCore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Create the child attempt under the run's root, or reuse the one an
/// earlier (crashed) execution already materialized.
pub(crate) async fn create_or_reuse_child(
    ctx: &RunContext,
    dag: &Dag,
    child_run_id: &str,
    params: &str,
) -> Result<Arc<dyn RunAttempt>> {
    let opts = CreateAttemptOptions {
        root: Some(ctx.root.clone()),
        parent: Some(DagRunRef::new(ctx.dag_name.clone(), ctx.dag_run_id.clone())),
        trigger: TriggerType::SubDag,
        params: if params.is_empty() {
            None
        } else {
            Some(params.to_string())
        },
        ..CreateAttemptOptions::default()
    };
    match ctx
        .run_store
        .create_attempt(dag, TimeInUtc::now(), child_run_id, opts)
        .await
    {
        Ok(attempt) => Ok(attempt),
        Err(e) if matches!(e.root(), Error::DagRunAlreadyExists(_)) => ctx
            .run_store
            .find_sub_attempt(&ctx.root, child_run_id)
            .await
            .ctx("reusing existing sub-attempt"),
        Err(e) => Err(e),
    }
}

pub struct SubDagExecutor {
    runner: Arc<AttemptRunner>,
    parent_dag: Dag,
    child_cancel: Mutex<Option<CancellationToken>>,
}

impl SubDagExecutor {
    pub fn new(runner: Arc<AttemptRunner>, parent_dag: Dag) -> Self {
        Self {
            runner,
            parent_dag,
            child_cancel: Mutex::new(None),
        }
    }

    async fn resolve_child(&self, ctx: &RunContext, name: &str) -> Result<Dag> {
        if let Some(local) = self.parent_dag.local_dags.get(name) {
            return Ok(local.clone());
        }
        ctx.dag_db
            .get_dag(name)
            .await
            .ctx(format!("resolving sub-DAG {name}"))
    }

    /// Wait on a remotely-dispatched child by polling its status
    async fn await_remote(
        &self,
        ctx: &RunContext,
        dag: &Dag,
        child_run_id: &str,
    ) -> Result<RunStatus> {
        let dispatcher = ctx
            .dispatcher
            .as_ref()
            .ok_or_else(|| Error::Internal("distributed sub-DAG without dispatcher".to_string()))?;

        dispatcher
            .dispatch(dagflow_core::dispatch::Task {
                operation: dagflow_core::dispatch::TaskOperation::Start,
                dag_name: dag.name.clone(),
                dag_run_id: child_run_id.to_string(),
                root: ctx.root.clone(),
                parent: DagRunRef::new(ctx.dag_name.clone(), ctx.dag_run_id.clone()),
                params: None,
                worker_selector: dag.worker_selector.clone(),
            })
            .await?;

        loop {
            if ctx.cancel.is_cancelled() {
                let _ = dispatcher
                    .request_cancel(&dag.name, child_run_id, Some(&ctx.root))
                    .await;
                return Ok(RunStatus::Aborted);
            }
            match dispatcher
                .get_dag_run_status(&dag.name, child_run_id, Some(&ctx.root))
                .await?
            {
                Some(status) if status.status.is_final() => return Ok(status.status),
                _ => tokio::time::sleep(Duration::from_secs(2)).await,
            }
        }
    }
}

#[async_trait]
impl StepExecutor for SubDagExecutor {
    async fn execute(&mut self, ctx: &RunContext, node: &mut Node) -> Result<()> {
        let sub = node
            .step
            .sub_dag
            .clone()
            .ok_or_else(|| Error::Validation(format!("step {:?} has no sub-DAG", node.step.name)))?;
        let child_dag = self.resolve_child(ctx, &sub.name).await?;
        let params = ctx.env.expand(&sub.params);

        // Repeated spawns get a fresh nonce so each iteration is a new run
        let nonce: Vec<u8> = if node.repeated {
            let mut bytes = [0u8; 8];
            rand::thread_rng().fill_bytes(&mut bytes);
            bytes.to_vec()
        } else {
            Vec::new()
        };
        let child_run_id = sub_run_id(&ctx.dag_run_id, &node.step.name, &params, &nonce);

        let entry = SubDagRun {
            dag_run_id: child_run_id.clone(),
            params: params.clone(),
            dag_name: child_dag.name.clone(),
        };
        if node.repeated {
            node.sub_runs_repeated.push(entry);
        } else {
            node.sub_runs.push(entry);
        }

        let attempt = create_or_reuse_child(ctx, &child_dag, &child_run_id, &params).await?;
        info!(
            parent = %ctx.dag_run_id,
            child = %child_run_id,
            dag = %child_dag.name,
            "sub-DAG spawned"
        );

        let final_status = if child_dag.is_distributed() && ctx.dispatcher.is_some() {
            self.await_remote(ctx, &child_dag, &child_run_id).await?
        } else {
            let token = ctx.cancel.child_token();
            *self.child_cancel.lock() = Some(token.clone());
            self.runner
                .run_attempt(&child_dag, Arc::clone(&attempt), token)
                .await?
        };

        match final_status {
            RunStatus::Succeeded | RunStatus::PartiallySucceeded => {
                let outputs = attempt.read_outputs().await.unwrap_or_default();
                node.output_variables.merge(&outputs);
                if let Some(output_var) = &node.step.output {
                    let rendered = serde_json::to_string(&outputs)?;
                    node.output_variables.insert(output_var.clone(), rendered);
                }
                Ok(())
            }
            RunStatus::Aborted => Err(Error::Timeout(format!(
                "sub-DAG {} aborted",
                child_dag.name
            ))),
            other => Err(Error::Internal(format!(
                "sub-DAG {} finished with status {other}",
                child_dag.name
            ))),
        }
    }

    fn kill(&mut self, signal: i32) {
        warn!(signal, "cancelling sub-DAG execution");
        if let Some(token) = self.child_cancel.lock().as_ref() {
            token.cancel();
        }
    }
}

/// Tool-DAG runner used by chat steps: every tool call becomes a child
/// attempt executed locally under the same root.
pub struct LocalToolDagRunner {
    runner: Arc<AttemptRunner>,
    children: Mutex<Vec<CancellationToken>>,
}

impl LocalToolDagRunner {
    pub fn new(runner: Arc<AttemptRunner>) -> Self {
        Self {
            runner,
            children: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ToolDagRunner for LocalToolDagRunner {
    async fn run_tool_dag(
        &self,
        ctx: &RunContext,
        dag: &Dag,
        dag_run_id: &str,
        params: &str,
    ) -> Result<OutputVariables> {
        let attempt = create_or_reuse_child(ctx, dag, dag_run_id, params).await?;

        let token = ctx.cancel.child_token();
        self.children.lock().push(token.clone());

        let final_status = self
            .runner
            .run_attempt(dag, Arc::clone(&attempt), token)
            .await?;

        match final_status {
            RunStatus::Succeeded | RunStatus::PartiallySucceeded => {
                Ok(attempt.read_outputs().await.unwrap_or_default())
            }
            other => Err(Error::Internal(format!(
                "tool DAG {} finished with status {other}",
                dag.name
            ))),
        }
    }

    fn kill(&self, signal: i32) {
        warn!(signal, "cancelling in-flight tool DAGs");
        for token in self.children.lock().iter() {
            token.cancel();
        }
    }
}

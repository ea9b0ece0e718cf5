//! HTTP dispatcher: shuttles tasks and status between this process and
//! remote workers registered as coordinators.

use async_trait::async_trait;
use dagflow_common::config::DispatcherConfig;
use dagflow_common::error::{Error, Result, ResultExt};
use dagflow_common::retry::{retry_with_backoff, BackoffPolicy};
use dagflow_common::types::{DagRunRef, ServiceRole};
use dagflow_core::dispatch::{Dispatcher, Task};
use dagflow_core::registry::ServiceRegistry;
use dagflow_core::status::DagRunStatus;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

pub struct HttpDispatcher {
    registry: Arc<dyn ServiceRegistry>,
    client: reqwest::Client,
    round_robin: AtomicUsize,
}

impl HttpDispatcher {
    pub fn new(registry: Arc<dyn ServiceRegistry>, config: &DispatcherConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self {
            registry,
            client,
            round_robin: AtomicUsize::new(0),
        })
    }

    /// Pick a coordinator member round-robin
    async fn coordinator_base_url(&self) -> Result<String> {
        let members = self
            .registry
            .get_service_members(ServiceRole::Coordinator)
            .await
            .ctx("selecting coordinator")?;
        if members.is_empty() {
            return Err(Error::Internal("no active coordinator registered".to_string()));
        }
        let index = self.round_robin.fetch_add(1, Ordering::Relaxed) % members.len();
        let member = &members[index];
        Ok(format!("http://{}:{}", member.host, member.port))
    }

    fn map_status(status: reqwest::StatusCode, body: &str) -> Error {
        match status.as_u16() {
            401 | 403 => Error::Auth(format!("coordinator rejected request: {body}")),
            404 => Error::DagRunNotFound(body.to_string()),
            409 => Error::DagRunAlreadyExists(body.to_string()),
            429 => Error::RateLimit(body.to_string()),
            s if status.is_server_error() => {
                Error::Timeout(format!("coordinator returned {s}: {body}"))
            }
            s => Error::NonRetriable(Box::new(Error::Internal(format!(
                "coordinator returned {s}: {body}"
            )))),
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Self::map_status(status, &body))
    }

    fn root_query(root: Option<&DagRunRef>) -> Vec<(&'static str, String)> {
        root.map(|r| vec![("root", r.to_string())]).unwrap_or_default()
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    #[instrument(skip(self, task), fields(dag = %task.dag_name, run = %task.dag_run_id))]
    async fn dispatch(&self, task: Task) -> Result<()> {
        retry_with_backoff(BackoffPolicy::default(), "dispatch task", || {
            let task = task.clone();
            async move {
                let base = self.coordinator_base_url().await?;
                let response = self
                    .client
                    .post(format!("{base}/api/v1/tasks"))
                    .json(&task)
                    .send()
                    .await?;
                Self::check(response).await?;
                debug!("task accepted");
                Ok(())
            }
        })
        .await
    }

    async fn get_dag_run_status(
        &self,
        dag_name: &str,
        dag_run_id: &str,
        root: Option<&DagRunRef>,
    ) -> Result<Option<DagRunStatus>> {
        let result = retry_with_backoff(BackoffPolicy::default(), "poll dag-run status", || {
            let query = Self::root_query(root);
            async move {
                let base = self.coordinator_base_url().await?;
                let response = self
                    .client
                    .get(format!("{base}/api/v1/dag-runs/{dag_name}/{dag_run_id}/status"))
                    .query(&query)
                    .send()
                    .await?;
                let response = Self::check(response).await?;
                let status: DagRunStatus = response.json().await?;
                Ok(status)
            }
        })
        .await;

        match result {
            Ok(status) => Ok(Some(status)),
            // Not-found is a distinct non-error outcome for pollers
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn request_cancel(
        &self,
        dag_name: &str,
        dag_run_id: &str,
        root: Option<&DagRunRef>,
    ) -> Result<()> {
        retry_with_backoff(BackoffPolicy::default(), "request cancel", || {
            let query = Self::root_query(root);
            async move {
                let base = self.coordinator_base_url().await?;
                let response = self
                    .client
                    .post(format!("{base}/api/v1/dag-runs/{dag_name}/{dag_run_id}/cancel"))
                    .query(&query)
                    .send()
                    .await?;
                Self::check(response).await?;
                Ok(())
            }
        })
        .await
    }

    async fn cleanup(&self) -> Result<()> {
        // reqwest clients release their pools on drop
        Ok(())
    }
}

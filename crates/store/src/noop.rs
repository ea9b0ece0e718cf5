//! Shared-nothing attempt for workers without filesystem access.
//!
//! Writes are accepted and forwarded elsewhere by the caller's log writer;
//! reads fail explicitly rather than returning empty success.

use async_trait::async_trait;
use dagflow_common::error::{Error, Result};
use dagflow_common::llm::LlmMessage;
use dagflow_core::dag::Dag;
use dagflow_core::status::{DagRunStatus, OutputVariables};
use dagflow_core::store::RunAttempt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Callback invoked with every status the runner writes
pub type StatusSink = Box<dyn Fn(&DagRunStatus) + Send + Sync>;

pub struct NoopRunAttempt {
    attempt_id: String,
    aborting: AtomicBool,
    sink: Option<StatusSink>,
    dag: Mutex<Option<Dag>>,
}

impl std::fmt::Debug for NoopRunAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoopRunAttempt")
            .field("attempt_id", &self.attempt_id)
            .field("aborting", &self.aborting)
            .field("sink", &self.sink.as_ref().map(|_| "StatusSink"))
            .field("dag", &self.dag)
            .finish()
    }
}

impl NoopRunAttempt {
    pub fn new(attempt_id: impl Into<String>) -> Self {
        Self {
            attempt_id: attempt_id.into(),
            aborting: AtomicBool::new(false),
            sink: None,
            dag: Mutex::new(None),
        }
    }

    /// Attach a sink that pushes each written status to a coordinator
    pub fn with_sink(mut self, sink: StatusSink) -> Self {
        self.sink = Some(sink);
        self
    }
}

#[async_trait]
impl RunAttempt for NoopRunAttempt {
    fn id(&self) -> String {
        self.attempt_id.clone()
    }

    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn write(&self, status: &DagRunStatus) -> Result<()> {
        if let Some(sink) = &self.sink {
            sink(status);
        }
        Ok(())
    }

    async fn read_status(&self) -> Result<DagRunStatus> {
        Err(Error::NoopAttemptNotSupported)
    }

    async fn read_dag(&self) -> Result<Dag> {
        self.dag
            .lock()
            .clone()
            .ok_or(Error::NoopAttemptNotSupported)
    }

    async fn set_dag(&self, dag: &Dag) -> Result<()> {
        *self.dag.lock() = Some(dag.clone());
        Ok(())
    }

    async fn abort(&self) -> Result<()> {
        self.aborting.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn is_aborting(&self) -> Result<bool> {
        Ok(self.aborting.load(Ordering::SeqCst))
    }

    async fn hide(&self) -> Result<()> {
        Err(Error::NoopAttemptNotSupported)
    }

    async fn hidden(&self) -> bool {
        false
    }

    async fn write_outputs(&self, _outputs: &OutputVariables) -> Result<()> {
        Ok(())
    }

    async fn read_outputs(&self) -> Result<OutputVariables> {
        Err(Error::NoopAttemptNotSupported)
    }

    async fn write_step_messages(&self, _step: &str, _messages: &[LlmMessage]) -> Result<()> {
        Ok(())
    }

    async fn read_step_messages(&self, _step: &str) -> Result<Vec<LlmMessage>> {
        Err(Error::NoopAttemptNotSupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_fail_explicitly() {
        let attempt = NoopRunAttempt::new("att1");
        assert!(matches!(
            attempt.read_status().await.unwrap_err(),
            Error::NoopAttemptNotSupported
        ));
        assert!(matches!(
            attempt.read_outputs().await.unwrap_err(),
            Error::NoopAttemptNotSupported
        ));
        assert!(matches!(
            attempt.read_step_messages("s").await.unwrap_err(),
            Error::NoopAttemptNotSupported
        ));
    }

    #[tokio::test]
    async fn abort_flag_works_in_memory() {
        let attempt = NoopRunAttempt::new("att1");
        assert!(!attempt.is_aborting().await.unwrap());
        attempt.abort().await.unwrap();
        assert!(attempt.is_aborting().await.unwrap());
    }

    #[tokio::test]
    async fn writes_flow_to_sink() {
        use dagflow_core::dag::Dag;
        use dagflow_core::status::CreateAttemptOptions;
        use std::sync::atomic::AtomicUsize;
        use std::sync::Arc;

        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let attempt = NoopRunAttempt::new("att1").with_sink(Box::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        let dag = Dag {
            name: "noop".to_string(),
            ..Dag::default()
        };
        let status = DagRunStatus::initial(&dag, "r1", "att1", &CreateAttemptOptions::default());
        attempt.open().await.unwrap();
        attempt.write(&status).await.unwrap();
        attempt.write(&status).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}

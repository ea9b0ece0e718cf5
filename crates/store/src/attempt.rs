//! File-backed attempt: one directory per attempt holding status, the bound
//! DAG, outputs, chat conversations, and cross-process flags

use crate::fsutil::{atomic_write_json, exists, read_json};
use async_trait::async_trait;
use dagflow_common::error::{Error, Result};
use dagflow_common::keys::sanitize_for_filename;
use dagflow_common::llm::LlmMessage;
use dagflow_core::dag::Dag;
use dagflow_core::status::{DagRunStatus, OutputVariables};
use dagflow_core::store::RunAttempt;
use parking_lot::Mutex;
use std::path::PathBuf;

const STATUS_FILE: &str = "status.json";
const DAG_FILE: &str = "dag.json";
const OUTPUTS_FILE: &str = "outputs.json";
const LOCK_FILE: &str = "lock";
const ABORT_FLAG: &str = "aborting";
const HIDDEN_FLAG: &str = "hidden";
const CHAT_DIR: &str = "chat";

/// One attempt persisted under its own directory.
///
/// The writer lock is a `lock` file created with `create_new`, so a second
/// `open` from any process fails with [`Error::AttemptLocked`]. The abort
/// flag is a separate file and stays visible across processes.
#[derive(Debug)]
pub struct FileRunAttempt {
    dir: PathBuf,
    attempt_id: String,
    opened: Mutex<bool>,
}

impl FileRunAttempt {
    pub fn new(dir: PathBuf, attempt_id: String) -> Self {
        Self {
            dir,
            attempt_id,
            opened: Mutex::new(false),
        }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    fn chat_path(&self, step: &str) -> PathBuf {
        self.dir
            .join(CHAT_DIR)
            .join(format!("{}.json", sanitize_for_filename(step)))
    }

    fn require_open(&self) -> Result<()> {
        if *self.opened.lock() {
            Ok(())
        } else {
            Err(Error::Internal(format!(
                "attempt {} is not open for writing",
                self.attempt_id
            )))
        }
    }
}

#[async_trait]
impl RunAttempt for FileRunAttempt {
    fn id(&self) -> String {
        self.attempt_id.clone()
    }

    async fn open(&self) -> Result<()> {
        let lock_path = self.path(LOCK_FILE);
        tokio::fs::create_dir_all(&self.dir).await?;
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .await
        {
            Ok(_) => {
                tokio::fs::write(&lock_path, std::process::id().to_string()).await?;
                *self.opened.lock() = true;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(Error::AttemptLocked(self.attempt_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn close(&self) -> Result<()> {
        let was_open = {
            let mut opened = self.opened.lock();
            let was_open = *opened;
            *opened = false;
            was_open
        };
        if was_open {
            match tokio::fs::remove_file(self.path(LOCK_FILE)).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        } else {
            Ok(())
        }
    }

    async fn write(&self, status: &DagRunStatus) -> Result<()> {
        self.require_open()?;
        atomic_write_json(&self.path(STATUS_FILE), status).await
    }

    async fn read_status(&self) -> Result<DagRunStatus> {
        let path = self.path(STATUS_FILE);
        if !exists(&path).await {
            return Err(Error::NoStatusData(self.dir.display().to_string()));
        }
        read_json(&path).await
    }

    async fn read_dag(&self) -> Result<Dag> {
        let path = self.path(DAG_FILE);
        if !exists(&path).await {
            return Err(Error::NoStatusData(format!(
                "no DAG bound to attempt at {}",
                self.dir.display()
            )));
        }
        read_json(&path).await
    }

    // Bound at create time, before the writer lock exists
    async fn set_dag(&self, dag: &Dag) -> Result<()> {
        atomic_write_json(&self.path(DAG_FILE), dag).await
    }

    async fn abort(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.path(ABORT_FLAG), b"").await?;
        Ok(())
    }

    async fn is_aborting(&self) -> Result<bool> {
        Ok(exists(&self.path(ABORT_FLAG)).await)
    }

    async fn hide(&self) -> Result<()> {
        tokio::fs::write(self.path(HIDDEN_FLAG), b"").await?;
        Ok(())
    }

    async fn hidden(&self) -> bool {
        exists(&self.path(HIDDEN_FLAG)).await
    }

    async fn write_outputs(&self, outputs: &OutputVariables) -> Result<()> {
        atomic_write_json(&self.path(OUTPUTS_FILE), outputs).await
    }

    async fn read_outputs(&self) -> Result<OutputVariables> {
        let path = self.path(OUTPUTS_FILE);
        if !exists(&path).await {
            return Ok(OutputVariables::new());
        }
        read_json(&path).await
    }

    async fn write_step_messages(&self, step: &str, messages: &[LlmMessage]) -> Result<()> {
        atomic_write_json(&self.chat_path(step), &messages.to_vec()).await
    }

    async fn read_step_messages(&self, step: &str) -> Result<Vec<LlmMessage>> {
        let path = self.chat_path(step);
        if !exists(&path).await {
            return Ok(Vec::new());
        }
        read_json(&path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagflow_core::status::CreateAttemptOptions;

    fn sample_dag() -> Dag {
        Dag {
            name: "sample".to_string(),
            steps: vec![dagflow_core::dag::Step {
                name: "one".to_string(),
                run: Some("echo one".to_string()),
                ..Default::default()
            }],
            ..Dag::default()
        }
    }

    fn attempt_in(dir: &tempfile::TempDir) -> FileRunAttempt {
        FileRunAttempt::new(dir.path().join("attempt_1"), "att1".to_string())
    }

    #[tokio::test]
    async fn second_open_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let first = attempt_in(&dir);
        let second = FileRunAttempt::new(dir.path().join("attempt_1"), "att1".to_string());

        first.open().await.unwrap();
        let err = second.open().await.unwrap_err();
        assert!(matches!(err, Error::AttemptLocked(_)));

        first.close().await.unwrap();
        second.open().await.unwrap();
        second.close().await.unwrap();
    }

    #[tokio::test]
    async fn write_requires_open() {
        let dir = tempfile::tempdir().unwrap();
        let attempt = attempt_in(&dir);
        let dag = sample_dag();
        let status = DagRunStatus::initial(&dag, "r1", "att1", &CreateAttemptOptions::default());

        assert!(attempt.write(&status).await.is_err());

        attempt.open().await.unwrap();
        attempt.write(&status).await.unwrap();
        let back = attempt.read_status().await.unwrap();
        assert_eq!(back, status);
        attempt.close().await.unwrap();
    }

    #[tokio::test]
    async fn abort_flag_is_visible_to_other_handles() {
        let dir = tempfile::tempdir().unwrap();
        let attempt = attempt_in(&dir);
        let observer = FileRunAttempt::new(dir.path().join("attempt_1"), "att1".to_string());

        assert!(!observer.is_aborting().await.unwrap());
        attempt.abort().await.unwrap();
        assert!(observer.is_aborting().await.unwrap());
    }

    #[tokio::test]
    async fn dag_round_trip_and_missing_status() {
        let dir = tempfile::tempdir().unwrap();
        let attempt = attempt_in(&dir);
        let dag = sample_dag();

        attempt.set_dag(&dag).await.unwrap();
        assert_eq!(attempt.read_dag().await.unwrap(), dag);

        let err = attempt.read_status().await.unwrap_err();
        assert!(matches!(err, Error::NoStatusData(_)));
    }

    #[tokio::test]
    async fn step_messages_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let attempt = attempt_in(&dir);

        assert!(attempt.read_step_messages("chat").await.unwrap().is_empty());

        let messages = vec![LlmMessage::user("hi"), LlmMessage::assistant("hello")];
        attempt
            .write_step_messages("chat step", &messages)
            .await
            .unwrap();
        assert_eq!(
            attempt.read_step_messages("chat step").await.unwrap(),
            messages
        );
    }

    #[tokio::test]
    async fn hidden_flag() {
        let dir = tempfile::tempdir().unwrap();
        let attempt = attempt_in(&dir);
        tokio::fs::create_dir_all(attempt.dir()).await.unwrap();
        assert!(!attempt.hidden().await);
        attempt.hide().await.unwrap();
        assert!(attempt.hidden().await);
    }
}

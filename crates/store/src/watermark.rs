//! Scheduler state persistence

use crate::fsutil::{atomic_write_json, exists, read_json};
use async_trait::async_trait;
use dagflow_common::error::{Error, Result};
use dagflow_common::types::SchedulerState;
use dagflow_core::store::WatermarkStore;
use std::path::PathBuf;
use tracing::warn;

const STATE_FILE: &str = "scheduler_state.json";

/// Scheduler state as a single JSON file with atomic replacement.
///
/// A corrupted file degrades to the empty state instead of failing, so a bad
/// shutdown never wedges the scheduler; the loss is re-running catchup.
pub struct FileWatermarkStore {
    path: PathBuf,
}

impl FileWatermarkStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: data_dir.into().join(STATE_FILE),
        }
    }
}

#[async_trait]
impl WatermarkStore for FileWatermarkStore {
    async fn load(&self) -> Result<SchedulerState> {
        if !exists(&self.path).await {
            return Ok(SchedulerState::default());
        }
        match read_json(&self.path).await {
            Ok(state) => Ok(state),
            Err(Error::CorruptedStatusFile { path, reason }) => {
                warn!(path, reason, "corrupted scheduler state; starting empty");
                Ok(SchedulerState::default())
            }
            Err(e) => Err(e),
        }
    }

    async fn save(&self, state: &SchedulerState) -> Result<()> {
        atomic_write_json(&self.path, state).await
    }
}

//! Common types used across the orchestrator

use crate::error::{Error, Result};
use crate::timeutil::TimeInUtc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Reference to one dag-run: `(name, id)`, rendered as `name:id`
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DagRunRef {
    pub name: String,
    pub id: String,
}

impl DagRunRef {
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
        }
    }

    /// True when both segments are empty; zero refs are omitted on serialization
    pub fn is_zero(&self) -> bool {
        self.name.is_empty() && self.id.is_empty()
    }
}

impl fmt::Display for DagRunRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.id)
    }
}

impl FromStr for DagRunRef {
    type Err = Error;

    /// Splits on the first colon only; empty or single-segment input is invalid
    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((name, id)) if !name.is_empty() && !id.is_empty() => {
                Ok(Self::new(name, id))
            }
            _ => Err(Error::InvalidRunRef(s.to_string())),
        }
    }
}

/// Top-level status of one dag-run attempt
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    NotStarted,
    Queued,
    Running,
    Succeeded,
    Failed,
    Aborted,
    PartiallySucceeded,
    Waiting,
    Rejected,
}

impl RunStatus {
    /// Statuses that may still make progress; retention cleanup skips these
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Queued | Self::Waiting)
    }

    /// Terminal statuses
    pub fn is_final(self) -> bool {
        matches!(
            self,
            Self::Succeeded
                | Self::Failed
                | Self::Aborted
                | Self::PartiallySucceeded
                | Self::Rejected
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
            Self::PartiallySucceeded => "partially_succeeded",
            Self::Waiting => "waiting",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution status of one node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    NotStarted,
    Running,
    Succeeded,
    Failed,
    Aborted,
    Skipped,
    PartiallySucceeded,
    Waiting,
    Rejected,
}

impl NodeStatus {
    pub fn is_final(self) -> bool {
        matches!(
            self,
            Self::Succeeded
                | Self::Failed
                | Self::Aborted
                | Self::Skipped
                | Self::PartiallySucceeded
                | Self::Rejected
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
            Self::Skipped => "skipped",
            Self::PartiallySucceeded => "partially_succeeded",
            Self::Waiting => "waiting",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused a dag-run to exist
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    #[default]
    Manual,
    Schedule,
    Retry,
    Catchup,
    SubDag,
}

impl TriggerType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Schedule => "schedule",
            Self::Retry => "retry",
            Self::Catchup => "catchup",
            Self::SubDag => "sub_dag",
        }
    }
}

/// Admission priority within one queue name; High dequeues before Low
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum QueuePriority {
    High = 0,
    #[default]
    Low = 1,
}

/// Health of a registered service host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    #[default]
    Unknown,
    Active,
    Inactive,
}

/// Roles a host can register under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceRole {
    Scheduler,
    Coordinator,
    Worker,
}

impl ServiceRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduler => "scheduler",
            Self::Coordinator => "coordinator",
            Self::Worker => "worker",
        }
    }
}

/// Host registration record; empty `namespace` serves all namespaces
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub status: HostStatus,
    pub started_at: Option<TimeInUtc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

impl HostInfo {
    pub fn serves_namespace(&self, namespace: &str) -> bool {
        self.namespace.is_empty() || self.namespace == namespace
    }
}

/// Per-DAG watermark record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DagWatermark {
    #[serde(rename = "lastScheduledTime")]
    pub last_scheduled_time: Option<TimeInUtc>,
}

/// Scheduler state persisted between ticks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub version: u32,
    #[serde(rename = "lastTick")]
    pub last_tick: Option<TimeInUtc>,
    pub dags: HashMap<String, DagWatermark>,
}

/// Current on-disk schema version for [`SchedulerState`]
pub const SCHEDULER_STATE_VERSION: u32 = 1;

impl Default for SchedulerState {
    fn default() -> Self {
        Self {
            version: SCHEDULER_STATE_VERSION,
            last_tick: None,
            dags: HashMap::new(),
        }
    }
}

impl SchedulerState {
    pub fn watermark(&self, dag_name: &str) -> Option<TimeInUtc> {
        self.dags
            .get(dag_name)
            .and_then(|w| w.last_scheduled_time)
    }

    pub fn advance(&mut self, dag_name: &str, scheduled: TimeInUtc) {
        let entry = self.dags.entry(dag_name.to_string()).or_default();
        match entry.last_scheduled_time {
            Some(current) if current >= scheduled => {}
            _ => entry.last_scheduled_time = Some(scheduled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn run_ref_round_trip() {
        let r = DagRunRef::new("etl-daily", "20260801-1");
        let parsed: DagRunRef = r.to_string().parse().unwrap();
        assert_eq!(parsed, r);
    }

    #[test]
    fn run_ref_splits_on_first_colon_only() {
        let parsed: DagRunRef = "etl:run:with:colons".parse().unwrap();
        assert_eq!(parsed.name, "etl");
        assert_eq!(parsed.id, "run:with:colons");
    }

    #[test]
    fn run_ref_rejects_invalid_shapes() {
        for s in ["", "no-colon", ":id-only", "name-only:"] {
            let err = s.parse::<DagRunRef>().unwrap_err();
            assert!(matches!(err, Error::InvalidRunRef(_)), "input {s:?}");
        }
    }

    proptest! {
        #[test]
        fn run_ref_display_parse_inverse(
            name in "[a-zA-Z0-9_-]{1,20}",
            id in "[a-zA-Z0-9:_-]{1,20}",
        ) {
            let r = DagRunRef::new(name, id);
            let parsed: DagRunRef = r.to_string().parse().unwrap();
            prop_assert_eq!(parsed, r);
        }
    }

    #[test]
    fn priority_ordering_high_first() {
        assert!(QueuePriority::High < QueuePriority::Low);
    }

    #[test]
    fn active_and_final_are_disjoint() {
        for status in [
            RunStatus::NotStarted,
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::Succeeded,
            RunStatus::Failed,
            RunStatus::Aborted,
            RunStatus::PartiallySucceeded,
            RunStatus::Waiting,
            RunStatus::Rejected,
        ] {
            assert!(!(status.is_active() && status.is_final()), "{status}");
        }
        assert!(RunStatus::Queued.is_active());
        assert!(RunStatus::Waiting.is_active());
        assert!(!RunStatus::NotStarted.is_final());
    }

    #[test]
    fn watermark_never_moves_backwards() {
        let mut state = SchedulerState::default();
        let later = TimeInUtc::from_rfc3339("2026-08-01T10:10:00Z").unwrap();
        let earlier = TimeInUtc::from_rfc3339("2026-08-01T10:00:00Z").unwrap();

        state.advance("etl", later);
        state.advance("etl", earlier);
        assert_eq!(state.watermark("etl"), Some(later));
    }
}

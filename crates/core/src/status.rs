//! Persisted attempt status: the node list and the run-level record

use crate::dag::{Condition, Dag, Step};
use dagflow_common::keys::generate_attempt_key;
use dagflow_common::llm::{LlmMessage, ToolDefinition};
use dagflow_common::timeutil::{self, TimeInUtc, UNSET_TIME};
use dagflow_common::types::{DagRunRef, NodeStatus, RunStatus, TriggerType};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Output variables ordered by insertion for reproducible serialization
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputVariables {
    entries: Vec<(String, String)>,
}

impl OutputVariables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite; an existing key keeps its original position
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn merge(&mut self, other: &OutputVariables) {
        for (k, v) in other.iter() {
            self.insert(k, v);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for OutputVariables {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for OutputVariables {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = OutputVariables;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of output variables")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut out = OutputVariables::new();
                while let Some((k, v)) = access.next_entry::<String, String>()? {
                    out.insert(k, v);
                }
                Ok(out)
            }
        }

        deserializer.deserialize_map(OrderedVisitor)
    }
}

/// One sub-DAG spawned by a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubDagRun {
    pub dag_run_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub params: String,
    pub dag_name: String,
}

fn unset_time() -> String {
    UNSET_TIME.to_string()
}

/// Execution record for one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub step: Step,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    #[serde(default = "unset_time")]
    pub started_at: String,
    #[serde(default = "unset_time")]
    pub finished_at: String,
    pub status: NodeStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub done_count: u32,
    #[serde(default)]
    pub repeated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_runs: Vec<SubDagRun>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_runs_repeated: Vec<SubDagRun>,
    #[serde(default, skip_serializing_if = "OutputVariables::is_empty")]
    pub output_variables: OutputVariables,
    #[serde(default = "unset_time")]
    pub approved_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(default = "unset_time")]
    pub rejected_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(default, skip_serializing_if = "OutputVariables::is_empty")]
    pub approval_inputs: OutputVariables,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chat_messages: Vec<LlmMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_definitions: Vec<ToolDefinition>,
}

impl Node {
    pub fn new(step: Step) -> Self {
        Self {
            step,
            stdout: String::new(),
            stderr: String::new(),
            started_at: unset_time(),
            finished_at: unset_time(),
            status: NodeStatus::NotStarted,
            retry_count: 0,
            done_count: 0,
            repeated: false,
            error: None,
            sub_runs: Vec::new(),
            sub_runs_repeated: Vec::new(),
            output_variables: OutputVariables::new(),
            approved_at: unset_time(),
            approved_by: None,
            rejected_at: unset_time(),
            rejected_by: None,
            rejection_reason: None,
            approval_inputs: OutputVariables::new(),
            chat_messages: Vec::new(),
            tool_definitions: Vec::new(),
        }
    }

    /// Mark the node running and stamp its start time once
    pub fn start(&mut self, now: TimeInUtc) {
        if self.started_at == UNSET_TIME {
            self.started_at = now.canonical();
        }
        self.status = NodeStatus::Running;
    }

    /// Transition to a terminal status and stamp the finish time
    pub fn finish(&mut self, status: NodeStatus, now: TimeInUtc) {
        self.status = status;
        self.finished_at = now.canonical();
    }

    pub fn approved(&self) -> bool {
        self.approved_at != UNSET_TIME
    }

    pub fn rejected(&self) -> bool {
        self.rejected_at != UNSET_TIME
    }
}

/// Options captured when an attempt is materialized
#[derive(Debug, Clone, Default)]
pub struct CreateAttemptOptions {
    pub root: Option<DagRunRef>,
    pub parent: Option<DagRunRef>,
    pub trigger: TriggerType,
    pub scheduled_time: Option<TimeInUtc>,
    /// Marks this attempt as a replay of a prior run
    pub retry: bool,
    pub worker_id: Option<String>,
    /// Effective params for this run; falls back to the DAG's defaults
    pub params: Option<String>,
}

/// The attempt body: one dag-run attempt's full lifecycle record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagRunStatus {
    #[serde(default, skip_serializing_if = "DagRunRef::is_zero")]
    pub root: DagRunRef,
    #[serde(default, skip_serializing_if = "DagRunRef::is_zero")]
    pub parent: DagRunRef,
    pub name: String,
    pub dag_run_id: String,
    pub attempt_id: String,
    pub attempt_key: String,
    pub status: RunStatus,
    pub trigger_type: TriggerType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_time: Option<TimeInUtc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub worker_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub nodes: Vec<Node>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_init: Option<Node>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<Node>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<Node>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_cancel: Option<Node>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_wait: Option<Node>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_exit: Option<Node>,
    /// Epoch millis, assigned once at creation and never mutated
    pub created_at: i64,
    #[serde(default = "unset_time")]
    pub queued_at: String,
    #[serde(default = "unset_time")]
    pub started_at: String,
    #[serde(default = "unset_time")]
    pub finished_at: String,
    /// Scheduler log path
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub log: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params_list: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preconditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl DagRunStatus {
    /// Build the initial status for a freshly created attempt
    pub fn initial(
        dag: &Dag,
        dag_run_id: &str,
        attempt_id: &str,
        opts: &CreateAttemptOptions,
    ) -> Self {
        let root = opts.root.clone().unwrap_or_default();
        let parent = opts.parent.clone().unwrap_or_default();
        let attempt_key = generate_attempt_key(
            &root.name,
            &root.id,
            &dag.name,
            dag_run_id,
            attempt_id,
        );

        Self {
            root,
            parent,
            name: dag.name.clone(),
            dag_run_id: dag_run_id.to_string(),
            attempt_id: attempt_id.to_string(),
            attempt_key,
            status: RunStatus::NotStarted,
            trigger_type: opts.trigger,
            scheduled_time: opts.scheduled_time,
            worker_id: opts.worker_id.clone().unwrap_or_default(),
            pid: None,
            nodes: dag.steps.iter().cloned().map(Node::new).collect(),
            on_init: dag.handlers.init.clone().map(Node::new),
            on_success: dag.handlers.success.clone().map(Node::new),
            on_failure: dag.handlers.failure.clone().map(Node::new),
            on_cancel: dag.handlers.cancel.clone().map(Node::new),
            on_wait: dag.handlers.wait.clone().map(Node::new),
            on_exit: dag.handlers.exit.clone().map(Node::new),
            created_at: TimeInUtc::now().epoch_millis(),
            queued_at: unset_time(),
            started_at: unset_time(),
            finished_at: unset_time(),
            log: String::new(),
            error: None,
            params: opts.params.clone().or_else(|| dag.params.clone()),
            params_list: dagflow_common::params::split_params(
                opts.params
                    .as_deref()
                    .or(dag.params.as_deref())
                    .unwrap_or_default(),
            ),
            preconditions: dag.preconditions.clone(),
            tags: dag.tags.clone(),
        }
    }

    pub fn dag_run_ref(&self) -> DagRunRef {
        DagRunRef::new(self.name.clone(), self.dag_run_id.clone())
    }

    /// The enclosing root ref, or this run itself when it is the root
    pub fn root_ref(&self) -> DagRunRef {
        if self.root.is_zero() {
            self.dag_run_ref()
        } else {
            self.root.clone()
        }
    }

    pub fn node(&self, step_name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.step.name == step_name)
    }

    pub fn node_mut(&mut self, step_name: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.step.name == step_name)
    }

    /// Mark queued; used only after a successful enqueue
    pub fn mark_queued(&mut self, trigger: TriggerType, now: TimeInUtc) {
        self.status = RunStatus::Queued;
        self.trigger_type = trigger;
        self.queued_at = now.canonical();
    }

    pub fn mark_running(&mut self, now: TimeInUtc) {
        self.status = RunStatus::Running;
        if self.started_at == UNSET_TIME {
            self.started_at = now.canonical();
        }
    }

    pub fn mark_finished(&mut self, status: RunStatus, now: TimeInUtc) {
        self.status = status;
        self.finished_at = now.canonical();
    }

    /// Created-at as a typed time, for retention and range filters
    pub fn created_time(&self) -> Option<TimeInUtc> {
        TimeInUtc::from_epoch_millis(self.created_at).ok()
    }

    /// Collected outputs of all nodes, in node order
    pub fn outputs(&self) -> OutputVariables {
        let mut out = OutputVariables::new();
        for node in &self.nodes {
            out.merge(&node.output_variables);
        }
        out
    }

    pub fn finished_time(&self) -> Option<TimeInUtc> {
        timeutil::parse_time(&self.finished_at).ok().flatten()
    }
}

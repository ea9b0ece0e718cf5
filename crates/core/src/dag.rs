//! DAG and step definitions

use dagflow_common::error::{Error, Result};
use dagflow_common::keys::canonical_dag_name;
use dagflow_common::llm::LlmMessage;
use petgraph::{algo::is_cyclic_directed, graph::DiGraph};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// What to do with scheduled firings missed during downtime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CatchupPolicy {
    /// Discard all missed firings
    #[default]
    Off,
    /// Enqueue exactly one run for the most recent missed firing
    Latest,
    /// Enqueue every missed firing in chronological order, up to a cap
    All,
}

impl FromStr for CatchupPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "false" | "off" => Ok(Self::Off),
            "latest" => Ok(Self::Latest),
            "all" | "true" => Ok(Self::All),
            other => Err(Error::Validation(format!(
                "invalid catchup policy {other:?}: expected one of off, latest, all"
            ))),
        }
    }
}

impl TryFrom<String> for CatchupPolicy {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<CatchupPolicy> for String {
    fn from(p: CatchupPolicy) -> Self {
        p.to_string()
    }
}

impl fmt::Display for CatchupPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Off => "off",
            Self::Latest => "latest",
            Self::All => "all",
        })
    }
}

/// Retry configuration for one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub limit: u32,
    #[serde(default = "default_retry_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_backoff")]
    pub backoff: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_interval_secs: Option<u64>,
}

fn default_retry_interval() -> u64 {
    1
}

fn default_backoff() -> f64 {
    2.0
}

/// Repeat configuration for one step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepeatPolicy {
    pub repeat: bool,
    #[serde(default)]
    pub limit: u32,
    #[serde(default)]
    pub interval_secs: u64,
}

/// Whether dependents still run after this step fails or is skipped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinueOn {
    #[serde(default)]
    pub failure: bool,
    #[serde(default)]
    pub skipped: bool,
}

/// A command/expected pair evaluated before a step runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub condition: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub expected: String,
}

/// Reference to a sub-DAG executed by a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubDagRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub params: String,
}

/// Human-in-the-loop gate on a step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApprovalConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub approvers: Vec<String>,
}

/// One model endpoint tried by a chat step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub provider: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

fn default_max_tool_iterations() -> u32 {
    10
}

/// Chat step configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatStepConfig {
    pub models: Vec<ModelEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<LlmMessage>,
    /// Names of DAGs published to the model as tools
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<bool>,
    #[serde(default)]
    pub stream: bool,
}

/// Execution mode of a step, derived from its configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    Command,
    SubDag,
    Chat,
}

/// One step of a DAG
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_policy: Option<RepeatPolicy>,
    #[serde(default)]
    pub continue_on: ContinueOn,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preconditions: Vec<Condition>,
    /// Variable name the step's trimmed stdout is captured into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_dag: Option<SubDagRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm: Option<ChatStepConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Step {
    pub fn kind(&self) -> ExecutorKind {
        if self.sub_dag.is_some() {
            ExecutorKind::SubDag
        } else if self.llm.is_some() {
            ExecutorKind::Chat
        } else {
            ExecutorKind::Command
        }
    }
}

/// Handler steps bound to run lifecycle events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandlerOn {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel: Option<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit: Option<Step>,
}

/// A directed acyclic graph of steps
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dag {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub schedule: Vec<String>,
    #[serde(default)]
    pub catchup_policy: CatchupPolicy,
    /// Queue name used for admission; defaults to the DAG name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proc_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_active_runs: Option<usize>,
    /// Default params string; drives the tool JSON Schema when used as a tool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Names of env entries whose values are masked at provider boundaries
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
    /// Run-level gates evaluated before any step
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preconditions: Vec<Condition>,
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "HandlerOn::is_empty")]
    pub handlers: HandlerOn,
    /// Inline sub-DAGs resolvable without the DAG database
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub local_dags: HashMap<String, Dag>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Non-empty selector routes execution to a matching remote worker
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub worker_selector: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_days: Option<i32>,
}

impl HandlerOn {
    pub fn is_empty(&self) -> bool {
        self.init.is_none()
            && self.success.is_none()
            && self.failure.is_none()
            && self.cancel.is_none()
            && self.wait.is_none()
            && self.exit.is_none()
    }
}

impl Dag {
    pub fn proc_group(&self) -> &str {
        self.proc_group.as_deref().unwrap_or(&self.name)
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// True when execution is routed to a remote worker
    pub fn is_distributed(&self) -> bool {
        !self.worker_selector.is_empty()
    }

    /// Validate the DAG: canonical name, unique step names, known
    /// dependencies, and an acyclic step graph.
    pub fn validate(&self) -> Result<()> {
        canonical_dag_name(&self.name)?;

        let mut graph = DiGraph::<&str, ()>::new();
        let mut indices = HashMap::new();
        for step in &self.steps {
            if indices.contains_key(step.name.as_str()) {
                return Err(Error::Validation(format!(
                    "duplicate step name {:?} in DAG {:?}",
                    step.name, self.name
                )));
            }
            indices.insert(step.name.as_str(), graph.add_node(step.name.as_str()));
        }

        for step in &self.steps {
            for dep in &step.depends {
                let Some(&from) = indices.get(dep.as_str()) else {
                    return Err(Error::Validation(format!(
                        "step {:?} depends on unknown step {:?}",
                        step.name, dep
                    )));
                };
                graph.add_edge(from, indices[step.name.as_str()], ());
            }
        }

        if is_cyclic_directed(&graph) {
            return Err(Error::Validation(format!(
                "DAG {:?} contains a dependency cycle",
                self.name
            )));
        }

        for local in self.local_dags.values() {
            local.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str, depends: &[&str]) -> Step {
        Step {
            name: name.to_string(),
            run: Some(format!("echo {name}")),
            depends: depends.iter().map(ToString::to_string).collect(),
            ..Step::default()
        }
    }

    #[test]
    fn catchup_policy_parsing() {
        for (input, expected) in [
            ("", CatchupPolicy::Off),
            ("false", CatchupPolicy::Off),
            ("OFF", CatchupPolicy::Off),
            ("Latest", CatchupPolicy::Latest),
            ("all", CatchupPolicy::All),
            ("TRUE", CatchupPolicy::All),
        ] {
            assert_eq!(input.parse::<CatchupPolicy>().unwrap(), expected, "{input:?}");
        }

        let err = "weekly".parse::<CatchupPolicy>().unwrap_err();
        assert!(err.to_string().contains("weekly"));
    }

    #[test]
    fn validate_accepts_diamond() {
        let dag = Dag {
            name: "diamond".to_string(),
            steps: vec![
                step("a", &[]),
                step("b", &["a"]),
                step("c", &["a"]),
                step("d", &["b", "c"]),
            ],
            ..Dag::default()
        };
        dag.validate().unwrap();
    }

    #[test]
    fn validate_rejects_cycle() {
        let dag = Dag {
            name: "cyclic".to_string(),
            steps: vec![step("a", &["b"]), step("b", &["a"])],
            ..Dag::default()
        };
        let err = dag.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn validate_rejects_unknown_dependency() {
        let dag = Dag {
            name: "dangling".to_string(),
            steps: vec![step("a", &["missing"])],
            ..Dag::default()
        };
        assert!(dag.validate().is_err());
    }

    #[test]
    fn proc_group_defaults_to_name() {
        let mut dag = Dag {
            name: "etl".to_string(),
            ..Dag::default()
        };
        assert_eq!(dag.proc_group(), "etl");
        dag.proc_group = Some("batch".to_string());
        assert_eq!(dag.proc_group(), "batch");
    }

    #[test]
    fn step_kind_derivation() {
        assert_eq!(step("a", &[]).kind(), ExecutorKind::Command);

        let sub = Step {
            sub_dag: Some(SubDagRef {
                name: "child".to_string(),
                params: String::new(),
            }),
            ..step("s", &[])
        };
        assert_eq!(sub.kind(), ExecutorKind::SubDag);

        let chat = Step {
            llm: Some(ChatStepConfig {
                models: vec![],
                system: None,
                messages: vec![],
                tools: vec![],
                max_tool_iterations: 10,
                thinking: None,
                stream: false,
            }),
            ..step("c", &[])
        };
        assert_eq!(chat.kind(), ExecutorKind::Chat);
    }
}

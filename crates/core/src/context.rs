//! Per-run environment scope and execution context

use crate::dispatch::Dispatcher;
use crate::store::{DagDatabase, DagRunStore, QueueStore};
use dagflow_common::types::DagRunRef;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Environment variable carrying the run's scheduler log file
pub const ENV_DAG_RUN_LOG_FILE: &str = "DAG_RUN_LOG_FILE";
/// Environment variable carrying the dag-run id
pub const ENV_DAG_RUN_ID: &str = "DAG_RUN_ID";
/// Environment variable carrying the DAG name
pub const ENV_DAG_NAME: &str = "DAG_NAME";

static VAR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").unwrap());

/// Layered environment: OS → params → DAG env → secrets, highest wins.
///
/// Only the secrets layer is subject to masking at provider boundaries.
#[derive(Debug, Clone, Default)]
pub struct EnvScope {
    os: HashMap<String, String>,
    params: HashMap<String, String>,
    dag_env: HashMap<String, String>,
    secrets: HashMap<String, String>,
}

impl EnvScope {
    /// Scope seeded from the process environment
    pub fn from_os() -> Self {
        Self {
            os: std::env::vars().collect(),
            ..Self::default()
        }
    }

    /// Scope with no OS layer; used by tests and hermetic runs
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_params(mut self, params: HashMap<String, String>) -> Self {
        self.params = params;
        self
    }

    pub fn with_dag_env(mut self, dag_env: HashMap<String, String>) -> Self {
        self.dag_env = dag_env;
        self
    }

    pub fn with_secrets(mut self, secrets: HashMap<String, String>) -> Self {
        self.secrets = secrets;
        self
    }

    /// Add or overwrite one entry in the DAG env layer
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.dag_env.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.secrets
            .get(key)
            .or_else(|| self.dag_env.get(key))
            .or_else(|| self.params.get(key))
            .or_else(|| self.os.get(key))
            .map(String::as_str)
    }

    /// Merged view, lowest layer first so higher layers win
    pub fn vars(&self) -> HashMap<String, String> {
        let mut merged = self.os.clone();
        merged.extend(self.params.clone());
        merged.extend(self.dag_env.clone());
        merged.extend(self.secrets.clone());
        merged
    }

    /// Every secret value in scope; the masking view
    pub fn all_secrets(&self) -> Vec<String> {
        let mut values: Vec<String> = self
            .secrets
            .values()
            .filter(|v| !v.is_empty())
            .cloned()
            .collect();
        // Longest first so overlapping secrets mask completely
        values.sort_by_key(|v| std::cmp::Reverse(v.len()));
        values
    }

    /// Substitute `${VAR}` and `$VAR` references; unknown variables are left
    /// untouched
    pub fn expand(&self, input: &str) -> String {
        VAR_PATTERN
            .replace_all(input, |caps: &regex::Captures<'_>| {
                let name = caps
                    .get(1)
                    .or_else(|| caps.get(2))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                match self.get(name) {
                    Some(value) => value.to_string(),
                    None => caps.get(0).unwrap().as_str().to_string(),
                }
            })
            .into_owned()
    }
}

/// Everything an executor needs to run one attempt
#[derive(Clone)]
pub struct RunContext {
    pub env: EnvScope,
    pub run_store: Arc<dyn DagRunStore>,
    pub queue_store: Arc<dyn QueueStore>,
    pub dag_db: Arc<dyn DagDatabase>,
    pub dispatcher: Option<Arc<dyn Dispatcher>>,
    pub cancel: CancellationToken,
    /// The enclosing root run; equals the run itself at the top level
    pub root: DagRunRef,
    pub dag_name: String,
    pub dag_run_id: String,
}

impl RunContext {
    /// Export the run-identifying variables into the env scope
    pub fn export_run_vars(&mut self, log_file: &str) {
        self.env.set(ENV_DAG_RUN_LOG_FILE, log_file);
        self.env.set(ENV_DAG_RUN_ID, self.dag_run_id.clone());
        self.env.set(ENV_DAG_NAME, self.dag_name.clone());
    }

    /// Context for a child run under the same root
    pub fn for_sub_run(&self, dag_name: &str, dag_run_id: &str) -> Self {
        Self {
            root: self.root.clone(),
            dag_name: dag_name.to_string(),
            dag_run_id: dag_run_id.to_string(),
            cancel: self.cancel.child_token(),
            ..self.clone()
        }
    }
}

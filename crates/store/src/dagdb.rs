//! DAG definition lookup.
//!
//! Definitions are stored as JSON documents (YAML loading is an outer
//! concern); a file-backed database scans a directory, and an in-memory one
//! backs tests and programmatic registration.

use crate::fsutil::read_json;
use async_trait::async_trait;
use dagflow_common::error::{Error, Result};
use dagflow_common::keys::canonical_dag_name;
use dagflow_core::dag::Dag;
use dagflow_core::store::DagDatabase;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::warn;

pub struct FileDagDatabase {
    dir: PathBuf,
}

impl FileDagDatabase {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl DagDatabase for FileDagDatabase {
    async fn get_dag(&self, name: &str) -> Result<Dag> {
        let canonical = canonical_dag_name(name)?;
        let path = self.dir.join(format!("{canonical}.json"));
        if !crate::fsutil::exists(&path).await {
            return Err(Error::DagRunNotFound(format!("DAG {canonical} not found")));
        }
        let dag: Dag = read_json(&path).await?;
        dag.validate()?;
        Ok(dag)
    }

    async fn list_dags(&self) -> Result<Vec<Dag>> {
        let mut dags = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(dags),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<Dag>(&path).await {
                Ok(dag) => match dag.validate() {
                    Ok(()) => dags.push(dag),
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping invalid DAG"),
                },
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable DAG"),
            }
        }
        dags.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(dags)
    }
}

/// Programmatically-registered DAGs
#[derive(Default)]
pub struct InMemoryDagDatabase {
    dags: RwLock<HashMap<String, Dag>>,
}

impl InMemoryDagDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, dag: Dag) {
        self.dags.write().insert(dag.name.clone(), dag);
    }
}

#[async_trait]
impl DagDatabase for InMemoryDagDatabase {
    async fn get_dag(&self, name: &str) -> Result<Dag> {
        self.dags
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::DagRunNotFound(format!("DAG {name} not found")))
    }

    async fn list_dags(&self) -> Result<Vec<Dag>> {
        let mut dags: Vec<Dag> = self.dags.read().values().cloned().collect();
        dags.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(dags)
    }
}

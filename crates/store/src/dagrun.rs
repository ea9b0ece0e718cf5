//! File-backed dag-run store.
//!
//! Layout:
//! `{base}/dag-runs/{dag}/{run_id}/attempt_{millis}_{hash}/` for root runs,
//! with sub-runs of any DAG stored flat under the root run's `children/`
//! directory so the whole tree is reachable from its root.

use crate::attempt::FileRunAttempt;
use crate::fsutil::{atomic_write_json, read_json, sorted_dirs_with_prefix};
use async_trait::async_trait;
use dagflow_common::error::{Error, Result};
use dagflow_common::keys::sanitize_for_filename;
use dagflow_common::timeutil::TimeInUtc;
use dagflow_common::types::DagRunRef;
use dagflow_core::dag::Dag;
use dagflow_core::status::{CreateAttemptOptions, DagRunStatus};
use dagflow_core::store::{DagRunStore, ListStatusOptions, RunAttempt};
use std::hash::Hasher;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

const RUNS_DIR: &str = "dag-runs";
const CHILDREN_DIR: &str = "children";
const ATTEMPT_PREFIX: &str = "attempt_";
const STATUS_FILE: &str = "status.json";
const DAG_FILE: &str = "dag.json";

/// Deterministic 8-hex suffix so attempt ids are reproducible for one
/// `(dag, run_id, ts)` and creation stays idempotent
fn hash_suffix(dag_name: &str, run_id: &str, millis: i64) -> String {
    let mut hasher = fnv::FnvHasher::default();
    hasher.write(dag_name.as_bytes());
    hasher.write(&[0]);
    hasher.write(run_id.as_bytes());
    hasher.write(&[0]);
    hasher.write(&millis.to_be_bytes());
    format!("{:08x}", hasher.finish() as u32)
}

pub struct FileDagRunStore {
    runs_root: PathBuf,
}

impl FileDagRunStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_root: data_dir.into().join(RUNS_DIR),
        }
    }

    fn run_dir(&self, dag_run: &DagRunRef) -> PathBuf {
        self.runs_root
            .join(sanitize_for_filename(&dag_run.name))
            .join(sanitize_for_filename(&dag_run.id))
    }

    fn child_run_dir(&self, root: &DagRunRef, sub_run_id: &str) -> PathBuf {
        self.run_dir(root)
            .join(CHILDREN_DIR)
            .join(sanitize_for_filename(sub_run_id))
    }

    async fn latest_attempt_in(&self, run_dir: &Path) -> Result<Option<FileRunAttempt>> {
        let attempts = sorted_dirs_with_prefix(run_dir, ATTEMPT_PREFIX).await?;
        Ok(attempts.last().map(|name| {
            let attempt_id = name.trim_start_matches(ATTEMPT_PREFIX).to_string();
            FileRunAttempt::new(run_dir.join(name), attempt_id)
        }))
    }

    async fn run_dirs(&self, dag_name: &str) -> Result<Vec<PathBuf>> {
        let dag_dir = self.runs_root.join(sanitize_for_filename(dag_name));
        let names = sorted_dirs_with_prefix(&dag_dir, "").await?;
        Ok(names.into_iter().map(|n| dag_dir.join(n)).collect())
    }

    async fn read_latest_status(&self, run_dir: &Path) -> Result<Option<DagRunStatus>> {
        let Some(attempt) = self.latest_attempt_in(run_dir).await? else {
            return Ok(None);
        };
        if attempt.hidden().await {
            return Ok(None);
        }
        match attempt.read_status().await {
            Ok(status) => Ok(Some(status)),
            Err(Error::NoStatusData(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl DagRunStore for FileDagRunStore {
    async fn create_attempt(
        &self,
        dag: &Dag,
        ts: TimeInUtc,
        dag_run_id: &str,
        opts: CreateAttemptOptions,
    ) -> Result<Arc<dyn RunAttempt>> {
        if dag_run_id.is_empty() {
            return Err(Error::Validation("dag-run id must not be empty".to_string()));
        }

        let self_ref = DagRunRef::new(dag.name.clone(), dag_run_id.to_string());
        let run_dir = match &opts.root {
            Some(root) if *root != self_ref => self.child_run_dir(root, dag_run_id),
            _ => self.run_dir(&self_ref),
        };

        let millis = ts.epoch_millis();
        let attempt_id = format!("{millis}_{}", hash_suffix(&dag.name, dag_run_id, millis));
        let attempt_dir = run_dir.join(format!("{ATTEMPT_PREFIX}{attempt_id}"));

        if crate::fsutil::exists(&attempt_dir.join(STATUS_FILE)).await {
            return Err(Error::DagRunAlreadyExists(format!(
                "{}:{dag_run_id} attempt {attempt_id}",
                dag.name
            )));
        }

        let status = DagRunStatus::initial(dag, dag_run_id, &attempt_id, &opts);
        atomic_write_json(&attempt_dir.join(STATUS_FILE), &status).await?;
        atomic_write_json(&attempt_dir.join(DAG_FILE), dag).await?;

        Ok(Arc::new(FileRunAttempt::new(attempt_dir, attempt_id)))
    }

    async fn latest_attempt(&self, name: &str) -> Result<Arc<dyn RunAttempt>> {
        let mut best: Option<(String, FileRunAttempt)> = None;
        for run_dir in self.run_dirs(name).await? {
            if let Some(attempt) = self.latest_attempt_in(&run_dir).await? {
                let key = attempt.id();
                match &best {
                    Some((current, _)) if *current >= key => {}
                    _ => best = Some((key, attempt)),
                }
            }
        }
        best.map(|(_, a)| Arc::new(a) as Arc<dyn RunAttempt>)
            .ok_or_else(|| Error::DagRunNotFound(name.to_string()))
    }

    async fn find_attempt(&self, dag_run: &DagRunRef) -> Result<Arc<dyn RunAttempt>> {
        let run_dir = self.run_dir(dag_run);
        self.latest_attempt_in(&run_dir)
            .await?
            .map(|a| Arc::new(a) as Arc<dyn RunAttempt>)
            .ok_or_else(|| Error::DagRunNotFound(dag_run.to_string()))
    }

    async fn find_sub_attempt(
        &self,
        root: &DagRunRef,
        sub_dag_run_id: &str,
    ) -> Result<Arc<dyn RunAttempt>> {
        let run_dir = self.child_run_dir(root, sub_dag_run_id);
        self.latest_attempt_in(&run_dir)
            .await?
            .map(|a| Arc::new(a) as Arc<dyn RunAttempt>)
            .ok_or_else(|| {
                Error::DagRunNotFound(format!("{root} child {sub_dag_run_id}"))
            })
    }

    async fn list_statuses(&self, opts: ListStatusOptions) -> Result<Vec<DagRunStatus>> {
        let dag_names = sorted_dirs_with_prefix(&self.runs_root, "").await?;
        let mut statuses = Vec::new();

        'dags: for dag_name in dag_names {
            if let Some(exact) = &opts.exact_name {
                if dag_name != sanitize_for_filename(exact) {
                    continue;
                }
            } else if let Some(fragment) = &opts.name {
                if !dag_name.contains(fragment.as_str()) {
                    continue;
                }
            }

            for run_dir in self.run_dirs(&dag_name).await? {
                let status = match self.read_latest_status(&run_dir).await {
                    Ok(Some(status)) => status,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(dir = %run_dir.display(), error = %e, "skipping unreadable dag-run");
                        continue;
                    }
                };

                if let Some(run_id) = &opts.dag_run_id {
                    if status.dag_run_id != *run_id {
                        continue;
                    }
                }
                if !opts.statuses.is_empty() && !opts.statuses.contains(&status.status) {
                    continue;
                }
                if !opts.tags.iter().all(|t| status.tags.contains(t)) {
                    continue;
                }
                let created = status.created_time();
                if let Some(from) = opts.from {
                    if created.map_or(true, |c| c < from) {
                        continue;
                    }
                }
                if let Some(to) = opts.to {
                    if created.map_or(true, |c| c >= to) {
                        continue;
                    }
                }

                statuses.push(status);
                if let Some(limit) = opts.limit {
                    // Collect past the limit within one DAG so the newest
                    // runs win after the global sort below
                    if statuses.len() >= limit.saturating_mul(4) {
                        break 'dags;
                    }
                }
            }
        }

        statuses.sort_by_key(|s| std::cmp::Reverse(s.created_at));
        if let Some(limit) = opts.limit {
            statuses.truncate(limit);
        }
        Ok(statuses)
    }

    async fn remove_old_dag_runs(
        &self,
        name: &str,
        retention_days: i32,
        dry_run: bool,
    ) -> Result<Vec<String>> {
        if retention_days < 0 {
            return Ok(Vec::new());
        }

        let cutoff = TimeInUtc::now().epoch_millis() - i64::from(retention_days) * 86_400_000;
        let mut removed = Vec::new();

        for run_dir in self.run_dirs(name).await? {
            let Some(status) = self.read_latest_status(&run_dir).await? else {
                continue;
            };
            if !status.status.is_final() {
                continue;
            }
            if status.created_at >= cutoff {
                continue;
            }

            removed.push(status.dag_run_id.clone());
            if !dry_run {
                tokio::fs::remove_dir_all(&run_dir).await?;
            }
        }
        Ok(removed)
    }

    async fn rename_dag_runs(&self, old_name: &str, new_name: &str) -> Result<()> {
        let old_dir = self.runs_root.join(sanitize_for_filename(old_name));
        if !crate::fsutil::exists(&old_dir).await {
            return Ok(());
        }
        let new_dir = self.runs_root.join(sanitize_for_filename(new_name));
        tokio::fs::create_dir_all(&new_dir).await?;

        for run_name in sorted_dirs_with_prefix(&old_dir, "").await? {
            tokio::fs::rename(old_dir.join(&run_name), new_dir.join(&run_name)).await?;
        }
        tokio::fs::remove_dir_all(&old_dir).await?;

        // History follows the rename: rewrite the stored name on every attempt
        for run_dir in self.run_dirs(new_name).await? {
            for attempt_name in sorted_dirs_with_prefix(&run_dir, ATTEMPT_PREFIX).await? {
                let status_path = run_dir.join(&attempt_name).join(STATUS_FILE);
                let mut status: DagRunStatus = match read_json(&status_path).await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(path = %status_path.display(), error = %e, "skipping rename rewrite");
                        continue;
                    }
                };
                status.name = new_name.to_string();
                atomic_write_json(&status_path, &status).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagflow_common::types::{RunStatus, TriggerType};
    use dagflow_core::dag::Step;

    fn dag(name: &str) -> Dag {
        Dag {
            name: name.to_string(),
            steps: vec![Step {
                name: "one".to_string(),
                run: Some("echo one".to_string()),
                ..Step::default()
            }],
            tags: vec!["batch".to_string()],
            ..Dag::default()
        }
    }

    fn store(dir: &tempfile::TempDir) -> FileDagRunStore {
        FileDagRunStore::new(dir.path())
    }

    async fn write_status(
        attempt: &Arc<dyn RunAttempt>,
        mutate: impl FnOnce(&mut DagRunStatus),
    ) {
        attempt.open().await.unwrap();
        let mut status = attempt.read_status().await.unwrap();
        mutate(&mut status);
        attempt.write(&status).await.unwrap();
        attempt.close().await.unwrap();
    }

    #[tokio::test]
    async fn create_is_idempotent_on_same_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let d = dag("etl");
        let ts = TimeInUtc::from_rfc3339("2026-08-01T10:00:00Z").unwrap();

        store
            .create_attempt(&d, ts, "r1", CreateAttemptOptions::default())
            .await
            .unwrap();
        let err = store
            .create_attempt(&d, ts, "r1", CreateAttemptOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DagRunAlreadyExists(_)));

        // A later timestamp creates a second attempt for the same run
        let ts2 = TimeInUtc::from_rfc3339("2026-08-01T11:00:00Z").unwrap();
        let retry = store
            .create_attempt(&d, ts2, "r1", CreateAttemptOptions::default())
            .await
            .unwrap();
        let latest = store
            .find_attempt(&DagRunRef::new("etl", "r1"))
            .await
            .unwrap();
        assert_eq!(latest.id(), retry.id());
    }

    #[tokio::test]
    async fn latest_attempt_spans_run_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let d = dag("etl");

        let t1 = TimeInUtc::from_rfc3339("2026-08-01T10:00:00Z").unwrap();
        let t2 = TimeInUtc::from_rfc3339("2026-08-01T12:00:00Z").unwrap();
        store
            .create_attempt(&d, t1, "r1", CreateAttemptOptions::default())
            .await
            .unwrap();
        let newer = store
            .create_attempt(&d, t2, "r2", CreateAttemptOptions::default())
            .await
            .unwrap();

        let latest = store.latest_attempt("etl").await.unwrap();
        assert_eq!(latest.id(), newer.id());
        assert_eq!(latest.read_status().await.unwrap().dag_run_id, "r2");
    }

    #[tokio::test]
    async fn sub_attempts_live_under_their_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let parent = dag("parent");
        let child = dag("child");
        let ts = TimeInUtc::from_rfc3339("2026-08-01T10:00:00Z").unwrap();

        store
            .create_attempt(&parent, ts, "p1", CreateAttemptOptions::default())
            .await
            .unwrap();

        let root = DagRunRef::new("parent", "p1");
        let opts = CreateAttemptOptions {
            root: Some(root.clone()),
            parent: Some(root.clone()),
            trigger: TriggerType::SubDag,
            ..CreateAttemptOptions::default()
        };
        store
            .create_attempt(&child, ts, "c1", opts)
            .await
            .unwrap();

        let found = store.find_sub_attempt(&root, "c1").await.unwrap();
        let status = found.read_status().await.unwrap();
        assert_eq!(status.root, root);
        assert_eq!(status.name, "child");

        // The sub-run is not a root-level run of its own DAG
        assert!(store
            .find_attempt(&DagRunRef::new("child", "c1"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn list_statuses_filters() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let d = dag("etl-daily");
        let ts = TimeInUtc::from_rfc3339("2026-08-01T10:00:00Z").unwrap();

        let a1 = store
            .create_attempt(&d, ts, "r1", CreateAttemptOptions::default())
            .await
            .unwrap();
        write_status(&a1, |s| {
            s.mark_finished(RunStatus::Succeeded, TimeInUtc::now());
        })
        .await;

        let ts2 = TimeInUtc::from_rfc3339("2026-08-01T11:00:00Z").unwrap();
        let a2 = store
            .create_attempt(&d, ts2, "r2", CreateAttemptOptions::default())
            .await
            .unwrap();
        write_status(&a2, |s| {
            s.mark_finished(RunStatus::Failed, TimeInUtc::now());
        })
        .await;

        let all = store
            .list_statuses(ListStatusOptions {
                name: Some("etl".to_string()),
                ..ListStatusOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let failed = store
            .list_statuses(ListStatusOptions {
                exact_name: Some("etl-daily".to_string()),
                statuses: vec![RunStatus::Failed],
                ..ListStatusOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].dag_run_id, "r2");

        let tagged = store
            .list_statuses(ListStatusOptions {
                tags: vec!["batch".to_string(), "missing".to_string()],
                ..ListStatusOptions::default()
            })
            .await
            .unwrap();
        assert!(tagged.is_empty());

        let by_id = store
            .list_statuses(ListStatusOptions {
                dag_run_id: Some("r1".to_string()),
                ..ListStatusOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(by_id.len(), 1);
        assert_eq!(by_id[0].status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn retention_preserves_non_final_runs() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let d = dag("etl");
        let ts = TimeInUtc::from_rfc3339("2026-08-01T10:00:00Z").unwrap();

        for (run_id, status) in [
            ("done", RunStatus::Succeeded),
            ("failed", RunStatus::Failed),
            ("running", RunStatus::Running),
            ("queued", RunStatus::Queued),
            ("waiting", RunStatus::Waiting),
        ] {
            let attempt = store
                .create_attempt(&d, ts, run_id, CreateAttemptOptions::default())
                .await
                .unwrap();
            write_status(&attempt, |s| s.status = status).await;
        }

        // Negative retention removes nothing
        assert!(store
            .remove_old_dag_runs("etl", -1, false)
            .await
            .unwrap()
            .is_empty());

        // Dry run reports candidates without deleting
        let candidates = store.remove_old_dag_runs("etl", 0, true).await.unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(
            store
                .list_statuses(ListStatusOptions::default())
                .await
                .unwrap()
                .len(),
            5
        );

        let mut removed = store.remove_old_dag_runs("etl", 0, false).await.unwrap();
        removed.sort();
        assert_eq!(removed, ["done", "failed"]);

        let left = store
            .list_statuses(ListStatusOptions::default())
            .await
            .unwrap();
        assert_eq!(left.len(), 3);
        assert!(left.iter().all(|s| s.status.is_active()));
    }

    #[tokio::test]
    async fn rename_moves_history() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let d = dag("before");
        let ts = TimeInUtc::from_rfc3339("2026-08-01T10:00:00Z").unwrap();
        store
            .create_attempt(&d, ts, "r1", CreateAttemptOptions::default())
            .await
            .unwrap();

        store.rename_dag_runs("before", "after").await.unwrap();

        let found = store
            .find_attempt(&DagRunRef::new("after", "r1"))
            .await
            .unwrap();
        assert_eq!(found.read_status().await.unwrap().name, "after");
        assert!(store.latest_attempt("before").await.is_err());
    }

    #[tokio::test]
    async fn hidden_attempts_skipped_in_listing() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let d = dag("etl");
        let ts = TimeInUtc::from_rfc3339("2026-08-01T10:00:00Z").unwrap();

        let attempt = store
            .create_attempt(&d, ts, "r1", CreateAttemptOptions::default())
            .await
            .unwrap();
        attempt.hide().await.unwrap();

        let listed = store
            .list_statuses(ListStatusOptions::default())
            .await
            .unwrap();
        assert!(listed.is_empty());

        // Data preserved: the attempt is still directly reachable
        assert!(store
            .find_attempt(&DagRunRef::new("etl", "r1"))
            .await
            .is_ok());
    }
}

//! File-backed named priority queues.
//!
//! One directory per queue name; one JSON file per item. File names are
//! `{priority}_{sequence}_{id}.json`, so lexical order equals dequeue order:
//! the priority digit sorts High (0) before Low (1), and the zero-padded
//! sequence keeps FIFO within a band. A dequeue claims the file by renaming
//! it, which succeeds for exactly one claimant.

use crate::fsutil::{atomic_write_json, read_json};
use async_trait::async_trait;
use dagflow_common::error::{Error, Result};
use dagflow_common::timeutil::TimeInUtc;
use dagflow_common::types::{DagRunRef, QueuePriority};
use dagflow_core::store::{QueueEvents, QueueStore, QueuedItem};
use notify::{RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

const QUEUE_DIR: &str = "queue";
const CLAIM_SUFFIX: &str = ".claimed";

/// Persisted body of one queued item
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ItemData {
    id: String,
    queue: String,
    dag_run: DagRunRef,
    priority: QueuePriority,
    enqueued_at: TimeInUtc,
}

/// Handle returned by dequeue and list operations
#[derive(Debug)]
pub struct FileQueuedItem {
    data: ItemData,
}

impl QueuedItem for FileQueuedItem {
    fn id(&self) -> String {
        self.data.id.clone()
    }

    fn data(&self) -> Result<DagRunRef> {
        Ok(self.data.dag_run.clone())
    }
}

pub struct FileQueueStore {
    queue_root: PathBuf,
    sequence: AtomicU64,
    events_tx: Arc<watch::Sender<u64>>,
}

impl FileQueueStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let (events_tx, _) = watch::channel(0);
        Self {
            queue_root: data_dir.into().join(QUEUE_DIR),
            // Nanos since epoch seed keeps FIFO across process restarts
            sequence: AtomicU64::new(
                chrono::Utc::now()
                    .timestamp_nanos_opt()
                    .unwrap_or_default() as u64,
            ),
            events_tx: Arc::new(events_tx),
        }
    }

    fn queue_dir(&self, name: &str) -> PathBuf {
        self.queue_root
            .join(dagflow_common::keys::sanitize_for_filename(name))
    }

    fn notify_change(&self) {
        self.events_tx.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Watch the queue root so externally-enqueued items also wake
    /// subscribers. The returned watcher must be kept alive.
    pub fn start_dir_watcher(&self) -> Result<notify::RecommendedWatcher> {
        std::fs::create_dir_all(&self.queue_root)?;
        let tx = Arc::clone(&self.events_tx);
        let mut watcher = notify::recommended_watcher(
            move |event: std::result::Result<notify::Event, notify::Error>| {
                if event.is_ok() {
                    tx.send_modify(|v| *v = v.wrapping_add(1));
                }
            },
        )
        .map_err(|e| Error::Internal(format!("queue watcher: {e}")))?;
        watcher
            .watch(&self.queue_root, RecursiveMode::Recursive)
            .map_err(|e| Error::Internal(format!("queue watcher: {e}")))?;
        Ok(watcher)
    }

    /// Item file names in dequeue order
    async fn sorted_item_files(&self, dir: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if name.ends_with(".json") && !name.starts_with('.') {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Claim one item file by renaming it; `Ok(None)` when another consumer
    /// won the race
    async fn claim(&self, dir: &Path, file_name: &str) -> Result<Option<ItemData>> {
        let path = dir.join(file_name);
        let claimed = dir.join(format!("{file_name}{CLAIM_SUFFIX}"));
        match tokio::fs::rename(&path, &claimed).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let data: ItemData = match read_json(&claimed).await {
            Ok(data) => data,
            Err(e) => {
                warn!(file = %claimed.display(), error = %e, "dropping unreadable queue item");
                let _ = tokio::fs::remove_file(&claimed).await;
                return Ok(None);
            }
        };
        tokio::fs::remove_file(&claimed).await?;
        Ok(Some(data))
    }

    async fn read_items(&self, name: &str) -> Result<Vec<ItemData>> {
        let dir = self.queue_dir(name);
        let mut items = Vec::new();
        for file_name in self.sorted_item_files(&dir).await? {
            match read_json::<ItemData>(&dir.join(&file_name)).await {
                Ok(data) => items.push(data),
                // Claimed or removed between listing and read
                Err(e) if matches!(e.root(), Error::Io(_)) => continue,
                Err(e) => {
                    warn!(file = %file_name, error = %e, "skipping unreadable queue item");
                }
            }
        }
        Ok(items)
    }

    async fn queue_names(&self) -> Result<Vec<String>> {
        crate::fsutil::sorted_dirs_with_prefix(&self.queue_root, "").await
    }
}

#[async_trait]
impl QueueStore for FileQueueStore {
    async fn enqueue(
        &self,
        name: &str,
        priority: QueuePriority,
        dag_run: DagRunRef,
    ) -> Result<()> {
        let id = Uuid::new_v4().simple().to_string();
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let data = ItemData {
            id: id.clone(),
            queue: name.to_string(),
            dag_run,
            priority,
            enqueued_at: TimeInUtc::now(),
        };

        let file_name = format!("{}_{seq:020}_{id}.json", priority as u8);
        atomic_write_json(&self.queue_dir(name).join(file_name), &data).await?;
        debug!(queue = name, item = %id, ?priority, "enqueued");
        self.notify_change();
        Ok(())
    }

    async fn dequeue_by_name(&self, name: &str) -> Result<Box<dyn QueuedItem>> {
        let dir = self.queue_dir(name);
        loop {
            let files = self.sorted_item_files(&dir).await?;
            if files.is_empty() {
                return Err(Error::QueueEmpty(name.to_string()));
            }
            for file_name in files {
                if let Some(data) = self.claim(&dir, &file_name).await? {
                    self.notify_change();
                    return Ok(Box::new(FileQueuedItem { data }));
                }
            }
            // Every candidate was claimed by a racing consumer; re-list
        }
    }

    async fn dequeue_by_dag_run_id(
        &self,
        name: &str,
        dag_run: &DagRunRef,
    ) -> Result<Vec<Box<dyn QueuedItem>>> {
        let dir = self.queue_dir(name);
        let mut removed: Vec<Box<dyn QueuedItem>> = Vec::new();
        for file_name in self.sorted_item_files(&dir).await? {
            let path = dir.join(&file_name);
            let data: ItemData = match read_json(&path).await {
                Ok(data) => data,
                Err(_) => continue,
            };
            if data.dag_run != *dag_run {
                continue;
            }
            if let Some(data) = self.claim(&dir, &file_name).await? {
                removed.push(Box::new(FileQueuedItem { data }));
            }
        }
        if !removed.is_empty() {
            self.notify_change();
        }
        Ok(removed)
    }

    async fn len(&self, name: &str) -> Result<usize> {
        Ok(self.sorted_item_files(&self.queue_dir(name)).await?.len())
    }

    async fn list(&self, name: &str) -> Result<Vec<Box<dyn QueuedItem>>> {
        Ok(self
            .read_items(name)
            .await?
            .into_iter()
            .map(|data| Box::new(FileQueuedItem { data }) as Box<dyn QueuedItem>)
            .collect())
    }

    async fn list_paginated(
        &self,
        name: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Box<dyn QueuedItem>>> {
        Ok(self
            .read_items(name)
            .await?
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|data| Box::new(FileQueuedItem { data }) as Box<dyn QueuedItem>)
            .collect())
    }

    async fn list_by_dag_name(
        &self,
        name: &str,
        dag_name: &str,
    ) -> Result<Vec<Box<dyn QueuedItem>>> {
        Ok(self
            .read_items(name)
            .await?
            .into_iter()
            .filter(|data| data.dag_run.name == dag_name)
            .map(|data| Box::new(FileQueuedItem { data }) as Box<dyn QueuedItem>)
            .collect())
    }

    async fn all(&self) -> Result<Vec<Box<dyn QueuedItem>>> {
        let mut items = Vec::new();
        for queue in self.queue_names().await? {
            items.extend(self.list(&queue).await?);
        }
        Ok(items)
    }

    async fn queue_list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for queue in self.queue_names().await? {
            if self.len(&queue).await? > 0 {
                names.push(queue);
            }
        }
        Ok(names)
    }

    fn subscribe(&self) -> QueueEvents {
        self.events_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> FileQueueStore {
        FileQueueStore::new(dir.path())
    }

    fn r(id: &str) -> DagRunRef {
        DagRunRef::new("etl", id)
    }

    #[tokio::test]
    async fn priority_then_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let q = store(&dir);

        q.enqueue("default", QueuePriority::High, r("a")).await.unwrap();
        q.enqueue("default", QueuePriority::Low, r("b")).await.unwrap();
        q.enqueue("default", QueuePriority::High, r("c")).await.unwrap();

        let order: Vec<String> = [
            q.dequeue_by_name("default").await.unwrap(),
            q.dequeue_by_name("default").await.unwrap(),
            q.dequeue_by_name("default").await.unwrap(),
        ]
        .iter()
        .map(|item| item.data().unwrap().id)
        .collect();
        assert_eq!(order, ["a", "c", "b"]);

        let err = q.dequeue_by_name("default").await.unwrap_err();
        assert!(matches!(err, Error::QueueEmpty(_)));
    }

    #[tokio::test]
    async fn dequeue_by_run_id_removes_all_matches() {
        let dir = tempfile::tempdir().unwrap();
        let q = store(&dir);

        for _ in 0..3 {
            q.enqueue("default", QueuePriority::Low, r("target")).await.unwrap();
        }
        q.enqueue("default", QueuePriority::Low, r("other")).await.unwrap();

        let removed = q
            .dequeue_by_dag_run_id("default", &r("target"))
            .await
            .unwrap();
        assert_eq!(removed.len(), 3);
        assert_eq!(q.len("default").await.unwrap(), 1);

        // Idempotent: nothing left to remove
        let removed = q
            .dequeue_by_dag_run_id("default", &r("target"))
            .await
            .unwrap();
        assert!(removed.is_empty());
    }

    #[tokio::test]
    async fn queues_are_isolated_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let q = store(&dir);

        q.enqueue("alpha", QueuePriority::Low, r("a")).await.unwrap();
        q.enqueue("beta", QueuePriority::High, r("b")).await.unwrap();

        assert_eq!(q.len("alpha").await.unwrap(), 1);
        assert_eq!(q.len("beta").await.unwrap(), 1);
        assert_eq!(q.dequeue_by_name("alpha").await.unwrap().data().unwrap().id, "a");
        assert!(matches!(
            q.dequeue_by_name("alpha").await.unwrap_err(),
            Error::QueueEmpty(_)
        ));

        let queues = q.queue_list().await.unwrap();
        assert_eq!(queues, ["beta"]);
    }

    #[tokio::test]
    async fn listing_is_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let q = store(&dir);
        for i in 0..5 {
            q.enqueue("default", QueuePriority::Low, r(&format!("run{i}")))
                .await
                .unwrap();
        }

        assert_eq!(q.list("default").await.unwrap().len(), 5);
        let page = q.list_paginated("default", 1, 2).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].data().unwrap().id, "run1");
        assert_eq!(q.len("default").await.unwrap(), 5);

        let by_dag = q.list_by_dag_name("default", "etl").await.unwrap();
        assert_eq!(by_dag.len(), 5);
        assert!(q.list_by_dag_name("default", "other").await.unwrap().is_empty());

        assert_eq!(q.all().await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn mutations_signal_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let q = store(&dir);
        let mut events = q.subscribe();
        let initial = *events.borrow_and_update();

        q.enqueue("default", QueuePriority::Low, r("a")).await.unwrap();
        events.changed().await.unwrap();
        assert_ne!(*events.borrow_and_update(), initial);

        q.dequeue_by_name("default").await.unwrap();
        events.changed().await.unwrap();
    }
}

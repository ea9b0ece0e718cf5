//! In-memory queue store for tests and single-process deployments

use async_trait::async_trait;
use dagflow_common::error::{Error, Result};
use dagflow_common::types::{DagRunRef, QueuePriority};
use dagflow_core::store::{QueueEvents, QueueStore, QueuedItem};
use parking_lot::Mutex;
use priority_queue::PriorityQueue;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

/// Pop order: High before Low, FIFO within a priority
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PriorityWrapper {
    priority: QueuePriority,
    seq: u64,
}

impl Ord for PriorityWrapper {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Numerically smaller priority pops first, then smaller sequence
        match other.priority.cmp(&self.priority) {
            std::cmp::Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

impl PartialOrd for PriorityWrapper {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
struct MemEntry {
    id: String,
    dag_run: DagRunRef,
}

#[derive(Default)]
struct QueueState {
    queue: PriorityQueue<String, PriorityWrapper>,
    data: HashMap<String, MemEntry>,
}

#[derive(Debug)]
pub struct MemQueuedItem {
    entry: MemEntry,
}

impl QueuedItem for MemQueuedItem {
    fn id(&self) -> String {
        self.entry.id.clone()
    }

    fn data(&self) -> Result<DagRunRef> {
        Ok(self.entry.dag_run.clone())
    }
}

#[derive(Default)]
struct Inner {
    queues: HashMap<String, QueueState>,
    seq: u64,
}

pub struct InMemoryQueueStore {
    inner: Mutex<Inner>,
    events_tx: Arc<watch::Sender<u64>>,
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        let (events_tx, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner::default()),
            events_tx: Arc::new(events_tx),
        }
    }

    fn notify_change(&self) {
        self.events_tx.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn items_in_order(state: &QueueState) -> Vec<MemEntry> {
        let mut pairs: Vec<_> = state
            .queue
            .iter()
            .map(|(id, wrapper)| (id.clone(), *wrapper))
            .collect();
        pairs.sort_by(|a, b| b.1.cmp(&a.1));
        pairs
            .into_iter()
            .filter_map(|(id, _)| state.data.get(&id).cloned())
            .collect()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn enqueue(
        &self,
        name: &str,
        priority: QueuePriority,
        dag_run: DagRunRef,
    ) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            inner.seq += 1;
            let wrapper = PriorityWrapper {
                priority,
                seq: inner.seq,
            };
            let id = Uuid::new_v4().simple().to_string();
            let state = inner.queues.entry(name.to_string()).or_default();
            state.data.insert(id.clone(), MemEntry { id: id.clone(), dag_run });
            state.queue.push(id, wrapper);
        }
        self.notify_change();
        Ok(())
    }

    async fn dequeue_by_name(&self, name: &str) -> Result<Box<dyn QueuedItem>> {
        let entry = {
            let mut inner = self.inner.lock();
            let state = inner
                .queues
                .get_mut(name)
                .ok_or_else(|| Error::QueueEmpty(name.to_string()))?;
            let (id, _) = state
                .queue
                .pop()
                .ok_or_else(|| Error::QueueEmpty(name.to_string()))?;
            state
                .data
                .remove(&id)
                .ok_or_else(|| Error::QueueItemNotFound(id))?
        };
        self.notify_change();
        Ok(Box::new(MemQueuedItem { entry }))
    }

    async fn dequeue_by_dag_run_id(
        &self,
        name: &str,
        dag_run: &DagRunRef,
    ) -> Result<Vec<Box<dyn QueuedItem>>> {
        let removed: Vec<MemEntry> = {
            let mut inner = self.inner.lock();
            let Some(state) = inner.queues.get_mut(name) else {
                return Ok(Vec::new());
            };
            let ids: Vec<String> = state
                .data
                .values()
                .filter(|e| e.dag_run == *dag_run)
                .map(|e| e.id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| {
                    state.queue.remove(&id);
                    state.data.remove(&id)
                })
                .collect()
        };
        if !removed.is_empty() {
            self.notify_change();
        }
        Ok(removed
            .into_iter()
            .map(|entry| Box::new(MemQueuedItem { entry }) as Box<dyn QueuedItem>)
            .collect())
    }

    async fn len(&self, name: &str) -> Result<usize> {
        Ok(self
            .inner
            .lock()
            .queues
            .get(name)
            .map_or(0, |s| s.queue.len()))
    }

    async fn list(&self, name: &str) -> Result<Vec<Box<dyn QueuedItem>>> {
        let inner = self.inner.lock();
        Ok(inner.queues.get(name).map_or_else(Vec::new, |state| {
            Self::items_in_order(state)
                .into_iter()
                .map(|entry| Box::new(MemQueuedItem { entry }) as Box<dyn QueuedItem>)
                .collect()
        }))
    }

    async fn list_paginated(
        &self,
        name: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Box<dyn QueuedItem>>> {
        let mut items = self.list(name).await?;
        let items = items.drain(..).skip(offset).take(limit).collect();
        Ok(items)
    }

    async fn list_by_dag_name(
        &self,
        name: &str,
        dag_name: &str,
    ) -> Result<Vec<Box<dyn QueuedItem>>> {
        let mut items = self.list(name).await?;
        items.retain(|item| {
            item.data()
                .map(|dag_run| dag_run.name == dag_name)
                .unwrap_or(false)
        });
        Ok(items)
    }

    async fn all(&self) -> Result<Vec<Box<dyn QueuedItem>>> {
        let names: Vec<String> = self.inner.lock().queues.keys().cloned().collect();
        let mut items = Vec::new();
        for name in names {
            items.extend(self.list(&name).await?);
        }
        Ok(items)
    }

    async fn queue_list(&self) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        let mut names: Vec<String> = inner
            .queues
            .iter()
            .filter(|(_, s)| !s.queue.is_empty())
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    fn subscribe(&self) -> QueueEvents {
        self.events_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(id: &str) -> DagRunRef {
        DagRunRef::new("etl", id)
    }

    #[tokio::test]
    async fn strict_priority_ordering() {
        let q = InMemoryQueueStore::new();
        q.enqueue("default", QueuePriority::Low, r("low1")).await.unwrap();
        q.enqueue("default", QueuePriority::Low, r("low2")).await.unwrap();
        q.enqueue("default", QueuePriority::High, r("high1")).await.unwrap();

        // A Low item must never surface while any High item is queued
        assert_eq!(
            q.dequeue_by_name("default").await.unwrap().data().unwrap().id,
            "high1"
        );
        assert_eq!(
            q.dequeue_by_name("default").await.unwrap().data().unwrap().id,
            "low1"
        );
        assert_eq!(
            q.dequeue_by_name("default").await.unwrap().data().unwrap().id,
            "low2"
        );
    }

    #[tokio::test]
    async fn list_matches_dequeue_order() {
        let q = InMemoryQueueStore::new();
        q.enqueue("default", QueuePriority::Low, r("b")).await.unwrap();
        q.enqueue("default", QueuePriority::High, r("a")).await.unwrap();

        let listed: Vec<String> = q
            .list("default")
            .await
            .unwrap()
            .iter()
            .map(|i| i.data().unwrap().id)
            .collect();
        assert_eq!(listed, ["a", "b"]);
    }

    #[tokio::test]
    async fn targeted_dequeue_is_idempotent() {
        let q = InMemoryQueueStore::new();
        for _ in 0..3 {
            q.enqueue("default", QueuePriority::Low, r("x")).await.unwrap();
        }
        assert_eq!(
            q.dequeue_by_dag_run_id("default", &r("x")).await.unwrap().len(),
            3
        );
        assert_eq!(q.len("default").await.unwrap(), 0);
        assert!(q
            .dequeue_by_dag_run_id("default", &r("x"))
            .await
            .unwrap()
            .is_empty());
    }
}

//! File-backed service registry with heartbeat leases

use crate::fsutil::{atomic_write_json, read_json};
use async_trait::async_trait;
use dagflow_common::error::{Error, Result};
use dagflow_common::keys::sanitize_for_filename;
use dagflow_common::timeutil::TimeInUtc;
use dagflow_common::types::{HostInfo, HostStatus, ServiceRole};
use dagflow_core::registry::ServiceRegistry;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

const SERVICES_DIR: &str = "services";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistrationRecord {
    host: HostInfo,
    heartbeat_at: TimeInUtc,
}

/// One JSON file per registered host under `services/{role}/{host_id}.json`.
/// A host whose heartbeat is older than the TTL is reported Inactive and
/// filtered from member lookups.
pub struct FileServiceRegistry {
    services_root: PathBuf,
    ttl: Duration,
}

impl FileServiceRegistry {
    pub fn new(data_dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            services_root: data_dir.into().join(SERVICES_DIR),
            ttl,
        }
    }

    fn role_dir(&self, role: ServiceRole) -> PathBuf {
        self.services_root.join(role.as_str())
    }

    fn host_path(&self, role: ServiceRole, host_id: &str) -> PathBuf {
        self.role_dir(role)
            .join(format!("{}.json", sanitize_for_filename(host_id)))
    }

    fn is_fresh(&self, record: &RegistrationRecord, now: TimeInUtc) -> bool {
        let age_millis = now.epoch_millis() - record.heartbeat_at.epoch_millis();
        age_millis >= 0 && (age_millis as u128) <= self.ttl.as_millis()
    }

    async fn records(&self, role: ServiceRole) -> Result<Vec<RegistrationRecord>> {
        let dir = self.role_dir(role);
        let mut records = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<RegistrationRecord>(&path).await {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable registration");
                }
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl ServiceRegistry for FileServiceRegistry {
    async fn register(&self, role: ServiceRole, mut host: HostInfo) -> Result<()> {
        if host.id.is_empty() {
            return Err(Error::Validation("host id must not be empty".to_string()));
        }
        let now = TimeInUtc::now();
        host.status = HostStatus::Active;
        if host.started_at.is_none() {
            host.started_at = Some(now);
        }
        let record = RegistrationRecord {
            host: host.clone(),
            heartbeat_at: now,
        };
        atomic_write_json(&self.host_path(role, &host.id), &record).await
    }

    async fn heartbeat(&self, role: ServiceRole, host_id: &str) -> Result<()> {
        let path = self.host_path(role, host_id);
        let mut record: RegistrationRecord = match read_json(&path).await {
            Ok(record) => record,
            Err(e) if matches!(e.root(), Error::Io(_)) => {
                return Err(Error::Internal(format!(
                    "heartbeat for unregistered host {host_id} in role {}",
                    role.as_str()
                )));
            }
            Err(e) => return Err(e),
        };
        record.heartbeat_at = TimeInUtc::now();
        record.host.status = HostStatus::Active;
        atomic_write_json(&path, &record).await
    }

    async fn unregister(&self, role: ServiceRole, host_id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.host_path(role, host_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_service_members(&self, role: ServiceRole) -> Result<Vec<HostInfo>> {
        let now = TimeInUtc::now();
        let mut members: Vec<HostInfo> = self
            .records(role)
            .await?
            .into_iter()
            .filter(|r| self.is_fresh(r, now))
            .map(|r| r.host)
            .collect();
        members.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(members)
    }

    async fn is_leader(&self, role: ServiceRole, host_id: &str) -> Result<bool> {
        let now = TimeInUtc::now();
        let mut active: Vec<HostInfo> = self
            .records(role)
            .await?
            .into_iter()
            .filter(|r| self.is_fresh(r, now))
            .map(|r| r.host)
            .collect();
        // Oldest registration leads; ties break on lexical host id
        active.sort_by(|a, b| {
            let a_key = a.started_at.map(TimeInUtc::epoch_millis).unwrap_or(i64::MAX);
            let b_key = b.started_at.map(TimeInUtc::epoch_millis).unwrap_or(i64::MAX);
            a_key.cmp(&b_key).then_with(|| a.id.cmp(&b.id))
        });
        Ok(active.first().map(|h| h.id == host_id).unwrap_or(false))
    }
}

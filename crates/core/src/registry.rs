//! Service registry contract

use async_trait::async_trait;
use dagflow_common::error::Result;
use dagflow_common::types::{HostInfo, ServiceRole};

/// Registration and discovery of scheduler/coordinator/worker hosts.
///
/// Heartbeats refresh a host's lease; members whose lease is older than the
/// configured TTL are reported Inactive and filtered from
/// `get_service_members`.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Register (or re-register) a host under a role
    async fn register(&self, role: ServiceRole, host: HostInfo) -> Result<()>;

    /// Refresh the host's lease
    async fn heartbeat(&self, role: ServiceRole, host_id: &str) -> Result<()>;

    async fn unregister(&self, role: ServiceRole, host_id: &str) -> Result<()>;

    /// Active members of a role
    async fn get_service_members(&self, role: ServiceRole) -> Result<Vec<HostInfo>>;

    /// Whether the given host currently leads the role.
    ///
    /// The oldest active registration wins; ties break on lexical host id.
    async fn is_leader(&self, role: ServiceRole, host_id: &str) -> Result<bool>;
}

//! Storage capability consumed by the control plane.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{CloudInstance, DedicatedHost, InstanceFilters};

/// Durable persistence for cloud instances and dedicated hosts.
///
/// Implementations must return [`crate::CloudError::InstanceNotFound`] /
/// [`crate::CloudError::HostNotFound`] on lookup misses and follow
/// last-writer-wins semantics for concurrent updates. The one exception is
/// [`Self::claim_dedicated_host`], which must be conditional so that two
/// concurrent claims cannot both win the same host.
#[async_trait]
pub trait CloudStore: Send + Sync {
    async fn create_cloud_instance(&self, instance: &CloudInstance) -> Result<()>;

    async fn get_cloud_instance(&self, id: &str) -> Result<CloudInstance>;

    async fn get_cloud_instance_by_agent_node(&self, agent_node_id: &str) -> Result<CloudInstance>;

    async fn update_cloud_instance(&self, instance: &CloudInstance) -> Result<()>;

    /// Removes the record entirely; distinct from terminating the instance.
    async fn delete_cloud_instance(&self, id: &str) -> Result<()>;

    /// Results are ordered by `created_at` descending.
    async fn list_cloud_instances(&self, filters: &InstanceFilters) -> Result<Vec<CloudInstance>>;

    /// Counts a team's instances, excluding `terminated` and `failed`.
    async fn count_cloud_instances_by_team(&self, team_id: &str) -> Result<i64>;

    async fn create_dedicated_host(&self, host: &DedicatedHost) -> Result<()>;

    async fn get_dedicated_host(&self, id: &str) -> Result<DedicatedHost>;

    /// Lookup by provider-native host id.
    async fn get_dedicated_host_by_host_id(&self, host_id: &str) -> Result<DedicatedHost>;

    async fn update_dedicated_host(&self, host: &DedicatedHost) -> Result<()>;

    async fn list_dedicated_hosts(&self) -> Result<Vec<DedicatedHost>>;

    /// The available host with the oldest `updated_at`, or
    /// [`crate::CloudError::NoAvailableHost`].
    async fn get_available_dedicated_host(&self) -> Result<DedicatedHost>;

    /// Atomically claims a host for an instance: transitions it from
    /// `available` to `allocated`, stamps `current_instance_id` and
    /// `allocated_at`. Returns false when the host was no longer available
    /// (lost race), so callers can retry with another host.
    async fn claim_dedicated_host(
        &self,
        id: &str,
        instance_id: &str,
        allocated_at: DateTime<Utc>,
    ) -> Result<bool>;
}

//! The provisioner capability implemented by each compute backend.

use async_trait::async_trait;
use nimbus_core::{
    CloudInstance, CommandResult, ConnectionInfo, InstanceFilters, ProvisionRequest, Result,
};

/// Backend-specific adapter over a concrete compute platform.
///
/// The manager assigns the instance id before dispatch; implementations tag
/// the backend resource with it and pre-flight for an existing resource
/// carrying the same id, so a re-issued create with the same id never
/// launches a second backend instance.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Short provider identifier, e.g. `"container"` or `"iaas"`.
    fn provider_name(&self) -> &'static str;

    /// Allocates backend resources and returns the initial instance record
    /// in state `provisioning`.
    async fn create_instance(
        &self,
        request: &ProvisionRequest,
        instance_id: &str,
    ) -> Result<CloudInstance>;

    /// Current backend state, mapped to the canonical state enum.
    async fn get_instance(&self, instance_id: &str) -> Result<CloudInstance>;

    async fn list_instances(&self, filters: &InstanceFilters) -> Result<Vec<CloudInstance>>;

    /// Starts a stopped instance. Backends without a stopped state fail
    /// with an unsupported-operation error.
    async fn start_instance(&self, instance_id: &str) -> Result<()>;

    async fn stop_instance(&self, instance_id: &str) -> Result<()>;

    /// Irreversibly destroys the backend resource.
    async fn terminate_instance(&self, instance_id: &str) -> Result<()>;

    async fn get_connection_info(&self, instance_id: &str) -> Result<ConnectionInfo>;

    async fn execute_command(&self, instance_id: &str, command: &str) -> Result<CommandResult>;

    async fn get_logs(&self, instance_id: &str, lines: usize) -> Result<String>;
}

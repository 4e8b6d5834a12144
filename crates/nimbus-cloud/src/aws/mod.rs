//! IaaS backend: Windows and macOS VMs on EC2.

pub mod client;
mod macos;
pub mod ssm;
pub mod userdata;
mod windows;

use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_ec2::types::{Filter, Instance as Ec2Instance, InstanceStateName, Tag};
use nimbus_core::{
    CloudError, CloudInstance, CloudStore, CommandResult, ConnectionInfo, ConnectionProtocol,
    IaasConfig, InstanceFilters, InstanceState, Platform, ProvisionRequest, Result, PROVIDER_IAAS,
};
use tracing::{info, warn};

pub use client::AwsClients;

use crate::hosts::HostAllocator;
use crate::provisioner::Provisioner;

const TAG_NAME: &str = "Name";
const TAG_INSTANCE: &str = "nimbus.dev/cloud-instance";
const TAG_PLATFORM: &str = "nimbus.dev/platform";
const TAG_TEAM: &str = "nimbus.dev/team";
const TAG_BOT_PACKAGE: &str = "nimbus.dev/bot-package";
const TAG_DEDICATED_HOST: &str = "nimbus.dev/dedicated-host";
const TAG_PREFIX: &str = "nimbus.dev/tag-";

/// Provisions Windows and macOS VM instances.
pub struct AwsProvisioner {
    clients: AwsClients,
    config: IaasConfig,
    hosts: HostAllocator,
    store: Arc<dyn CloudStore>,
    server_url: String,
    api_key: String,
}

impl AwsProvisioner {
    pub async fn new(
        config: IaasConfig,
        store: Arc<dyn CloudStore>,
        server_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        let clients = AwsClients::new(&config.region).await;
        let hosts = HostAllocator::new(store.clone(), config.macos.min_host_allocation());

        Self {
            clients,
            config,
            hosts,
            store,
            server_url: server_url.into(),
            api_key: api_key.into(),
        }
    }

    /// Seeds configured dedicated host ids into the store.
    pub async fn seed_hosts(&self) -> Result<()> {
        self.hosts
            .seed(&self.config.macos.dedicated_host_ids, &self.config.macos.instance_type)
            .await
    }

    /// Finds the VM tagged with the given cloud instance id, among states
    /// the backend still knows about.
    async fn describe_instance_by_tag(&self, instance_id: &str) -> Result<Ec2Instance> {
        let out = self
            .clients
            .ec2
            .describe_instances()
            .filters(
                Filter::builder()
                    .name(format!("tag:{TAG_INSTANCE}"))
                    .values(instance_id)
                    .build(),
            )
            .filters(
                Filter::builder()
                    .name("instance-state-name")
                    .values("pending")
                    .values("running")
                    .values("stopping")
                    .values("stopped")
                    .build(),
            )
            .send()
            .await
            .map_err(|e| CloudError::Provider(format!("failed to describe instances: {e}")))?;

        out.reservations()
            .iter()
            .flat_map(|r| r.instances())
            .next()
            .cloned()
            .ok_or(CloudError::InstanceNotFound)
    }

    fn instance_to_cloud(&self, ec2_instance: &Ec2Instance, instance_id: &str) -> CloudInstance {
        let tags = ec2_instance.tags();

        let platform = tag_value(tags, TAG_PLATFORM)
            .and_then(|v| v.parse().ok())
            .unwrap_or(Platform::Windows);

        let mut instance = CloudInstance::new(instance_id, platform, PROVIDER_IAAS);
        instance.state = ec2_state(ec2_instance);
        instance.instance_id = ec2_instance.instance_id().unwrap_or_default().to_string();
        instance.instance_type = ec2_instance
            .instance_type()
            .map(|t| t.as_str().to_string())
            .unwrap_or_default();
        instance.region = self.config.region.clone();
        instance.public_ip = ec2_instance.public_ip_address().unwrap_or_default().to_string();
        instance.private_ip = ec2_instance.private_ip_address().unwrap_or_default().to_string();
        instance.team_id = tag_value(tags, TAG_TEAM).unwrap_or_default().to_string();
        instance.bot_package = tag_value(tags, TAG_BOT_PACKAGE).unwrap_or_default().to_string();
        instance.dedicated_host_id =
            tag_value(tags, TAG_DEDICATED_HOST).unwrap_or_default().to_string();
        instance
    }

    /// Common tags stamped on every launched VM.
    fn base_tags(&self, request: &ProvisionRequest, instance_id: &str, name: &str) -> Vec<Tag> {
        let mut tags = vec![
            tag(TAG_NAME, name),
            tag(TAG_INSTANCE, instance_id),
            tag(TAG_PLATFORM, request.platform.as_str()),
            tag(TAG_TEAM, &request.team_id),
            tag(TAG_BOT_PACKAGE, &request.bot_package),
        ];
        for (k, v) in &request.tags {
            tags.push(tag(format!("{TAG_PREFIX}{k}"), v));
        }
        tags
    }

    fn platform_of(&self, ec2_instance: &Ec2Instance) -> Platform {
        tag_value(ec2_instance.tags(), TAG_PLATFORM)
            .and_then(|v| v.parse().ok())
            .unwrap_or(Platform::Linux)
    }
}

#[async_trait]
impl Provisioner for AwsProvisioner {
    fn provider_name(&self) -> &'static str {
        PROVIDER_IAAS
    }

    async fn create_instance(
        &self,
        request: &ProvisionRequest,
        instance_id: &str,
    ) -> Result<CloudInstance> {
        // A retried create with the same id must not launch a second VM.
        if self.describe_instance_by_tag(instance_id).await.is_ok() {
            return Err(CloudError::InstanceAlreadyExists(instance_id.to_string()));
        }

        match request.platform {
            Platform::Windows => self.launch_windows(request, instance_id).await,
            Platform::MacOs => self.launch_macos(request, instance_id).await,
            other => Err(CloudError::InvalidPlatform(format!(
                "iaas provisioner does not support platform {other}"
            ))),
        }
    }

    async fn get_instance(&self, instance_id: &str) -> Result<CloudInstance> {
        let ec2_instance = self.describe_instance_by_tag(instance_id).await?;
        Ok(self.instance_to_cloud(&ec2_instance, instance_id))
    }

    async fn list_instances(&self, filters: &InstanceFilters) -> Result<Vec<CloudInstance>> {
        if filters.provider.as_deref().is_some_and(|p| p != PROVIDER_IAAS) {
            return Ok(Vec::new());
        }

        let mut request = self.clients.ec2.describe_instances().filters(
            Filter::builder().name("tag-key").values(TAG_INSTANCE).build(),
        );
        if let Some(team_id) = &filters.team_id {
            request = request.filters(
                Filter::builder().name(format!("tag:{TAG_TEAM}")).values(team_id).build(),
            );
        }
        if let Some(platform) = filters.platform {
            request = request.filters(
                Filter::builder()
                    .name(format!("tag:{TAG_PLATFORM}"))
                    .values(platform.as_str())
                    .build(),
            );
        }

        let out = request
            .send()
            .await
            .map_err(|e| CloudError::Provider(format!("failed to describe instances: {e}")))?;

        let mut instances = Vec::new();
        for ec2_instance in out.reservations().iter().flat_map(|r| r.instances()) {
            let Some(instance_id) = tag_value(ec2_instance.tags(), TAG_INSTANCE) else {
                continue;
            };
            let instance = self.instance_to_cloud(ec2_instance, instance_id);
            if filters.state.is_some_and(|s| instance.state != s) {
                continue;
            }
            instances.push(instance);
        }

        Ok(instances)
    }

    async fn start_instance(&self, instance_id: &str) -> Result<()> {
        let ec2_instance = self.describe_instance_by_tag(instance_id).await?;
        let ec2_id = ec2_instance.instance_id().unwrap_or_default().to_string();

        self.clients
            .ec2
            .start_instances()
            .instance_ids(&ec2_id)
            .send()
            .await
            .map_err(|e| CloudError::Provider(format!("failed to start instance {ec2_id}: {e}")))?;

        info!(ec2_id, instance_id, "VM started");
        Ok(())
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<()> {
        let ec2_instance = self.describe_instance_by_tag(instance_id).await?;
        let ec2_id = ec2_instance.instance_id().unwrap_or_default().to_string();

        self.clients
            .ec2
            .stop_instances()
            .instance_ids(&ec2_id)
            .send()
            .await
            .map_err(|e| CloudError::Provider(format!("failed to stop instance {ec2_id}: {e}")))?;

        info!(ec2_id, instance_id, "VM stopped");
        Ok(())
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        let ec2_instance = self.describe_instance_by_tag(instance_id).await?;
        let ec2_id = ec2_instance.instance_id().unwrap_or_default().to_string();

        self.clients
            .ec2
            .terminate_instances()
            .instance_ids(&ec2_id)
            .send()
            .await
            .map_err(|e| CloudError::Provider(format!("failed to terminate instance {ec2_id}: {e}")))?;

        // Hand the dedicated host back. Inside the minimum allocation
        // period the host is only detached; the monitor releases it once
        // the idle threshold passes.
        if let Some(host_id) = tag_value(ec2_instance.tags(), TAG_DEDICATED_HOST) {
            match self.store.get_dedicated_host_by_host_id(host_id).await {
                Ok(host) => match self.hosts.release(&host.id).await {
                    Ok(()) => {}
                    Err(CloudError::HostMinAllocation) => {
                        if let Err(e) = self.hosts.detach(&host.id).await {
                            warn!(host_id, error = %e, "failed to detach dedicated host");
                        }
                    }
                    Err(e) => warn!(host_id, error = %e, "failed to release dedicated host"),
                },
                Err(e) => warn!(host_id, error = %e, "dedicated host record missing"),
            }
        }

        info!(ec2_id, instance_id, "VM terminated");
        Ok(())
    }

    async fn get_connection_info(&self, instance_id: &str) -> Result<ConnectionInfo> {
        let ec2_instance = self.describe_instance_by_tag(instance_id).await?;
        let ec2_id = ec2_instance.instance_id().unwrap_or_default().to_string();

        let mut address = ec2_instance.public_ip_address().unwrap_or_default();
        if address.is_empty() {
            address = ec2_instance.private_ip_address().unwrap_or_default();
        }

        match self.platform_of(&ec2_instance) {
            Platform::Windows => self.windows_connection_info(&ec2_id, address).await,
            Platform::MacOs => Ok(self.macos_connection_info(&ec2_id, address)),
            _ => {
                let mut info = ConnectionInfo::new(ConnectionProtocol::Ssm, address);
                info.extra = ssm::connection_extra(&ec2_id, &self.config.region);
                Ok(info)
            }
        }
    }

    async fn execute_command(&self, instance_id: &str, command: &str) -> Result<CommandResult> {
        let ec2_instance = self.describe_instance_by_tag(instance_id).await?;
        let ec2_id = ec2_instance.instance_id().unwrap_or_default().to_string();
        let platform = self.platform_of(&ec2_instance);

        match ssm::run_command(&self.clients.ssm, &ec2_id, command, platform).await {
            Ok(stdout) => Ok(CommandResult {
                exit_code: 0,
                stdout,
                stderr: String::new(),
            }),
            Err(e) => Ok(CommandResult {
                exit_code: 1,
                stdout: String::new(),
                stderr: e.to_string(),
            }),
        }
    }

    async fn get_logs(&self, instance_id: &str, lines: usize) -> Result<String> {
        let ec2_instance = self.describe_instance_by_tag(instance_id).await?;
        let ec2_id = ec2_instance.instance_id().unwrap_or_default().to_string();
        let platform = self.platform_of(&ec2_instance);

        let command = match platform {
            Platform::Windows => format!(
                "Get-Content 'C:\\ProgramData\\nimbus-agent\\agent.log' -Tail {lines} -ErrorAction SilentlyContinue"
            ),
            _ => format!(
                "tail -n {lines} /var/log/nimbus-agent.log 2>/dev/null || journalctl -n {lines} -u nimbus-agent 2>/dev/null || echo 'No logs found'"
            ),
        };

        ssm::run_command(&self.clients.ssm, &ec2_id, &command, platform).await
    }
}

fn tag(key: impl Into<String>, value: impl Into<String>) -> Tag {
    Tag::builder().key(key).value(value).build()
}

fn tag_value<'a>(tags: &'a [Tag], key: &str) -> Option<&'a str> {
    tags.iter()
        .find(|t| t.key() == Some(key))
        .and_then(|t| t.value())
}

/// Maps the VM lifecycle state to the canonical instance state.
fn ec2_state(instance: &Ec2Instance) -> InstanceState {
    match instance.state().and_then(|s| s.name()) {
        Some(InstanceStateName::Pending) => InstanceState::Provisioning,
        Some(InstanceStateName::Running) => InstanceState::Running,
        Some(InstanceStateName::Stopping) | Some(InstanceStateName::Stopped) => {
            InstanceState::Stopped
        }
        Some(InstanceStateName::ShuttingDown) | Some(InstanceStateName::Terminated) => {
            InstanceState::Terminated
        }
        _ => InstanceState::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_ec2::types::InstanceState as Ec2InstanceState;

    fn instance_in(state: InstanceStateName) -> Ec2Instance {
        Ec2Instance::builder()
            .state(Ec2InstanceState::builder().name(state).build())
            .build()
    }

    #[test]
    fn state_mapping() {
        assert_eq!(
            ec2_state(&instance_in(InstanceStateName::Pending)),
            InstanceState::Provisioning
        );
        assert_eq!(
            ec2_state(&instance_in(InstanceStateName::Running)),
            InstanceState::Running
        );
        assert_eq!(
            ec2_state(&instance_in(InstanceStateName::Stopping)),
            InstanceState::Stopped
        );
        assert_eq!(
            ec2_state(&instance_in(InstanceStateName::Stopped)),
            InstanceState::Stopped
        );
        assert_eq!(
            ec2_state(&instance_in(InstanceStateName::ShuttingDown)),
            InstanceState::Terminated
        );
        assert_eq!(
            ec2_state(&instance_in(InstanceStateName::Terminated)),
            InstanceState::Terminated
        );
        assert_eq!(ec2_state(&Ec2Instance::builder().build()), InstanceState::Failed);
    }

    #[test]
    fn tag_lookup() {
        let tags = vec![tag(TAG_PLATFORM, "macos"), tag(TAG_TEAM, "team-a")];
        assert_eq!(tag_value(&tags, TAG_PLATFORM), Some("macos"));
        assert_eq!(tag_value(&tags, TAG_TEAM), Some("team-a"));
        assert_eq!(tag_value(&tags, "missing"), None);
    }
}

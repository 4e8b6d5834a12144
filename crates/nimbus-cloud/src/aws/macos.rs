//! macOS VM launches on dedicated hosts.

use aws_sdk_ec2::types::{
    IamInstanceProfileSpecification, Placement, ResourceType, TagSpecification,
};
use nimbus_core::{
    CloudError, CloudInstance, ConnectionInfo, ConnectionProtocol, InstanceState, Platform,
    ProvisionRequest, Result, PROVIDER_IAAS,
};
use tracing::{info, warn};

use super::{ssm, userdata, AwsProvisioner};

impl AwsProvisioner {
    /// Launches a macOS VM. The dedicated host is acquired first and rolled
    /// back if the launch itself fails.
    pub(super) async fn launch_macos(
        &self,
        request: &ProvisionRequest,
        instance_id: &str,
    ) -> Result<CloudInstance> {
        let cfg = &self.config.macos;

        let host = self.hosts.acquire(instance_id).await?;

        let user_data = userdata::render(
            Platform::MacOs,
            &userdata::UserDataParams {
                control_plane_url: &self.server_url,
                api_key: &self.api_key,
                instance_id,
                bot_package: &request.bot_package,
                bot_version: &request.bot_version,
            },
        );

        let short_id: String = instance_id.chars().take(8).collect();
        let mut tags = self.base_tags(request, instance_id, &format!("nimbus-mac-bot-{short_id}"));
        tags.push(super::tag(super::TAG_DEDICATED_HOST, &host.host_id));

        let mut launch = self
            .clients
            .ec2
            .run_instances()
            .image_id(&cfg.ami_id)
            .instance_type(cfg.instance_type.as_str().into())
            .min_count(1)
            .max_count(1)
            .user_data(user_data)
            .placement(Placement::builder().host_id(&host.host_id).build())
            .tag_specifications(
                TagSpecification::builder()
                    .resource_type(ResourceType::Instance)
                    .set_tags(Some(tags))
                    .build(),
            );

        if let Some(subnet) = self.config.subnet_ids.first() {
            launch = launch.subnet_id(subnet);
        }
        if !self.config.security_group_id.is_empty() {
            launch = launch.security_group_ids(&self.config.security_group_id);
        }
        if !self.config.instance_profile.is_empty() {
            launch = launch.iam_instance_profile(
                IamInstanceProfileSpecification::builder()
                    .name(&self.config.instance_profile)
                    .build(),
            );
        }

        let out = match launch.send().await {
            Ok(out) => out,
            Err(e) => {
                // The claim is minutes old; hand the host straight back.
                if let Err(rollback_err) = self.hosts.rollback(&host.id).await {
                    warn!(host_id = %host.host_id, error = %rollback_err, "failed to roll back host claim");
                }
                return Err(CloudError::ProvisioningFailed {
                    instance_id: instance_id.to_string(),
                    platform: Platform::MacOs,
                    provider: PROVIDER_IAAS.to_string(),
                    message: e.to_string(),
                });
            }
        };

        let ec2_id = out
            .instances()
            .first()
            .and_then(|i| i.instance_id())
            .unwrap_or_default()
            .to_string();
        info!(ec2_id, instance_id, host_id = %host.host_id, "macOS VM launched on dedicated host");

        let mut instance = CloudInstance::new(instance_id, Platform::MacOs, PROVIDER_IAAS);
        instance.state = InstanceState::Provisioning;
        instance.instance_id = ec2_id;
        instance.instance_type = cfg.instance_type.clone();
        instance.image_id = cfg.ami_id.clone();
        instance.region = self.config.region.clone();
        instance.bot_package = request.bot_package.clone();
        instance.bot_version = request.bot_version.clone();
        instance.team_id = request.team_id.clone();
        instance.dedicated_host_id = host.host_id.clone();
        instance.tags = request.tags.clone();
        Ok(instance)
    }

    /// VNC connection details for a macOS instance.
    pub(super) fn macos_connection_info(&self, ec2_id: &str, address: &str) -> ConnectionInfo {
        let mut info = ConnectionInfo::new(ConnectionProtocol::Vnc, address);
        info.port = 5900;
        info.extra = ssm::connection_extra(ec2_id, &self.config.region);
        info.extra
            .insert("vnc_url".to_string(), format!("vnc://{address}:5900"));
        info
    }
}

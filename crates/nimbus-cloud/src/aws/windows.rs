//! Windows VM launches.

use aws_sdk_ec2::types::{IamInstanceProfileSpecification, ResourceType, TagSpecification};
use nimbus_core::{
    CloudError, CloudInstance, ConnectionInfo, ConnectionProtocol, InstanceState, Platform,
    ProvisionRequest, Result, PROVIDER_IAAS,
};
use tracing::info;

use super::{ssm, userdata, AwsProvisioner};

impl AwsProvisioner {
    pub(super) async fn launch_windows(
        &self,
        request: &ProvisionRequest,
        instance_id: &str,
    ) -> Result<CloudInstance> {
        let cfg = &self.config.windows;

        let instance_type = if request.instance_type.is_empty() {
            cfg.default_instance_type.clone()
        } else {
            request.instance_type.clone()
        };

        let user_data = userdata::render(
            Platform::Windows,
            &userdata::UserDataParams {
                control_plane_url: &self.server_url,
                api_key: &self.api_key,
                instance_id,
                bot_package: &request.bot_package,
                bot_version: &request.bot_version,
            },
        );

        let short_id: String = instance_id.chars().take(8).collect();
        let tags = self.base_tags(request, instance_id, &format!("nimbus-bot-{short_id}"));

        let mut launch = self
            .clients
            .ec2
            .run_instances()
            .image_id(&cfg.ami_id)
            .instance_type(instance_type.as_str().into())
            .min_count(1)
            .max_count(1)
            .user_data(user_data)
            // The key pair makes the encrypted administrator password
            // retrievable after first boot.
            .key_name(&cfg.key_pair)
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

        let out = launch.send().await.map_err(|e| CloudError::ProvisioningFailed {
            instance_id: instance_id.to_string(),
            platform: Platform::Windows,
            provider: PROVIDER_IAAS.to_string(),
            message: e.to_string(),
        })?;

        let ec2_id = out
            .instances()
            .first()
            .and_then(|i| i.instance_id())
            .unwrap_or_default()
            .to_string();
        info!(ec2_id, instance_id, instance_type, "Windows VM launched");

        let mut instance = CloudInstance::new(instance_id, Platform::Windows, PROVIDER_IAAS);
        instance.state = InstanceState::Provisioning;
        instance.instance_id = ec2_id;
        instance.instance_type = instance_type;
        instance.image_id = cfg.ami_id.clone();
        instance.region = self.config.region.clone();
        instance.bot_package = request.bot_package.clone();
        instance.bot_version = request.bot_version.clone();
        instance.team_id = request.team_id.clone();
        instance.tags = request.tags.clone();
        Ok(instance)
    }

    /// RDP connection details, including the encrypted administrator
    /// password when the backend has it ready. The blob can only be
    /// decrypted client-side with the key pair's private key.
    pub(super) async fn windows_connection_info(
        &self,
        ec2_id: &str,
        address: &str,
    ) -> Result<ConnectionInfo> {
        let mut info = ConnectionInfo::new(ConnectionProtocol::Rdp, address);
        info.port = 3389;
        info.username = "Administrator".to_string();
        info.extra = ssm::connection_extra(ec2_id, &self.config.region);

        if let Ok(out) = self
            .clients
            .ec2
            .get_password_data()
            .instance_id(ec2_id)
            .send()
            .await
        {
            let password_data = out.password_data().unwrap_or_default().trim();
            if !password_data.is_empty() {
                info.extra
                    .insert("encrypted_password".to_string(), password_data.to_string());
            }
        }

        Ok(info)
    }
}

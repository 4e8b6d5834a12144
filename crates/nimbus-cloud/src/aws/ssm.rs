//! Remote command execution over the managed-instance channel.

use std::collections::HashMap;
use std::time::Duration;

use aws_sdk_ssm::types::{CommandInvocationStatus, InstanceInformationStringFilter, PingStatus};
use nimbus_core::{CloudError, Platform, Result};
use tracing::debug;

/// How often the command invocation is polled, and for how many rounds.
/// Together they bound an exec at roughly two minutes.
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const POLL_ROUNDS: usize = 60;

fn document_for(platform: Platform) -> &'static str {
    match platform {
        Platform::Windows => "AWS-RunPowerShellScript",
        _ => "AWS-RunShellScript",
    }
}

/// Sends a command to an instance and polls for its result.
pub async fn run_command(
    ssm: &aws_sdk_ssm::Client,
    ec2_id: &str,
    command: &str,
    platform: Platform,
) -> Result<String> {
    let out = ssm
        .send_command()
        .instance_ids(ec2_id)
        .document_name(document_for(platform))
        .parameters("commands", vec![command.to_string()])
        .timeout_seconds(120)
        .send()
        .await
        .map_err(|e| CloudError::Provider(format!("remote command dispatch failed: {e}")))?;

    let command_id = out
        .command()
        .and_then(|c| c.command_id())
        .ok_or_else(|| CloudError::Provider("remote command returned no id".to_string()))?
        .to_string();

    debug!(command_id, instance = ec2_id, "remote command sent");

    for _ in 0..POLL_ROUNDS {
        tokio::time::sleep(POLL_INTERVAL).await;

        let invocation = match ssm
            .get_command_invocation()
            .command_id(&command_id)
            .instance_id(ec2_id)
            .send()
            .await
        {
            Ok(invocation) => invocation,
            // The invocation record may not exist yet.
            Err(_) => continue,
        };

        match invocation.status() {
            Some(CommandInvocationStatus::Success) => {
                return Ok(invocation.standard_output_content().unwrap_or_default().to_string());
            }
            Some(
                status @ (CommandInvocationStatus::Failed
                | CommandInvocationStatus::TimedOut
                | CommandInvocationStatus::Cancelled),
            ) => {
                let stderr = invocation.standard_error_content().unwrap_or_default();
                return Err(CloudError::Provider(format!(
                    "remote command {}: {stderr}",
                    status.as_str()
                )));
            }
            _ => {}
        }
    }

    Err(CloudError::Provider(
        "remote command timed out waiting for result".to_string(),
    ))
}

/// Whether the instance's management agent is online.
pub async fn agent_online(ssm: &aws_sdk_ssm::Client, ec2_id: &str) -> bool {
    let filter = match InstanceInformationStringFilter::builder()
        .key("InstanceIds")
        .values(ec2_id)
        .build()
    {
        Ok(filter) => filter,
        Err(_) => return false,
    };

    let out = ssm
        .describe_instance_information()
        .filters(filter)
        .send()
        .await;

    match out {
        Ok(out) => out
            .instance_information_list()
            .first()
            .and_then(|info| info.ping_status())
            .is_some_and(|status| *status == PingStatus::Online),
        Err(_) => false,
    }
}

/// Polls until the instance registers with the management channel.
pub async fn wait_for_agent(
    ssm: &aws_sdk_ssm::Client,
    ec2_id: &str,
    timeout: Duration,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;

    while tokio::time::Instant::now() < deadline {
        if agent_online(ssm, ec2_id).await {
            debug!(instance = ec2_id, "management agent online");
            return Ok(());
        }
        tokio::time::sleep(Duration::from_secs(10)).await;
    }

    Err(CloudError::Provider(format!(
        "timed out waiting for management agent on {ec2_id}"
    )))
}

/// Extra connection fields for instances reachable over the management
/// channel.
pub fn connection_extra(ec2_id: &str, region: &str) -> HashMap<String, String> {
    HashMap::from([
        ("ssm_target".to_string(), ec2_id.to_string()),
        ("region".to_string(), region.to_string()),
        (
            "session_cmd".to_string(),
            format!("aws ssm start-session --target {ec2_id} --region {region}"),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_selection_is_platform_aware() {
        assert_eq!(document_for(Platform::Windows), "AWS-RunPowerShellScript");
        assert_eq!(document_for(Platform::Linux), "AWS-RunShellScript");
        assert_eq!(document_for(Platform::MacOs), "AWS-RunShellScript");
    }

    #[test]
    fn connection_extra_includes_session_command() {
        let extra = connection_extra("i-0abc", "us-east-1");
        assert_eq!(extra["ssm_target"], "i-0abc");
        assert!(extra["session_cmd"].contains("start-session --target i-0abc"));
    }
}

//! Container-orchestrator backend: one pod per bot instance.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, LogParams, PostParams};
use kube::Client;
use nimbus_core::{
    CloudError, CloudInstance, CommandResult, ConnectionInfo, ConnectionProtocol, ContainerConfig,
    InstanceFilters, InstanceState, Platform, ProvisionRequest, Result, PROVIDER_CONTAINER,
};
use serde_json::json;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use crate::provisioner::Provisioner;

const LABEL_APP: &str = "app";
const APP_NAME: &str = "nimbus-bot";
const LABEL_INSTANCE: &str = "nimbus.dev/cloud-instance";
const LABEL_TEAM: &str = "nimbus.dev/team";
const LABEL_BOT_PACKAGE: &str = "nimbus.dev/bot-package";
const LABEL_TAG_PREFIX: &str = "nimbus.dev/tag-";

/// Provisions Linux bot instances as pods.
pub struct KubernetesProvisioner {
    client: Client,
    config: ContainerConfig,
    server_url: String,
    api_key: String,
}

impl KubernetesProvisioner {
    /// Connects using in-cluster config or the local kubeconfig.
    pub async fn new(
        config: ContainerConfig,
        server_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| CloudError::Provider(format!("failed to create cluster client: {e}")))?;

        Ok(Self {
            client,
            config,
            server_url: server_url.into(),
            api_key: api_key.into(),
        })
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    async fn find_pod(&self, instance_id: &str) -> Result<Pod> {
        let selector = format!("{LABEL_INSTANCE}={instance_id}");
        let pods = self
            .pods()
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| CloudError::Provider(format!("failed to find pod: {e}")))?;

        pods.items.into_iter().next().ok_or(CloudError::InstanceNotFound)
    }

    fn pod_to_instance(&self, pod: &Pod, instance_id: &str) -> CloudInstance {
        let labels = pod.metadata.labels.clone().unwrap_or_default();
        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("");

        let mut instance = CloudInstance::new(instance_id, Platform::Linux, PROVIDER_CONTAINER);
        instance.state = pod_phase_to_state(phase);
        instance.instance_id = pod.metadata.name.clone().unwrap_or_default();
        instance.private_ip = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.clone())
            .unwrap_or_default();
        instance.team_id = labels.get(LABEL_TEAM).cloned().unwrap_or_default();
        instance.bot_package = labels.get(LABEL_BOT_PACKAGE).cloned().unwrap_or_default();
        instance
    }
}

#[async_trait]
impl Provisioner for KubernetesProvisioner {
    fn provider_name(&self) -> &'static str {
        PROVIDER_CONTAINER
    }

    async fn create_instance(
        &self,
        request: &ProvisionRequest,
        instance_id: &str,
    ) -> Result<CloudInstance> {
        if request.platform != Platform::Linux {
            return Err(CloudError::InvalidPlatform(format!(
                "container provisioner does not support platform {}",
                request.platform
            )));
        }

        // A retried create with the same id must not produce a second pod.
        if self.find_pod(instance_id).await.is_ok() {
            return Err(CloudError::InstanceAlreadyExists(instance_id.to_string()));
        }

        let short_id: String = instance_id.chars().take(8).collect();
        let pod_name = format!("bot-{short_id}");
        let image = if request.instance_type.is_empty() {
            self.config.default_image.clone()
        } else {
            // The instance type doubles as an image override for containers.
            request.instance_type.clone()
        };

        let mut labels = BTreeMap::from([
            (LABEL_APP.to_string(), APP_NAME.to_string()),
            (LABEL_INSTANCE.to_string(), instance_id.to_string()),
            (LABEL_TEAM.to_string(), request.team_id.clone()),
            (LABEL_BOT_PACKAGE.to_string(), request.bot_package.clone()),
        ]);
        for (k, v) in &request.tags {
            labels.insert(format!("{LABEL_TAG_PREFIX}{k}"), v.clone());
        }

        let mut env = vec![
            json!({"name": "NIMBUS_SERVER_URL", "value": self.server_url}),
            json!({"name": "NIMBUS_API_KEY", "value": self.api_key}),
            json!({"name": "NIMBUS_INSTANCE_ID", "value": instance_id}),
            json!({"name": "NIMBUS_BOT_PACKAGE", "value": request.bot_package}),
        ];
        if !request.bot_version.is_empty() {
            env.push(json!({"name": "NIMBUS_BOT_VERSION", "value": request.bot_version}));
        }

        let pod: Pod = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": pod_name,
                "namespace": self.config.namespace,
                "labels": labels,
            },
            "spec": {
                "serviceAccountName": self.config.service_account,
                // A failed bot run counts as terminated, not retried.
                "restartPolicy": "Never",
                "containers": [{
                    "name": "agent",
                    "image": image,
                    "env": env,
                    "resources": {
                        "requests": {"cpu": "250m", "memory": "256Mi"},
                        "limits": {"cpu": "1", "memory": "1Gi"},
                    },
                }],
            },
        }))?;

        let created = self
            .pods()
            .create(&PostParams::default(), &pod)
            .await
            .map_err(|e| CloudError::ProvisioningFailed {
                instance_id: instance_id.to_string(),
                platform: Platform::Linux,
                provider: PROVIDER_CONTAINER.to_string(),
                message: e.to_string(),
            })?;

        let pod_name = created.metadata.name.unwrap_or(pod_name);
        info!(pod = %pod_name, instance_id, "pod created");

        let mut instance = CloudInstance::new(instance_id, Platform::Linux, PROVIDER_CONTAINER);
        instance.state = InstanceState::Provisioning;
        instance.instance_id = pod_name;
        instance.instance_type = image;
        instance.bot_package = request.bot_package.clone();
        instance.bot_version = request.bot_version.clone();
        instance.team_id = request.team_id.clone();
        instance.tags = request.tags.clone();
        Ok(instance)
    }

    async fn get_instance(&self, instance_id: &str) -> Result<CloudInstance> {
        let pod = self.find_pod(instance_id).await?;
        Ok(self.pod_to_instance(&pod, instance_id))
    }

    async fn list_instances(&self, filters: &InstanceFilters) -> Result<Vec<CloudInstance>> {
        if filters.platform.is_some_and(|p| p != Platform::Linux) {
            return Ok(Vec::new());
        }

        let mut selector = format!("{LABEL_APP}={APP_NAME}");
        if let Some(team_id) = &filters.team_id {
            selector.push_str(&format!(",{LABEL_TEAM}={team_id}"));
        }

        let pods = self
            .pods()
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| CloudError::Provider(format!("failed to list pods: {e}")))?;

        let instances = pods
            .items
            .iter()
            .filter_map(|pod| {
                let labels = pod.metadata.labels.as_ref()?;
                let instance_id = labels.get(LABEL_INSTANCE)?.clone();
                let instance = self.pod_to_instance(pod, &instance_id);
                if filters.state.is_some_and(|s| instance.state != s) {
                    return None;
                }
                Some(instance)
            })
            .collect();

        Ok(instances)
    }

    async fn start_instance(&self, _instance_id: &str) -> Result<()> {
        Err(CloudError::Unsupported(
            "start is not supported for container instances; create a new instance instead".to_string(),
        ))
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<()> {
        // Pods have no stopped state: stopping is terminating.
        self.terminate_instance(instance_id).await
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        let pod = self.find_pod(instance_id).await?;
        let name = pod.metadata.name.unwrap_or_default();

        self.pods()
            .delete(&name, &DeleteParams::default())
            .await
            .map_err(|e| CloudError::Provider(format!("failed to delete pod {name}: {e}")))?;

        info!(pod = %name, instance_id, "pod terminated");
        Ok(())
    }

    async fn get_connection_info(&self, instance_id: &str) -> Result<ConnectionInfo> {
        let pod = self.find_pod(instance_id).await?;

        let mut info = ConnectionInfo::new(
            ConnectionProtocol::Exec,
            pod.status.as_ref().and_then(|s| s.pod_ip.clone()).unwrap_or_default(),
        );
        info.extra.insert(
            "pod_name".to_string(),
            pod.metadata.name.clone().unwrap_or_default(),
        );
        info.extra.insert("namespace".to_string(), self.config.namespace.clone());
        Ok(info)
    }

    async fn execute_command(&self, instance_id: &str, command: &str) -> Result<CommandResult> {
        let pod = self.find_pod(instance_id).await?;
        let name = pod.metadata.name.unwrap_or_default();
        debug!(pod = %name, command, "exec in pod");

        let mut attached = self
            .pods()
            .exec(
                &name,
                ["sh", "-c", command],
                &AttachParams::default().stdout(true).stderr(true),
            )
            .await
            .map_err(|e| CloudError::Provider(format!("failed to exec in pod {name}: {e}")))?;

        let mut stdout = String::new();
        if let Some(mut reader) = attached.stdout() {
            let _ = reader.read_to_string(&mut stdout).await;
        }
        let mut stderr = String::new();
        if let Some(mut reader) = attached.stderr() {
            let _ = reader.read_to_string(&mut stderr).await;
        }

        let exit_code = match attached.join().await {
            Ok(()) => 0,
            Err(_) => 1,
        };

        Ok(CommandResult { exit_code, stdout, stderr })
    }

    async fn get_logs(&self, instance_id: &str, lines: usize) -> Result<String> {
        let pod = self.find_pod(instance_id).await?;
        let name = pod.metadata.name.unwrap_or_default();

        self.pods()
            .logs(
                &name,
                &LogParams {
                    tail_lines: Some(lines as i64),
                    ..LogParams::default()
                },
            )
            .await
            .map_err(|e| CloudError::Provider(format!("failed to get pod logs: {e}")))
    }
}

/// Maps a pod phase to the canonical instance state.
fn pod_phase_to_state(phase: &str) -> InstanceState {
    match phase {
        "Pending" => InstanceState::Provisioning,
        "Running" => InstanceState::Running,
        // Bots run with restartPolicy Never, so a finished pod is gone
        // either way.
        "Succeeded" | "Failed" => InstanceState::Terminated,
        _ => InstanceState::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_mapping() {
        assert_eq!(pod_phase_to_state("Pending"), InstanceState::Provisioning);
        assert_eq!(pod_phase_to_state("Running"), InstanceState::Running);
        assert_eq!(pod_phase_to_state("Succeeded"), InstanceState::Terminated);
        assert_eq!(pod_phase_to_state("Failed"), InstanceState::Terminated);
        assert_eq!(pod_phase_to_state("Unknown"), InstanceState::Failed);
        assert_eq!(pod_phase_to_state(""), InstanceState::Failed);
    }
}

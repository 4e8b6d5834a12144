//! Configuration for the nimbus control plane.
//!
//! Options are read once at startup from a YAML file, then environment
//! overrides are applied on top. Duration-valued options are plain integer
//! seconds with typed accessors.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CloudError, Result};

/// Top-level cloud provisioning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Master switch; when false every operation returns `cloud disabled`.
    pub enabled: bool,
    /// Per-team cap on non-terminal instances.
    pub max_instances_per_team: i64,
    /// Max time an instance may sit in `provisioning` before the monitor
    /// forces termination.
    pub provisioning_timeout_secs: u64,
    /// Monitor sweep period.
    pub monitor_interval_secs: u64,

    pub iaas: IaasConfig,
    pub container: ContainerConfig,
    pub billing: BillingConfig,
    pub server: ServerConfig,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_instances_per_team: 10,
            provisioning_timeout_secs: 600,
            monitor_interval_secs: 30,
            iaas: IaasConfig::default(),
            container: ContainerConfig::default(),
            billing: BillingConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

/// IaaS (EC2) backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IaasConfig {
    pub enabled: bool,
    pub region: String,
    pub subnet_ids: Vec<String>,
    pub security_group_id: String,
    pub instance_profile: String,
    pub macos: MacOsConfig,
    pub windows: WindowsConfig,
}

impl Default for IaasConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            region: "us-east-1".to_string(),
            subnet_ids: Vec::new(),
            security_group_id: String::new(),
            instance_profile: String::new(),
            macos: MacOsConfig::default(),
            windows: WindowsConfig::default(),
        }
    }
}

/// macOS launch parameters, including the dedicated host fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MacOsConfig {
    /// Pre-allocated dedicated host ids seeded into the store at startup.
    pub dedicated_host_ids: Vec<String>,
    pub ami_id: String,
    pub instance_type: String,
    /// Minimum time a host must stay allocated before release.
    pub min_host_allocation_secs: u64,
    /// Idle time after which the monitor releases an unoccupied host.
    /// Must be >= `min_host_allocation_secs`.
    pub idle_host_release_secs: u64,
}

impl Default for MacOsConfig {
    fn default() -> Self {
        Self {
            dedicated_host_ids: Vec::new(),
            ami_id: String::new(),
            instance_type: "mac2.metal".to_string(),
            min_host_allocation_secs: 24 * 60 * 60,
            idle_host_release_secs: 25 * 60 * 60,
        }
    }
}

/// Windows launch parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowsConfig {
    pub ami_id: String,
    pub default_instance_type: String,
    /// Key pair name used so the encrypted administrator password can be
    /// retrieved after first boot.
    pub key_pair: String,
}

impl Default for WindowsConfig {
    fn default() -> Self {
        Self {
            ami_id: String::new(),
            default_instance_type: "t3.large".to_string(),
            key_pair: "nimbus-agent-windows".to_string(),
        }
    }
}

/// Container-orchestrator backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub enabled: bool,
    pub namespace: String,
    pub default_image: String,
    pub service_account: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            namespace: "nimbus".to_string(),
            default_image: "ghcr.io/nimbus-dev/agent:latest".to_string(),
            service_account: "default".to_string(),
        }
    }
}

/// Billing authorization oracle configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    pub enabled: bool,
    pub service_url: String,
    pub api_key: String,
}

/// Control-plane server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// URL provisioned instances use to reach the control plane.
    pub public_url: String,
    /// API key injected into instance bootstrap for agent registration.
    pub api_key: String,
    pub database_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            public_url: "http://localhost:8080".to_string(),
            api_key: String::new(),
            database_url: "sqlite://nimbus.db?mode=rwc".to_string(),
        }
    }
}

impl CloudConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: CloudConfig = serde_yaml::from_str(&content)
            .map_err(|e| CloudError::Config(format!("failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Load from `NIMBUS_CONFIG` (or defaults when absent), then apply
    /// environment overrides.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var("NIMBUS_CONFIG").unwrap_or_else(|_| "nimbus.yaml".to_string());
        let mut config = if Path::new(&path).exists() {
            Self::load(&path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment variables take precedence over file-configured values.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_bool("NIMBUS_CLOUD_ENABLED") {
            self.enabled = v;
        }
        if let Ok(v) = std::env::var("NIMBUS_CLOUD_MAX_INSTANCES_PER_TEAM") {
            if let Ok(n) = v.parse() {
                self.max_instances_per_team = n;
            }
        }
        if let Ok(v) = std::env::var("NIMBUS_CLOUD_PROVISIONING_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.provisioning_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("NIMBUS_CLOUD_MONITOR_INTERVAL_SECS") {
            if let Ok(n) = v.parse() {
                self.monitor_interval_secs = n;
            }
        }

        if let Some(v) = env_bool("NIMBUS_CLOUD_IAAS_ENABLED") {
            self.iaas.enabled = v;
        }
        if let Ok(v) = std::env::var("AWS_REGION") {
            if !v.is_empty() {
                self.iaas.region = v;
            }
        }
        if let Ok(v) = std::env::var("NIMBUS_CLOUD_IAAS_SUBNET_IDS") {
            self.iaas.subnet_ids = split_csv(&v);
        }
        if let Ok(v) = std::env::var("NIMBUS_CLOUD_IAAS_SECURITY_GROUP_ID") {
            self.iaas.security_group_id = v;
        }
        if let Ok(v) = std::env::var("NIMBUS_CLOUD_IAAS_INSTANCE_PROFILE") {
            self.iaas.instance_profile = v;
        }
        if let Ok(v) = std::env::var("NIMBUS_CLOUD_MACOS_AMI") {
            self.iaas.macos.ami_id = v;
        }
        if let Ok(v) = std::env::var("NIMBUS_CLOUD_MACOS_HOST_IDS") {
            self.iaas.macos.dedicated_host_ids = split_csv(&v);
        }
        if let Ok(v) = std::env::var("NIMBUS_CLOUD_WINDOWS_AMI") {
            self.iaas.windows.ami_id = v;
        }
        if let Ok(v) = std::env::var("NIMBUS_CLOUD_WINDOWS_INSTANCE_TYPE") {
            self.iaas.windows.default_instance_type = v;
        }

        if let Some(v) = env_bool("NIMBUS_CLOUD_CONTAINER_ENABLED") {
            self.container.enabled = v;
        }
        if let Ok(v) = std::env::var("NIMBUS_CLOUD_CONTAINER_NAMESPACE") {
            self.container.namespace = v;
        }
        if let Ok(v) = std::env::var("NIMBUS_CLOUD_CONTAINER_IMAGE") {
            self.container.default_image = v;
        }

        if let Some(v) = env_bool("NIMBUS_CLOUD_BILLING_ENABLED") {
            self.billing.enabled = v;
        }
        if let Ok(v) = std::env::var("NIMBUS_CLOUD_BILLING_URL") {
            self.billing.service_url = v;
        }
        if let Ok(v) = std::env::var("NIMBUS_CLOUD_BILLING_API_KEY") {
            self.billing.api_key = v;
        }

        if let Ok(v) = std::env::var("NIMBUS_SERVER_BIND") {
            self.server.bind_addr = v;
        }
        if let Ok(v) = std::env::var("NIMBUS_PUBLIC_URL") {
            self.server.public_url = v;
        }
        if let Ok(v) = std::env::var("NIMBUS_API_KEY") {
            self.server.api_key = v;
        }
        if let Ok(v) = std::env::var("NIMBUS_DATABASE_URL") {
            self.server.database_url = v;
        }
    }

    pub fn provisioning_timeout(&self) -> Duration {
        Duration::from_secs(self.provisioning_timeout_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }
}

impl MacOsConfig {
    pub fn min_host_allocation(&self) -> Duration {
        Duration::from_secs(self.min_host_allocation_secs)
    }

    pub fn idle_host_release(&self) -> Duration {
        Duration::from_secs(self.idle_host_release_secs)
    }
}

fn env_bool(key: &str) -> Option<bool> {
    match std::env::var(key) {
        Ok(v) => Some(v == "true" || v == "1"),
        Err(_) => None,
    }
}

fn split_csv(v: &str) -> Vec<String> {
    v.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

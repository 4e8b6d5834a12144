//! Domain model for the nimbus control plane.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CloudError;

/// Provider identifier for the container-orchestrator backend.
pub const PROVIDER_CONTAINER: &str = "container";
/// Provider identifier for the IaaS backend.
pub const PROVIDER_IAAS: &str = "iaas";

/// Operating system platform of a cloud instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::MacOs => "macos",
            Platform::Windows => "windows",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = CloudError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linux" => Ok(Platform::Linux),
            "macos" => Ok(Platform::MacOs),
            "windows" => Ok(Platform::Windows),
            other => Err(CloudError::InvalidPlatform(other.to_string())),
        }
    }
}

/// Lifecycle state of a cloud instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Requested,
    Provisioning,
    Running,
    Stopped,
    Terminated,
    Failed,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Requested => "requested",
            InstanceState::Provisioning => "provisioning",
            InstanceState::Running => "running",
            InstanceState::Stopped => "stopped",
            InstanceState::Terminated => "terminated",
            InstanceState::Failed => "failed",
        }
    }

    /// Terminal states are excluded from team quota counting.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Terminated | InstanceState::Failed)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceState {
    type Err = CloudError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requested" => Ok(InstanceState::Requested),
            "provisioning" => Ok(InstanceState::Provisioning),
            "running" => Ok(InstanceState::Running),
            "stopped" => Ok(InstanceState::Stopped),
            "terminated" => Ok(InstanceState::Terminated),
            "failed" => Ok(InstanceState::Failed),
            other => Err(CloudError::InvalidState(other.to_string())),
        }
    }
}

/// Protocol used to connect to an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionProtocol {
    Rdp,
    Vnc,
    Ssh,
    Exec,
    Ssm,
}

/// A provisioned cloud instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudInstance {
    pub id: String,
    pub platform: Platform,
    pub state: InstanceState,
    /// Backing provider, one of [`PROVIDER_CONTAINER`] or [`PROVIDER_IAAS`].
    pub provider: String,
    /// Provider-native identity (EC2 instance id, pod name).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance_id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bot_package: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bot_version: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub public_ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub private_ip: String,

    /// Correlation to the registered runtime agent, once it phones home.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_node_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub team_id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dedicated_host_id: String,

    #[serde(default)]
    pub hourly_rate_cents: i64,
    #[serde(default)]
    pub accrued_cost_cents: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub billing_tier: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_info: Option<ConnectionInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,

    pub requested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioned_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CloudInstance {
    /// A fresh instance record with all timestamps set to now.
    pub fn new(id: impl Into<String>, platform: Platform, provider: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            platform,
            state: InstanceState::Requested,
            provider: provider.into(),
            instance_id: String::new(),
            instance_type: String::new(),
            image_id: String::new(),
            region: String::new(),
            bot_package: String::new(),
            bot_version: String::new(),
            public_ip: String::new(),
            private_ip: String::new(),
            agent_node_id: String::new(),
            team_id: String::new(),
            dedicated_host_id: String::new(),
            hourly_rate_cents: 0,
            accrued_cost_cents: 0,
            billing_tier: String::new(),
            connection_info: None,
            metadata: None,
            tags: HashMap::new(),
            error_message: String::new(),
            requested_at: now,
            provisioned_at: None,
            terminated_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Connection details for a cloud instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub protocol: ConnectionProtocol,
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key_data: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, String>,
}

impl ConnectionInfo {
    pub fn new(protocol: ConnectionProtocol, host: impl Into<String>) -> Self {
        Self {
            protocol,
            host: host.into(),
            port: 0,
            username: String::new(),
            password: String::new(),
            key_data: String::new(),
            extra: HashMap::new(),
        }
    }
}

/// A request to provision a new cloud instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub platform: Platform,
    pub bot_package: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bot_version: String,
    /// Instance type override; for the container backend this overrides the image.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance_type: String,
    pub team_id: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Result of a command executed on an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

/// Allocation state of a dedicated host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostState {
    Available,
    Allocated,
    Released,
}

impl HostState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostState::Available => "available",
            HostState::Allocated => "allocated",
            HostState::Released => "released",
        }
    }
}

impl std::fmt::Display for HostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HostState {
    type Err = CloudError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(HostState::Available),
            "allocated" => Ok(HostState::Allocated),
            "released" => Ok(HostState::Released),
            other => Err(CloudError::InvalidState(other.to_string())),
        }
    }
}

/// A tenancy-constrained physical host for macOS instances.
///
/// Host allocation is billed by the provider in indivisible periods of
/// `min_allocation`; releasing earlier is refused by the allocator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedicatedHost {
    pub id: String,
    /// Provider-native host id.
    pub host_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance_type: String,
    pub state: HostState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub current_instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_at: Option<DateTime<Utc>>,
    pub min_allocation: Duration,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DedicatedHost {
    pub fn new(host_id: impl Into<String>, instance_type: impl Into<String>, min_allocation: Duration) -> Self {
        let host_id = host_id.into();
        let now = Utc::now();
        Self {
            id: format!("dh-{host_id}"),
            host_id,
            instance_type: instance_type.into(),
            state: HostState::Available,
            current_instance_id: String::new(),
            allocated_at: None,
            released_at: None,
            min_allocation,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Filters for querying cloud instances.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<InstanceState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

impl InstanceFilters {
    pub fn with_state(state: InstanceState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }
}

/// A cloud infrastructure lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudEvent {
    #[serde(default)]
    pub id: String,
    /// Hierarchical type string, e.g. `instance.running`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Empty for host-level events.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Dashboard summary of the cloud fleet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudSummary {
    pub total_instances: i64,
    pub by_platform: HashMap<Platform, i64>,
    pub by_state: HashMap<InstanceState, i64>,
    pub active_hosts: i64,
    pub estimated_cost_usd: f64,
    pub total_accrued_cents: i64,
}

/// Result of a billing authorization check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BillingAuth {
    pub authorized: bool,
    #[serde(default)]
    pub tier: String,
    #[serde(default, rename = "hourly_rate_cents")]
    pub hourly_cents: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, rename = "billing_account_id", skip_serializing_if = "String::is_empty")]
    pub billing_account: String,
}

/// Cloud compute quota for a team, as reported by the billing service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudQuota {
    pub tier: String,
    pub max_linux_instances: i64,
    pub max_windows_instances: i64,
    pub max_macos_instances: i64,
    /// 0 = unlimited.
    #[serde(rename = "max_compute_hours_monthly")]
    pub max_compute_hours: i64,
    #[serde(default)]
    pub used_linux: i64,
    #[serde(default)]
    pub used_windows: i64,
    #[serde(default)]
    pub used_macos: i64,
    #[serde(default)]
    pub used_compute_hours: f64,
    /// 0 = unlimited.
    #[serde(default)]
    pub monthly_budget_cents: i64,
    #[serde(default)]
    pub used_budget_cents: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_round_trips_through_str() {
        for p in [Platform::Linux, Platform::MacOs, Platform::Windows] {
            assert_eq!(p.as_str().parse::<Platform>().unwrap(), p);
        }
        assert!("solaris".parse::<Platform>().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(InstanceState::Terminated.is_terminal());
        assert!(InstanceState::Failed.is_terminal());
        assert!(!InstanceState::Running.is_terminal());
        assert!(!InstanceState::Provisioning.is_terminal());
    }

    #[test]
    fn instance_serializes_compactly() {
        let inst = CloudInstance::new("i-1", Platform::Linux, PROVIDER_CONTAINER);
        let json = serde_json::to_value(&inst).unwrap();
        assert_eq!(json["platform"], "linux");
        assert_eq!(json["state"], "requested");
        // empty optional fields are omitted from the wire form
        assert!(json.get("public_ip").is_none());
        assert!(json.get("error_message").is_none());
    }

    #[test]
    fn event_type_field_is_named_type() {
        let ev = CloudEvent {
            id: "e1".into(),
            event_type: "instance.running".into(),
            instance_id: "i-1".into(),
            timestamp: Utc::now(),
            data: None,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "instance.running");
    }
}

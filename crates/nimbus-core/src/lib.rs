//! # nimbus-core
//!
//! Domain types, configuration, error taxonomy and the storage capability
//! for the nimbus cloud control plane.

pub mod config;
pub mod error;
pub mod store;
pub mod types;

pub use config::{BillingConfig, CloudConfig, ContainerConfig, IaasConfig, MacOsConfig, ServerConfig, WindowsConfig};
pub use error::{CloudError, Result};
pub use store::CloudStore;
pub use types::{
    BillingAuth, CloudEvent, CloudInstance, CloudQuota, CloudSummary, CommandResult, ConnectionInfo,
    ConnectionProtocol, DedicatedHost, HostState, InstanceFilters, InstanceState, Platform,
    ProvisionRequest, PROVIDER_CONTAINER, PROVIDER_IAAS,
};

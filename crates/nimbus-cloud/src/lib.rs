//! # nimbus-cloud
//!
//! The provisioning engine: event bus, billing integration, the provisioner
//! capability with its container and IaaS backends, dedicated host
//! allocation, the dispatching manager and the reconciliation monitor.

pub mod aws;
pub mod billing;
pub mod events;
pub mod hosts;
pub mod kubernetes;
pub mod manager;
pub mod monitor;
pub mod provisioner;

#[cfg(test)]
pub(crate) mod testutil;

pub use aws::AwsProvisioner;
pub use billing::{BillingAuthorizer, HttpBillingClient, PermissiveBilling};
pub use events::EventBus;
pub use hosts::HostAllocator;
pub use kubernetes::KubernetesProvisioner;
pub use manager::CloudManager;
pub use monitor::Monitor;
pub use provisioner::Provisioner;

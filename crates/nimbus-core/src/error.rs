//! Error types for the nimbus control plane.

use thiserror::Error;

use crate::types::Platform;

/// Main error type for cloud provisioning operations.
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("cloud provisioning is disabled")]
    CloudDisabled,

    #[error("cloud provider is disabled")]
    ProviderDisabled,

    #[error("cloud instance not found")]
    InstanceNotFound,

    #[error("cloud instance already exists: {0}")]
    InstanceAlreadyExists(String),

    #[error("invalid platform: {0}")]
    InvalidPlatform(String),

    #[error("no available dedicated host")]
    NoAvailableHost,

    #[error("dedicated host not found: {0}")]
    HostNotFound(String),

    #[error("dedicated host minimum allocation period not met")]
    HostMinAllocation,

    #[error("instance provisioning timed out")]
    ProvisioningTimeout,

    #[error("maximum instances per team reached")]
    MaxInstancesReached,

    #[error("invalid instance state for requested operation: {0}")]
    InvalidState(String),

    #[error("billing authorization denied: {0}")]
    BillingNotAuthorized(String),

    #[error("cloud compute quota exceeded for billing tier")]
    BillingQuotaExceeded,

    #[error("billing service unavailable: {0}")]
    BillingUnavailable(String),

    #[error("provisioning failed for {platform} instance {instance_id} on {provider}: {message}")]
    ProvisioningFailed {
        instance_id: String,
        platform: Platform,
        provider: String,
        message: String,
    },

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, CloudError>;

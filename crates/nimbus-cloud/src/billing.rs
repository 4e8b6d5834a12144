//! Billing authorization and usage reporting.

use std::time::Duration;

use async_trait::async_trait;
use nimbus_core::{BillingAuth, CloudError, CloudQuota, Platform, Result};
use serde_json::json;
use tracing::warn;

/// Default hourly rates used when no billing service is configured.
pub fn platform_hourly_cents(platform: Platform) -> i64 {
    match platform {
        Platform::MacOs => 120,
        Platform::Windows => 10,
        Platform::Linux => 1,
    }
}

/// Authorization oracle and usage sink for cloud provisioning.
#[async_trait]
pub trait BillingAuthorizer: Send + Sync {
    /// Checks whether a team may provision an instance. A transport failure
    /// is a [`CloudError::BillingUnavailable`]; the manager treats it as
    /// denial.
    async fn authorize(
        &self,
        team_id: &str,
        platform: Platform,
        instance_type: &str,
    ) -> Result<BillingAuth>;

    /// Reports compute hours. Best-effort: callers log failures and move on.
    async fn report_usage(
        &self,
        instance_id: &str,
        platform: Platform,
        hours: f64,
        hourly_cents: i64,
    ) -> Result<()>;

    /// The team's cloud compute quota.
    async fn team_quota(&self, team_id: &str) -> Result<CloudQuota>;
}

/// Billing client backed by the remote billing service.
pub struct HttpBillingClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpBillingClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        }
    }

    fn unavailable(e: reqwest::Error) -> CloudError {
        CloudError::BillingUnavailable(e.to_string())
    }
}

#[async_trait]
impl BillingAuthorizer for HttpBillingClient {
    async fn authorize(
        &self,
        team_id: &str,
        platform: Platform,
        instance_type: &str,
    ) -> Result<BillingAuth> {
        let resp = self
            .client
            .post(format!("{}/v1/billing/cloud/authorize", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "team_id": team_id,
                "platform": platform.as_str(),
                "instance_type": instance_type,
            }))
            .send()
            .await
            .map_err(Self::unavailable)?;

        // Denials come back with a non-200 status and the same body shape.
        let auth: BillingAuth = resp.json().await.map_err(Self::unavailable)?;
        Ok(auth)
    }

    async fn report_usage(
        &self,
        instance_id: &str,
        platform: Platform,
        hours: f64,
        hourly_cents: i64,
    ) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}/v1/billing/cloud/usage", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "instance_id": instance_id,
                "platform": platform.as_str(),
                "compute_hours": hours,
                "hourly_rate_cents": hourly_cents,
            }))
            .send()
            .await
            .map_err(Self::unavailable)?;

        if !resp.status().is_success() {
            warn!(
                instance = instance_id,
                status = %resp.status(),
                "billing usage report returned error"
            );
        }
        Ok(())
    }

    async fn team_quota(&self, team_id: &str) -> Result<CloudQuota> {
        let resp = self
            .client
            .get(format!("{}/v1/billing/cloud/quota", self.base_url))
            .query(&[("team_id", team_id)])
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(Self::unavailable)?;

        let quota: CloudQuota = resp.json().await.map_err(Self::unavailable)?;
        Ok(quota)
    }
}

/// Authorizes everything. Used when billing is disabled.
pub struct PermissiveBilling;

#[async_trait]
impl BillingAuthorizer for PermissiveBilling {
    async fn authorize(
        &self,
        _team_id: &str,
        platform: Platform,
        _instance_type: &str,
    ) -> Result<BillingAuth> {
        Ok(BillingAuth {
            authorized: true,
            tier: "unlimited".to_string(),
            hourly_cents: platform_hourly_cents(platform),
            reason: String::new(),
            billing_account: String::new(),
        })
    }

    async fn report_usage(
        &self,
        _instance_id: &str,
        _platform: Platform,
        _hours: f64,
        _hourly_cents: i64,
    ) -> Result<()> {
        Ok(())
    }

    async fn team_quota(&self, _team_id: &str) -> Result<CloudQuota> {
        Ok(CloudQuota {
            tier: "unlimited".to_string(),
            max_linux_instances: 100,
            max_windows_instances: 10,
            max_macos_instances: 5,
            ..CloudQuota::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permissive_authorizes_with_platform_rates() {
        let billing = PermissiveBilling;

        let auth = billing.authorize("team-a", Platform::Linux, "").await.unwrap();
        assert!(auth.authorized);
        assert_eq!(auth.hourly_cents, 1);

        let auth = billing.authorize("team-a", Platform::Windows, "").await.unwrap();
        assert_eq!(auth.hourly_cents, 10);

        let auth = billing.authorize("team-a", Platform::MacOs, "").await.unwrap();
        assert_eq!(auth.hourly_cents, 120);
        assert_eq!(auth.tier, "unlimited");
    }

    #[tokio::test]
    async fn http_client_reports_unavailable_on_transport_failure() {
        // Nothing listens on this port.
        let billing = HttpBillingClient::new("http://127.0.0.1:19", "key");
        let err = billing.authorize("team-a", Platform::Linux, "").await.unwrap_err();
        assert!(matches!(err, CloudError::BillingUnavailable(_)));
    }
}

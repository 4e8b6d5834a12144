//! The orchestration hub: authorize, dispatch, persist, emit.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use nimbus_core::{
    CloudConfig, CloudError, CloudInstance, CloudStore, CloudSummary, CommandResult,
    ConnectionInfo, InstanceFilters, InstanceState, Platform, ProvisionRequest, Result,
};
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::billing::{platform_hourly_cents, BillingAuthorizer, HttpBillingClient, PermissiveBilling};
use crate::events::{
    EventBus, EVENT_HOST_ALLOCATED, EVENT_INSTANCE_CONNECTED, EVENT_INSTANCE_PROVISIONING,
    EVENT_INSTANCE_REQUESTED, EVENT_INSTANCE_RUNNING, EVENT_INSTANCE_STOPPED,
    EVENT_INSTANCE_TERMINATED,
};
use crate::provisioner::Provisioner;

/// Dispatches cloud operations to the correct provisioner by platform.
pub struct CloudManager {
    config: CloudConfig,
    store: Option<Arc<dyn CloudStore>>,
    provisioners: RwLock<HashMap<Platform, Arc<dyn Provisioner>>>,
    events: Arc<EventBus>,
    billing: Arc<dyn BillingAuthorizer>,
}

impl CloudManager {
    /// Builds a manager, selecting the billing variant from config.
    pub fn new(config: CloudConfig, store: Option<Arc<dyn CloudStore>>) -> Self {
        let billing: Arc<dyn BillingAuthorizer> =
            if config.billing.enabled && !config.billing.service_url.is_empty() {
                info!(url = %config.billing.service_url, "cloud billing enabled");
                Arc::new(HttpBillingClient::new(
                    config.billing.service_url.clone(),
                    config.billing.api_key.clone(),
                ))
            } else {
                info!("cloud billing disabled, all provisioning allowed");
                Arc::new(PermissiveBilling)
            };

        Self::with_billing(config, store, billing)
    }

    /// Builds a manager with an explicit billing authorizer.
    pub fn with_billing(
        config: CloudConfig,
        store: Option<Arc<dyn CloudStore>>,
        billing: Arc<dyn BillingAuthorizer>,
    ) -> Self {
        Self {
            config,
            store,
            provisioners: RwLock::new(HashMap::new()),
            events: Arc::new(EventBus::default()),
            billing,
        }
    }

    /// Registers a provisioner for one or more platforms. Called at startup.
    pub fn register_provisioner(&self, platforms: &[Platform], provisioner: Arc<dyn Provisioner>) {
        let mut map = self
            .provisioners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for platform in platforms {
            info!(platform = %platform, provider = provisioner.provider_name(), "registered cloud provisioner");
            map.insert(*platform, provisioner.clone());
        }
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    pub fn billing(&self) -> Arc<dyn BillingAuthorizer> {
        self.billing.clone()
    }

    pub fn config(&self) -> &CloudConfig {
        &self.config
    }

    pub fn store(&self) -> Option<Arc<dyn CloudStore>> {
        self.store.clone()
    }

    /// Provisions a new cloud instance.
    pub async fn create_instance(&self, request: &ProvisionRequest) -> Result<CloudInstance> {
        if !self.config.enabled {
            return Err(CloudError::CloudDisabled);
        }

        // Team instance cap; a store failure here skips the check rather
        // than failing the request.
        if !request.team_id.is_empty() {
            if let Some(store) = &self.store {
                match store.count_cloud_instances_by_team(&request.team_id).await {
                    Ok(count) if count >= self.config.max_instances_per_team => {
                        return Err(CloudError::MaxInstancesReached);
                    }
                    Ok(_) => {}
                    Err(e) => warn!(team = %request.team_id, error = %e, "instance count failed"),
                }
            }
        }

        // No provisioning without a billing decision.
        let auth = match self
            .billing
            .authorize(&request.team_id, request.platform, &request.instance_type)
            .await
        {
            Ok(auth) => auth,
            Err(CloudError::BillingUnavailable(reason)) => {
                error!(team = %request.team_id, reason, "billing authorization check failed");
                return Err(CloudError::BillingUnavailable(reason));
            }
            Err(e) => {
                error!(team = %request.team_id, error = %e, "billing authorization check failed");
                return Err(CloudError::BillingUnavailable(e.to_string()));
            }
        };
        if !auth.authorized {
            warn!(team = %request.team_id, reason = %auth.reason, "billing denied provisioning");
            return Err(CloudError::BillingNotAuthorized(auth.reason));
        }

        let provisioner = self.provisioner_for(request.platform)?;

        self.events.emit(
            EVENT_INSTANCE_REQUESTED,
            "",
            Some(json!({
                "platform": request.platform.as_str(),
                "bot_package": request.bot_package,
                "team_id": request.team_id,
            })),
        );

        let instance_id = Uuid::new_v4().to_string();
        let mut instance = provisioner.create_instance(request, &instance_id).await?;

        // Freeze the authorized rate on the instance.
        instance.hourly_rate_cents = auth.hourly_cents;
        instance.billing_tier = auth.tier.clone();

        // The backend allocation already succeeded; a persistence failure is
        // logged and left to the reconciler.
        if let Some(store) = &self.store {
            if let Err(e) = store.create_cloud_instance(&instance).await {
                error!(id = %instance.id, error = %e, "failed to persist cloud instance");
            }
        }

        self.events.emit(
            EVENT_INSTANCE_PROVISIONING,
            &instance.id,
            serde_json::to_value(&instance).ok(),
        );
        if !instance.dedicated_host_id.is_empty() {
            self.events.emit(EVENT_HOST_ALLOCATED, &instance.id, Some(json!({
                "host_id": instance.dedicated_host_id,
            })));
        }

        Ok(instance)
    }

    /// Returns the current state of an instance: store first, then the
    /// backends, which retain their own authoritative state.
    pub async fn get_instance(&self, instance_id: &str) -> Result<CloudInstance> {
        if !self.config.enabled {
            return Err(CloudError::CloudDisabled);
        }

        if let Some(store) = &self.store {
            if let Ok(instance) = store.get_cloud_instance(instance_id).await {
                return Ok(instance);
            }
        }

        for provisioner in self.all_provisioners() {
            if let Ok(instance) = provisioner.get_instance(instance_id).await {
                return Ok(instance);
            }
        }

        Err(CloudError::InstanceNotFound)
    }

    /// Lists instances matching the filters.
    pub async fn list_instances(&self, filters: &InstanceFilters) -> Result<Vec<CloudInstance>> {
        if !self.config.enabled {
            return Err(CloudError::CloudDisabled);
        }

        if let Some(store) = &self.store {
            return store.list_cloud_instances(filters).await;
        }

        let mut all = Vec::new();
        for provisioner in self.all_provisioners() {
            match provisioner.list_instances(filters).await {
                Ok(instances) => all.extend(instances),
                Err(e) => {
                    warn!(provider = provisioner.provider_name(), error = %e, "failed to list instances")
                }
            }
        }
        Ok(all)
    }

    pub async fn start_instance(&self, instance_id: &str) -> Result<()> {
        let (mut instance, provisioner) = self.resolve_instance(instance_id).await?;

        provisioner.start_instance(instance_id).await?;

        if let Some(store) = &self.store {
            instance.state = InstanceState::Running;
            instance.updated_at = Utc::now();
            if let Err(e) = store.update_cloud_instance(&instance).await {
                warn!(id = instance_id, error = %e, "failed to persist started state");
            }
        }

        self.events.emit(EVENT_INSTANCE_RUNNING, instance_id, None);
        Ok(())
    }

    pub async fn stop_instance(&self, instance_id: &str) -> Result<()> {
        let (mut instance, provisioner) = self.resolve_instance(instance_id).await?;

        provisioner.stop_instance(instance_id).await?;

        if let Some(store) = &self.store {
            instance.state = InstanceState::Stopped;
            instance.updated_at = Utc::now();
            if let Err(e) = store.update_cloud_instance(&instance).await {
                warn!(id = instance_id, error = %e, "failed to persist stopped state");
            }
        }

        self.events.emit(EVENT_INSTANCE_STOPPED, instance_id, None);
        Ok(())
    }

    pub async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        let (mut instance, provisioner) = self.resolve_instance(instance_id).await?;

        provisioner.terminate_instance(instance_id).await?;

        if let Some(store) = &self.store {
            let now = Utc::now();
            instance.state = InstanceState::Terminated;
            instance.terminated_at = Some(now);
            instance.updated_at = now;
            if let Err(e) = store.update_cloud_instance(&instance).await {
                warn!(id = instance_id, error = %e, "failed to persist terminated state");
            }
        }

        self.events.emit(EVENT_INSTANCE_TERMINATED, instance_id, None);
        Ok(())
    }

    pub async fn get_connection_info(&self, instance_id: &str) -> Result<ConnectionInfo> {
        let (mut instance, provisioner) = self.resolve_instance(instance_id).await?;

        let info = provisioner.get_connection_info(instance_id).await?;

        if let Some(store) = &self.store {
            instance.connection_info = Some(info.clone());
            instance.updated_at = Utc::now();
            if let Err(e) = store.update_cloud_instance(&instance).await {
                warn!(id = instance_id, error = %e, "failed to persist connection info");
            }
        }

        self.events.emit(EVENT_INSTANCE_CONNECTED, instance_id, None);
        Ok(info)
    }

    pub async fn execute_command(&self, instance_id: &str, command: &str) -> Result<CommandResult> {
        let (_, provisioner) = self.resolve_instance(instance_id).await?;
        provisioner.execute_command(instance_id, command).await
    }

    pub async fn get_logs(&self, instance_id: &str, lines: usize) -> Result<String> {
        let (_, provisioner) = self.resolve_instance(instance_id).await?;
        provisioner.get_logs(instance_id, lines).await
    }

    /// Aggregated dashboard summary of the fleet.
    pub async fn summary(&self) -> Result<CloudSummary> {
        if !self.config.enabled {
            return Err(CloudError::CloudDisabled);
        }

        let instances = self.list_instances(&InstanceFilters::default()).await?;

        let mut summary = CloudSummary::default();
        for instance in &instances {
            summary.total_instances += 1;
            *summary.by_platform.entry(instance.platform).or_default() += 1;
            *summary.by_state.entry(instance.state).or_default() += 1;
            summary.total_accrued_cents += instance.accrued_cost_cents;

            // Current-hour cost estimate covers everything that is costing
            // money right now, provisioning included.
            if matches!(
                instance.state,
                InstanceState::Running | InstanceState::Provisioning
            ) {
                let rate = if instance.hourly_rate_cents > 0 {
                    instance.hourly_rate_cents
                } else {
                    platform_hourly_cents(instance.platform)
                };
                summary.estimated_cost_usd += rate as f64 / 100.0;
            }
        }

        if let Some(store) = &self.store {
            if let Ok(hosts) = store.list_dedicated_hosts().await {
                summary.active_hosts = hosts
                    .iter()
                    .filter(|h| h.state == nimbus_core::HostState::Allocated)
                    .count() as i64;
            }
        }

        Ok(summary)
    }

    /// The provisioner registered for a platform.
    pub(crate) fn provisioner_for(&self, platform: Platform) -> Result<Arc<dyn Provisioner>> {
        let map = self
            .provisioners
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        map.get(&platform)
            .cloned()
            .ok_or_else(|| CloudError::InvalidPlatform(platform.to_string()))
    }

    fn all_provisioners(&self) -> Vec<Arc<dyn Provisioner>> {
        let map = self
            .provisioners
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        map.values().cloned().collect()
    }

    async fn resolve_instance(
        &self,
        instance_id: &str,
    ) -> Result<(CloudInstance, Arc<dyn Provisioner>)> {
        if !self.config.enabled {
            return Err(CloudError::CloudDisabled);
        }

        let instance = self.get_instance(instance_id).await?;
        let provisioner = self.provisioner_for(instance.platform)?;
        Ok((instance, provisioner))
    }
}

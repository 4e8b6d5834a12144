//! Shared fakes for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use nimbus_core::{
    BillingAuth, CloudError, CloudInstance, CloudQuota, CloudStore, CommandResult, ConnectionInfo,
    ConnectionProtocol, InstanceFilters, InstanceState, Platform, ProvisionRequest, Result,
};

use crate::billing::BillingAuthorizer;
use crate::provisioner::Provisioner;

pub async fn mem_store() -> Arc<dyn CloudStore> {
    let pool = nimbus_db::DbPool::in_memory().await.expect("in-memory pool");
    let store = nimbus_db::SqliteStore::new(pool);
    store.init_schema().await.expect("schema");
    Arc::new(store)
}

pub fn request(platform: Platform, team: &str) -> ProvisionRequest {
    ProvisionRequest {
        platform,
        bot_package: "crawler".to_string(),
        bot_version: String::new(),
        instance_type: String::new(),
        team_id: team.to_string(),
        tags: HashMap::new(),
        metadata: None,
    }
}

/// An in-memory backend that records calls and lets tests steer live state.
pub struct MockProvisioner {
    name: &'static str,
    platform: Platform,
    instances: Mutex<HashMap<String, CloudInstance>>,
    create_calls: AtomicUsize,
    terminate_calls: AtomicUsize,
    fail_create: AtomicBool,
    fail_terminate: AtomicBool,
}

impl MockProvisioner {
    pub fn new(name: &'static str, platform: Platform) -> Self {
        Self {
            name,
            platform,
            instances: Mutex::new(HashMap::new()),
            create_calls: AtomicUsize::new(0),
            terminate_calls: AtomicUsize::new(0),
            fail_create: AtomicBool::new(false),
            fail_terminate: AtomicBool::new(false),
        }
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<String, CloudInstance>> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, instance: CloudInstance) {
        self.map().insert(instance.id.clone(), instance);
    }

    /// Sets the live backend state observed by `get_instance`.
    pub fn set_state(&self, instance_id: &str, state: InstanceState) {
        if let Some(instance) = self.map().get_mut(instance_id) {
            instance.state = state;
        }
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_terminate(&self, fail: bool) {
        self.fail_terminate.store(fail, Ordering::SeqCst);
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn terminate_calls(&self) -> usize {
        self.terminate_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provisioner for MockProvisioner {
    fn provider_name(&self) -> &'static str {
        self.name
    }

    async fn create_instance(
        &self,
        request: &ProvisionRequest,
        instance_id: &str,
    ) -> Result<CloudInstance> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);

        if self.fail_create.load(Ordering::SeqCst) {
            return Err(CloudError::ProvisioningFailed {
                instance_id: instance_id.to_string(),
                platform: request.platform,
                provider: self.name.to_string(),
                message: "backend rejected launch".to_string(),
            });
        }

        let mut instance = CloudInstance::new(instance_id, self.platform, self.name);
        instance.state = InstanceState::Provisioning;
        instance.instance_id = format!("backend-{instance_id}");
        instance.bot_package = request.bot_package.clone();
        instance.bot_version = request.bot_version.clone();
        instance.team_id = request.team_id.clone();
        instance.tags = request.tags.clone();

        self.map().insert(instance.id.clone(), instance.clone());
        Ok(instance)
    }

    async fn get_instance(&self, instance_id: &str) -> Result<CloudInstance> {
        self.map()
            .get(instance_id)
            .cloned()
            .ok_or(CloudError::InstanceNotFound)
    }

    async fn list_instances(&self, filters: &InstanceFilters) -> Result<Vec<CloudInstance>> {
        Ok(self
            .map()
            .values()
            .filter(|i| filters.state.map_or(true, |s| i.state == s))
            .filter(|i| filters.platform.map_or(true, |p| i.platform == p))
            .cloned()
            .collect())
    }

    async fn start_instance(&self, instance_id: &str) -> Result<()> {
        self.set_state(instance_id, InstanceState::Running);
        Ok(())
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<()> {
        self.set_state(instance_id, InstanceState::Stopped);
        Ok(())
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_terminate.load(Ordering::SeqCst) {
            return Err(CloudError::Provider("terminate refused".to_string()));
        }
        self.set_state(instance_id, InstanceState::Terminated);
        Ok(())
    }

    async fn get_connection_info(&self, instance_id: &str) -> Result<ConnectionInfo> {
        let _ = self.get_instance(instance_id).await?;
        Ok(ConnectionInfo::new(ConnectionProtocol::Exec, "10.0.0.1"))
    }

    async fn execute_command(&self, instance_id: &str, _command: &str) -> Result<CommandResult> {
        let _ = self.get_instance(instance_id).await?;
        Ok(CommandResult {
            exit_code: 0,
            stdout: "ok".to_string(),
            stderr: String::new(),
        })
    }

    async fn get_logs(&self, instance_id: &str, _lines: usize) -> Result<String> {
        let _ = self.get_instance(instance_id).await?;
        Ok(String::new())
    }
}

/// Billing that always fails with a transport error.
pub struct FailBilling;

#[async_trait]
impl BillingAuthorizer for FailBilling {
    async fn authorize(&self, _: &str, _: Platform, _: &str) -> Result<BillingAuth> {
        Err(CloudError::BillingUnavailable("connection refused".to_string()))
    }

    async fn report_usage(&self, _: &str, _: Platform, _: f64, _: i64) -> Result<()> {
        Err(CloudError::BillingUnavailable("connection refused".to_string()))
    }

    async fn team_quota(&self, _: &str) -> Result<CloudQuota> {
        Err(CloudError::BillingUnavailable("connection refused".to_string()))
    }
}

/// Billing that denies every authorization with a fixed reason.
pub struct DenyBilling {
    reason: String,
}

impl DenyBilling {
    pub fn new(reason: &str) -> Self {
        Self { reason: reason.to_string() }
    }
}

#[async_trait]
impl BillingAuthorizer for DenyBilling {
    async fn authorize(&self, _: &str, _: Platform, _: &str) -> Result<BillingAuth> {
        Ok(BillingAuth {
            authorized: false,
            reason: self.reason.clone(),
            ..BillingAuth::default()
        })
    }

    async fn report_usage(&self, _: &str, _: Platform, _: f64, _: i64) -> Result<()> {
        Ok(())
    }

    async fn team_quota(&self, _: &str) -> Result<CloudQuota> {
        Ok(CloudQuota::default())
    }
}

/// Permissive billing that records usage reports and can fail on demand.
pub struct RecordingBilling {
    pub usage_calls: Mutex<Vec<(String, f64, i64)>>,
    fail_next_report: AtomicBool,
}

impl RecordingBilling {
    pub fn new() -> Self {
        Self {
            usage_calls: Mutex::new(Vec::new()),
            fail_next_report: AtomicBool::new(false),
        }
    }

    pub fn fail_next_report(&self) {
        self.fail_next_report.store(true, Ordering::SeqCst);
    }

    pub fn usage_call_count(&self) -> usize {
        self.usage_calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl BillingAuthorizer for RecordingBilling {
    async fn authorize(&self, _: &str, platform: Platform, _: &str) -> Result<BillingAuth> {
        Ok(BillingAuth {
            authorized: true,
            tier: "unlimited".to_string(),
            hourly_cents: crate::billing::platform_hourly_cents(platform),
            ..BillingAuth::default()
        })
    }

    async fn report_usage(
        &self,
        instance_id: &str,
        _platform: Platform,
        hours: f64,
        hourly_cents: i64,
    ) -> Result<()> {
        if self.fail_next_report.swap(false, Ordering::SeqCst) {
            return Err(CloudError::BillingUnavailable("usage endpoint down".to_string()));
        }
        self.usage_calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((instance_id.to_string(), hours, hourly_cents));
        Ok(())
    }

    async fn team_quota(&self, _: &str) -> Result<CloudQuota> {
        Ok(CloudQuota::default())
    }
}

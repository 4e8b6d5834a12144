//! End-to-end lifecycle scenarios over the public API, with an in-memory
//! store and fake backends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use nimbus_cloud::{CloudManager, HostAllocator, Monitor, PermissiveBilling, Provisioner};
use nimbus_core::{
    CloudConfig, CloudError, CloudInstance, CloudStore, CommandResult, ConnectionInfo,
    ConnectionProtocol, HostState, InstanceFilters, InstanceState, Platform, ProvisionRequest,
    Result, PROVIDER_IAAS,
};
use nimbus_db::{DbPool, SqliteStore};

async fn mem_store() -> Arc<dyn CloudStore> {
    let pool = DbPool::in_memory().await.unwrap();
    let store = SqliteStore::new(pool);
    store.init_schema().await.unwrap();
    Arc::new(store)
}

fn request(platform: Platform) -> ProvisionRequest {
    ProvisionRequest {
        platform,
        bot_package: "crawler".to_string(),
        bot_version: String::new(),
        instance_type: String::new(),
        team_id: "team-a".to_string(),
        tags: HashMap::new(),
        metadata: None,
    }
}

/// A fake backend covering both providers: linux instances are plain records,
/// macOS instances go through the real host allocator.
struct FakeBackend {
    name: &'static str,
    allocator: Option<HostAllocator>,
    fail_launch: AtomicBool,
    instances: Mutex<HashMap<String, CloudInstance>>,
}

impl FakeBackend {
    fn plain(name: &'static str) -> Self {
        Self {
            name,
            allocator: None,
            fail_launch: AtomicBool::new(false),
            instances: Mutex::new(HashMap::new()),
        }
    }

    fn with_allocator(name: &'static str, allocator: HostAllocator) -> Self {
        Self {
            allocator: Some(allocator),
            ..Self::plain(name)
        }
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<String, CloudInstance>> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, id: &str, state: InstanceState) {
        if let Some(instance) = self.map().get_mut(id) {
            instance.state = state;
        }
    }
}

#[async_trait]
impl Provisioner for FakeBackend {
    fn provider_name(&self) -> &'static str {
        self.name
    }

    async fn create_instance(
        &self,
        request: &ProvisionRequest,
        instance_id: &str,
    ) -> Result<CloudInstance> {
        let mut instance = CloudInstance::new(instance_id, request.platform, self.name);
        instance.state = InstanceState::Provisioning;
        instance.team_id = request.team_id.clone();
        instance.bot_package = request.bot_package.clone();

        if request.platform == Platform::MacOs {
            let allocator = self
                .allocator
                .as_ref()
                .ok_or_else(|| CloudError::Provider("no host allocator".to_string()))?;
            let host = allocator.acquire(instance_id).await?;

            if self.fail_launch.load(Ordering::SeqCst) {
                allocator.rollback(&host.id).await?;
                return Err(CloudError::ProvisioningFailed {
                    instance_id: instance_id.to_string(),
                    platform: Platform::MacOs,
                    provider: PROVIDER_IAAS.to_string(),
                    message: "insufficient capacity".to_string(),
                });
            }
            instance.dedicated_host_id = host.host_id;
        }

        self.map().insert(instance.id.clone(), instance.clone());
        Ok(instance)
    }

    async fn get_instance(&self, instance_id: &str) -> Result<CloudInstance> {
        self.map()
            .get(instance_id)
            .cloned()
            .ok_or(CloudError::InstanceNotFound)
    }

    async fn list_instances(&self, _filters: &InstanceFilters) -> Result<Vec<CloudInstance>> {
        Ok(self.map().values().cloned().collect())
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
        self.set_state(instance_id, InstanceState::Terminated);
        Ok(())
    }

    async fn get_connection_info(&self, _instance_id: &str) -> Result<ConnectionInfo> {
        Ok(ConnectionInfo::new(ConnectionProtocol::Exec, "10.0.0.1"))
    }

    async fn execute_command(&self, _instance_id: &str, _command: &str) -> Result<CommandResult> {
        Ok(CommandResult {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn get_logs(&self, _instance_id: &str, _lines: usize) -> Result<String> {
        Ok(String::new())
    }
}

fn config() -> CloudConfig {
    CloudConfig {
        enabled: true,
        ..CloudConfig::default()
    }
}

#[tokio::test]
async fn linux_instance_reaches_running_after_one_tick() {
    let store = mem_store().await;
    let manager = Arc::new(CloudManager::with_billing(
        config(),
        Some(store.clone()),
        Arc::new(PermissiveBilling),
    ));
    let backend = Arc::new(FakeBackend::plain("container"));
    manager.register_provisioner(&[Platform::Linux], backend.clone());
    let monitor = Arc::new(Monitor::new(manager.clone(), store.clone(), config()));

    let instance = manager.create_instance(&request(Platform::Linux)).await.unwrap();
    assert_eq!(instance.state, InstanceState::Provisioning);
    assert_eq!(instance.hourly_rate_cents, 1);

    // The backend comes up; one sweep reconciles the store.
    backend.set_state(&instance.id, InstanceState::Running);
    monitor.tick().await;

    let stored = store.get_cloud_instance(&instance.id).await.unwrap();
    assert_eq!(stored.state, InstanceState::Running);
    assert!(stored.provisioned_at.is_some());

    let types: Vec<String> = manager
        .events()
        .recent(0)
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert!(types.contains(&"instance.running".to_string()));
}

#[tokio::test]
async fn macos_creates_consume_hosts_until_exhausted() {
    let store = mem_store().await;
    let allocator = HostAllocator::new(store.clone(), Duration::from_secs(86_400));
    allocator
        .seed(&["h-1".to_string(), "h-2".to_string()], "mac2.metal")
        .await
        .unwrap();

    let manager = Arc::new(CloudManager::with_billing(
        config(),
        Some(store.clone()),
        Arc::new(PermissiveBilling),
    ));
    let backend = Arc::new(FakeBackend::with_allocator(
        PROVIDER_IAAS,
        HostAllocator::new(store.clone(), Duration::from_secs(86_400)),
    ));
    manager.register_provisioner(&[Platform::MacOs], backend.clone());

    let first = manager.create_instance(&request(Platform::MacOs)).await.unwrap();
    assert!(!first.dedicated_host_id.is_empty());
    assert_eq!(first.hourly_rate_cents, 120);

    let host = store
        .get_dedicated_host_by_host_id(&first.dedicated_host_id)
        .await
        .unwrap();
    assert_eq!(host.state, HostState::Allocated);
    assert_eq!(host.current_instance_id, first.id);

    let second = manager.create_instance(&request(Platform::MacOs)).await.unwrap();
    assert_ne!(second.dedicated_host_id, first.dedicated_host_id);

    let err = manager.create_instance(&request(Platform::MacOs)).await.unwrap_err();
    assert!(matches!(err, CloudError::NoAvailableHost));
}

#[tokio::test]
async fn macos_launch_failure_returns_host_to_pool() {
    let store = mem_store().await;
    let allocator = HostAllocator::new(store.clone(), Duration::from_secs(86_400));
    allocator.seed(&["h-1".to_string()], "mac2.metal").await.unwrap();

    let manager = Arc::new(CloudManager::with_billing(
        config(),
        Some(store.clone()),
        Arc::new(PermissiveBilling),
    ));
    let backend = Arc::new(FakeBackend::with_allocator(
        PROVIDER_IAAS,
        HostAllocator::new(store.clone(), Duration::from_secs(86_400)),
    ));
    backend.fail_launch.store(true, Ordering::SeqCst);
    manager.register_provisioner(&[Platform::MacOs], backend.clone());

    let err = manager.create_instance(&request(Platform::MacOs)).await.unwrap_err();
    assert!(matches!(err, CloudError::ProvisioningFailed { .. }));

    // The host went back to the pool within the same request.
    let host = store.get_dedicated_host_by_host_id("h-1").await.unwrap();
    assert_eq!(host.state, HostState::Available);
    assert!(host.current_instance_id.is_empty());

    // No instance record was persisted.
    let instances = store.list_cloud_instances(&InstanceFilters::default()).await.unwrap();
    assert!(instances.is_empty());
}

#[tokio::test]
async fn stopped_instance_can_restart_and_terminate() {
    let store = mem_store().await;
    let manager = Arc::new(CloudManager::with_billing(
        config(),
        Some(store.clone()),
        Arc::new(PermissiveBilling),
    ));
    let backend = Arc::new(FakeBackend::plain("container"));
    manager.register_provisioner(&[Platform::Linux], backend.clone());

    let instance = manager.create_instance(&request(Platform::Linux)).await.unwrap();

    manager.stop_instance(&instance.id).await.unwrap();
    assert_eq!(
        store.get_cloud_instance(&instance.id).await.unwrap().state,
        InstanceState::Stopped
    );

    manager.start_instance(&instance.id).await.unwrap();
    assert_eq!(
        store.get_cloud_instance(&instance.id).await.unwrap().state,
        InstanceState::Running
    );

    manager.terminate_instance(&instance.id).await.unwrap();
    let stored = store.get_cloud_instance(&instance.id).await.unwrap();
    assert_eq!(stored.state, InstanceState::Terminated);
    assert!(stored.terminated_at.is_some());
}

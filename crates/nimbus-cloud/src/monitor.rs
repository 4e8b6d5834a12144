//! Background reconciliation of cloud instances and dedicated hosts.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use nimbus_core::{CloudConfig, CloudError, CloudStore, HostState, InstanceFilters, InstanceState};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::events::{
    EVENT_HOST_RELEASED, EVENT_INSTANCE_FAILED, EVENT_INSTANCE_RUNNING, EVENT_INSTANCE_TERMINATED,
};
use crate::hosts::HostAllocator;
use crate::manager::CloudManager;

/// Upper bound for each reconciliation pass within a tick.
const PASS_TIMEOUT: Duration = Duration::from_secs(60);

/// Periodic sweeper over the store: stale-provisioning cleanup, state sync,
/// cost accrual and idle host release, in that order.
///
/// Cleanup runs before sync so instances it fails do not reappear in the
/// sync pass; accrual runs after sync so instances that just left `running`
/// are not charged; host release runs last so terminations in this tick
/// become eligible immediately.
pub struct Monitor {
    manager: Arc<CloudManager>,
    store: Arc<dyn CloudStore>,
    config: CloudConfig,
    allocator: HostAllocator,
    stop_tx: watch::Sender<bool>,
}

impl Monitor {
    pub fn new(manager: Arc<CloudManager>, store: Arc<dyn CloudStore>, config: CloudConfig) -> Self {
        let allocator =
            HostAllocator::new(store.clone(), config.iaas.macos.min_host_allocation());
        let (stop_tx, _) = watch::channel(false);
        Self {
            manager,
            store,
            config,
            allocator,
            stop_tx,
        }
    }

    /// Spawns the sweeper loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();

        tokio::spawn(async move {
            let period = monitor.config.monitor_interval();
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);

            info!(interval_secs = period.as_secs(), "cloud instance monitor started");
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => monitor.tick().await,
                }
            }
            info!("cloud instance monitor stopped");
        })
    }

    /// Stops the loop. Idempotent; a tick already in flight completes on
    /// its own timeline.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// One reconciliation sweep. The four passes run strictly in order.
    pub async fn tick(&self) {
        self.run_pass("cleanup_stale_provisioning", self.cleanup_stale_provisioning())
            .await;
        self.run_pass("sync_instance_states", self.sync_instance_states()).await;
        self.run_pass("accrue_usage_costs", self.accrue_usage_costs()).await;
        self.run_pass("release_idle_hosts", self.release_idle_hosts()).await;
    }

    async fn run_pass(&self, name: &str, pass: impl std::future::Future<Output = ()>) {
        if tokio::time::timeout(PASS_TIMEOUT, pass).await.is_err() {
            warn!(pass = name, "monitor pass timed out");
        }
    }

    /// Pass 1: terminate instances stuck in `provisioning` past the timeout.
    async fn cleanup_stale_provisioning(&self) {
        let filters = InstanceFilters::with_state(InstanceState::Provisioning);
        let instances = match self.store.list_cloud_instances(&filters).await {
            Ok(instances) => instances,
            Err(e) => {
                error!(error = %e, "monitor: failed to list provisioning instances");
                return;
            }
        };

        let timeout = chrono::Duration::from_std(self.config.provisioning_timeout())
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now() - timeout;

        for mut instance in instances {
            if instance.created_at >= cutoff {
                continue;
            }

            warn!(
                id = %instance.id,
                platform = %instance.platform,
                created_at = %instance.created_at,
                "terminating stale provisioning instance"
            );

            if let Err(e) = self.manager.terminate_instance(&instance.id).await {
                error!(id = %instance.id, error = %e, "failed to terminate stale instance");
                instance.state = InstanceState::Failed;
                instance.error_message = "provisioning timeout".to_string();
                instance.updated_at = Utc::now();
                if let Err(e) = self.store.update_cloud_instance(&instance).await {
                    error!(id = %instance.id, error = %e, "failed to mark instance failed");
                }
            }

            self.manager.events().emit(
                EVENT_INSTANCE_FAILED,
                &instance.id,
                Some(json!({ "reason": "provisioning_timeout" })),
            );
        }
    }

    /// Pass 2: reconcile stored state with live backend state.
    async fn sync_instance_states(&self) {
        for state in [InstanceState::Provisioning, InstanceState::Running] {
            let instances = match self
                .store
                .list_cloud_instances(&InstanceFilters::with_state(state))
                .await
            {
                Ok(instances) => instances,
                Err(e) => {
                    error!(error = %e, state = %state, "monitor: failed to list instances");
                    continue;
                }
            };

            for mut instance in instances {
                let Ok(provisioner) = self.manager.provisioner_for(instance.platform) else {
                    continue;
                };

                let live = match provisioner.get_instance(&instance.id).await {
                    Ok(live) => live,
                    Err(e) => {
                        warn!(id = %instance.id, error = %e, "monitor: could not sync instance");
                        continue;
                    }
                };

                let changed = live.state != instance.state;
                let first_running =
                    live.state == InstanceState::Running && instance.provisioned_at.is_none();
                if !changed && !first_running {
                    continue;
                }

                if changed {
                    info!(
                        id = %instance.id,
                        old_state = %instance.state,
                        new_state = %live.state,
                        "monitor: instance state changed"
                    );
                }

                let now = Utc::now();
                instance.state = live.state;
                instance.public_ip = live.public_ip;
                instance.private_ip = live.private_ip;
                instance.updated_at = now;
                if live.state == InstanceState::Terminated && instance.terminated_at.is_none() {
                    instance.terminated_at = Some(now);
                }
                if first_running {
                    instance.provisioned_at = Some(now);
                }

                if let Err(e) = self.store.update_cloud_instance(&instance).await {
                    error!(id = %instance.id, error = %e, "monitor: failed to persist synced state");
                    continue;
                }

                match instance.state {
                    InstanceState::Running => {
                        self.manager.events().emit(
                            EVENT_INSTANCE_RUNNING,
                            &instance.id,
                            serde_json::to_value(&instance).ok(),
                        );
                    }
                    InstanceState::Terminated => {
                        self.manager
                            .events()
                            .emit(EVENT_INSTANCE_TERMINATED, &instance.id, None);
                    }
                    InstanceState::Failed => {
                        self.manager
                            .events()
                            .emit(EVENT_INSTANCE_FAILED, &instance.id, None);
                    }
                    _ => {}
                }
            }
        }
    }

    /// Pass 3: accrue compute cost for running instances and report usage.
    async fn accrue_usage_costs(&self) {
        let filters = InstanceFilters::with_state(InstanceState::Running);
        let instances = match self.store.list_cloud_instances(&filters).await {
            Ok(instances) => instances,
            Err(e) => {
                error!(error = %e, "monitor: failed to list running instances for billing");
                return;
            }
        };

        let interval_hours = self.config.monitor_interval().as_secs_f64() / 3600.0;

        for mut instance in instances {
            if instance.hourly_rate_cents <= 0 {
                continue;
            }

            // Floor at one cent per tick so small rates are not rounded away.
            let cost_cents = ((instance.hourly_rate_cents as f64 * interval_hours) as i64).max(1);

            instance.accrued_cost_cents += cost_cents;
            instance.updated_at = Utc::now();
            if let Err(e) = self.store.update_cloud_instance(&instance).await {
                error!(id = %instance.id, error = %e, "monitor: failed to update accrued cost");
                continue;
            }

            if let Err(e) = self
                .manager
                .billing()
                .report_usage(
                    &instance.id,
                    instance.platform,
                    interval_hours,
                    instance.hourly_rate_cents,
                )
                .await
            {
                warn!(id = %instance.id, error = %e, "monitor: failed to report usage to billing");
            }
        }
    }

    /// Pass 4: release dedicated hosts whose instance is gone and whose idle
    /// time exceeds the release threshold.
    async fn release_idle_hosts(&self) {
        if !self.config.iaas.enabled {
            return;
        }

        let hosts = match self.store.list_dedicated_hosts().await {
            Ok(hosts) => hosts,
            Err(e) => {
                error!(error = %e, "monitor: failed to list dedicated hosts");
                return;
            }
        };

        let idle_threshold = chrono::Duration::from_std(self.config.iaas.macos.idle_host_release())
            .unwrap_or(chrono::Duration::MAX);

        for host in hosts {
            if host.state != HostState::Allocated || !host.current_instance_id.is_empty() {
                continue;
            }
            let Some(allocated_at) = host.allocated_at else {
                continue;
            };
            if Utc::now() - allocated_at <= idle_threshold {
                continue;
            }

            info!(host_id = %host.host_id, allocated_at = %allocated_at, "releasing idle dedicated host");
            match self.allocator.release(&host.id).await {
                Ok(()) => {
                    self.manager.events().emit(
                        EVENT_HOST_RELEASED,
                        "",
                        Some(json!({ "host_id": host.host_id })),
                    );
                }
                Err(CloudError::HostMinAllocation) => {
                    debug!(host_id = %host.host_id, "idle host still inside minimum allocation");
                }
                Err(e) => error!(host_id = %host.host_id, error = %e, "failed to release host"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::PermissiveBilling;
    use crate::testutil::{mem_store, request, MockProvisioner, RecordingBilling};
    use chrono::Duration as ChronoDuration;
    use nimbus_core::{CloudInstance, DedicatedHost, Platform, PROVIDER_CONTAINER};

    fn config() -> CloudConfig {
        CloudConfig {
            enabled: true,
            ..CloudConfig::default()
        }
    }

    struct Fixture {
        monitor: Arc<Monitor>,
        manager: Arc<CloudManager>,
        store: Arc<dyn CloudStore>,
        mock: Arc<MockProvisioner>,
    }

    async fn fixture(config: CloudConfig) -> Fixture {
        let store = mem_store().await;
        let manager = Arc::new(CloudManager::with_billing(
            config.clone(),
            Some(store.clone()),
            Arc::new(PermissiveBilling),
        ));
        let mock = Arc::new(MockProvisioner::new(PROVIDER_CONTAINER, Platform::Linux));
        manager.register_provisioner(&[Platform::Linux], mock.clone());
        let monitor = Arc::new(Monitor::new(manager.clone(), store.clone(), config));
        Fixture { monitor, manager, store, mock }
    }

    fn event_types(manager: &CloudManager) -> Vec<String> {
        manager.events().recent(50).into_iter().map(|e| e.event_type).collect()
    }

    #[tokio::test]
    async fn stale_provisioning_is_terminated() {
        let f = fixture(config()).await;

        let created = f.manager.create_instance(&request(Platform::Linux, "team-a")).await.unwrap();
        let mut stored = f.store.get_cloud_instance(&created.id).await.unwrap();
        stored.created_at = Utc::now() - ChronoDuration::minutes(20);
        f.store.update_cloud_instance(&stored).await.unwrap();

        f.monitor.tick().await;

        let after = f.store.get_cloud_instance(&created.id).await.unwrap();
        assert_eq!(after.state, InstanceState::Terminated);
        assert_eq!(f.mock.terminate_calls(), 1);
        assert!(event_types(&f.manager).contains(&EVENT_INSTANCE_FAILED.to_string()));
    }

    #[tokio::test]
    async fn stale_provisioning_marked_failed_when_terminate_fails() {
        let f = fixture(config()).await;

        let created = f.manager.create_instance(&request(Platform::Linux, "team-a")).await.unwrap();
        let mut stored = f.store.get_cloud_instance(&created.id).await.unwrap();
        stored.created_at = Utc::now() - ChronoDuration::minutes(20);
        f.store.update_cloud_instance(&stored).await.unwrap();

        f.mock.set_fail_terminate(true);
        f.monitor.tick().await;

        let after = f.store.get_cloud_instance(&created.id).await.unwrap();
        assert_eq!(after.state, InstanceState::Failed);
        assert_eq!(after.error_message, "provisioning timeout");
    }

    #[tokio::test]
    async fn fresh_provisioning_is_left_alone() {
        let f = fixture(config()).await;
        let created = f.manager.create_instance(&request(Platform::Linux, "team-a")).await.unwrap();

        f.monitor.tick().await;

        let after = f.store.get_cloud_instance(&created.id).await.unwrap();
        assert_eq!(after.state, InstanceState::Provisioning);
        assert_eq!(f.mock.terminate_calls(), 0);
    }

    #[tokio::test]
    async fn sync_promotes_provisioning_to_running() {
        let f = fixture(config()).await;
        let created = f.manager.create_instance(&request(Platform::Linux, "team-a")).await.unwrap();

        f.mock.set_state(&created.id, InstanceState::Running);
        f.monitor.tick().await;

        let after = f.store.get_cloud_instance(&created.id).await.unwrap();
        assert_eq!(after.state, InstanceState::Running);
        assert!(after.provisioned_at.is_some());
        assert!(event_types(&f.manager).contains(&EVENT_INSTANCE_RUNNING.to_string()));
    }

    #[tokio::test]
    async fn sync_records_backend_termination() {
        let f = fixture(config()).await;
        let created = f.manager.create_instance(&request(Platform::Linux, "team-a")).await.unwrap();

        let mut stored = f.store.get_cloud_instance(&created.id).await.unwrap();
        stored.state = InstanceState::Running;
        stored.provisioned_at = Some(Utc::now());
        f.store.update_cloud_instance(&stored).await.unwrap();
        f.mock.set_state(&created.id, InstanceState::Terminated);

        f.monitor.tick().await;

        let after = f.store.get_cloud_instance(&created.id).await.unwrap();
        assert_eq!(after.state, InstanceState::Terminated);
        assert!(after.terminated_at.is_some());
        assert!(event_types(&f.manager).contains(&EVENT_INSTANCE_TERMINATED.to_string()));
    }

    #[tokio::test]
    async fn accrual_floors_at_one_cent_and_reports() {
        let store = mem_store().await;
        let billing = Arc::new(RecordingBilling::new());
        let manager = Arc::new(CloudManager::with_billing(
            config(),
            Some(store.clone()),
            billing.clone(),
        ));
        let mock = Arc::new(MockProvisioner::new(PROVIDER_CONTAINER, Platform::Linux));
        manager.register_provisioner(&[Platform::Linux], mock.clone());
        let monitor = Arc::new(Monitor::new(manager.clone(), store.clone(), config()));

        // 1 c/h at a 30 s interval rounds to zero without the floor.
        let mut cheap = CloudInstance::new("i-cheap", Platform::Linux, PROVIDER_CONTAINER);
        cheap.state = InstanceState::Running;
        cheap.provisioned_at = Some(Utc::now());
        cheap.hourly_rate_cents = 1;
        store.create_cloud_instance(&cheap).await.unwrap();
        mock.insert(cheap);

        let mut mac_rate = CloudInstance::new("i-mac-rate", Platform::Linux, PROVIDER_CONTAINER);
        mac_rate.state = InstanceState::Running;
        mac_rate.provisioned_at = Some(Utc::now());
        mac_rate.hourly_rate_cents = 120;
        store.create_cloud_instance(&mac_rate).await.unwrap();
        mock.insert(mac_rate);

        monitor.tick().await;

        assert_eq!(store.get_cloud_instance("i-cheap").await.unwrap().accrued_cost_cents, 1);
        assert_eq!(store.get_cloud_instance("i-mac-rate").await.unwrap().accrued_cost_cents, 1);
        assert_eq!(billing.usage_call_count(), 2);

        // A reporting failure does not revert the accrual already persisted.
        billing.fail_next_report();
        monitor.tick().await;

        let cheap = store.get_cloud_instance("i-cheap").await.unwrap();
        let mac = store.get_cloud_instance("i-mac-rate").await.unwrap();
        assert_eq!(cheap.accrued_cost_cents + mac.accrued_cost_cents, 4);
    }

    #[tokio::test]
    async fn zero_rate_instances_accrue_nothing() {
        let f = fixture(config()).await;

        let mut free = CloudInstance::new("i-free", Platform::Linux, PROVIDER_CONTAINER);
        free.state = InstanceState::Running;
        free.provisioned_at = Some(Utc::now());
        f.store.create_cloud_instance(&free).await.unwrap();
        f.mock.insert(free);

        f.monitor.tick().await;

        assert_eq!(f.store.get_cloud_instance("i-free").await.unwrap().accrued_cost_cents, 0);
    }

    #[tokio::test]
    async fn idle_host_past_threshold_is_released() {
        let mut cfg = config();
        cfg.iaas.enabled = true;
        let f = fixture(cfg).await;

        let mut host = DedicatedHost::new("h-idle", "mac2.metal", Duration::from_secs(86_400));
        host.state = HostState::Allocated;
        host.allocated_at = Some(Utc::now() - ChronoDuration::hours(26));
        f.store.create_dedicated_host(&host).await.unwrap();

        f.monitor.tick().await;

        let after = f.store.get_dedicated_host(&host.id).await.unwrap();
        assert_eq!(after.state, HostState::Available);
        assert!(after.released_at.is_some());
        assert!(event_types(&f.manager).contains(&EVENT_HOST_RELEASED.to_string()));
    }

    #[tokio::test]
    async fn occupied_or_recent_hosts_are_kept() {
        let mut cfg = config();
        cfg.iaas.enabled = true;
        let f = fixture(cfg).await;

        // Still occupied: never released, whatever the idle time.
        let mut occupied = DedicatedHost::new("h-busy", "mac2.metal", Duration::from_secs(86_400));
        occupied.state = HostState::Allocated;
        occupied.current_instance_id = "i-1".to_string();
        occupied.allocated_at = Some(Utc::now() - ChronoDuration::hours(48));
        f.store.create_dedicated_host(&occupied).await.unwrap();

        // Unoccupied but inside the idle threshold.
        let mut recent = DedicatedHost::new("h-new", "mac2.metal", Duration::from_secs(86_400));
        recent.state = HostState::Allocated;
        recent.allocated_at = Some(Utc::now() - ChronoDuration::hours(1));
        f.store.create_dedicated_host(&recent).await.unwrap();

        f.monitor.tick().await;

        assert_eq!(
            f.store.get_dedicated_host(&occupied.id).await.unwrap().state,
            HostState::Allocated
        );
        assert_eq!(
            f.store.get_dedicated_host(&recent.id).await.unwrap().state,
            HostState::Allocated
        );
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let f = fixture(config()).await;
        let handle = f.monitor.start();
        f.monitor.stop();
        f.monitor.stop();
        handle.await.unwrap();
    }
}

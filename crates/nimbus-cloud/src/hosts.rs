//! Dedicated host allocation for tenancy-constrained macOS instances.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use nimbus_core::{CloudError, CloudStore, DedicatedHost, HostState, Result};
use tracing::{info, warn};

/// How many claim attempts before giving up on the fleet.
const CLAIM_ATTEMPTS: usize = 3;

/// Allocates and releases dedicated physical hosts.
///
/// The provider bills host allocation in indivisible `min_allocation`
/// periods; this allocator is the sole enforcer of that floor. Mutual
/// exclusion between concurrent acquisitions comes from the store's
/// conditional claim.
pub struct HostAllocator {
    store: Arc<dyn CloudStore>,
    min_allocation: Duration,
}

impl HostAllocator {
    pub fn new(store: Arc<dyn CloudStore>, min_allocation: Duration) -> Self {
        Self { store, min_allocation }
    }

    /// Claims an available host for the instance. Retries a bounded number
    /// of times when another acquisition wins the race for the same host.
    pub async fn acquire(&self, instance_id: &str) -> Result<DedicatedHost> {
        for _ in 0..CLAIM_ATTEMPTS {
            let host = self.store.get_available_dedicated_host().await?;
            let now = Utc::now();
            if self.store.claim_dedicated_host(&host.id, instance_id, now).await? {
                info!(host_id = %host.host_id, instance = instance_id, "acquired dedicated host");
                return self.store.get_dedicated_host(&host.id).await;
            }
            warn!(host_id = %host.host_id, "lost dedicated host claim race, retrying");
        }
        Err(CloudError::NoAvailableHost)
    }

    /// Returns a host to the available pool. Refused while the host is
    /// still inside its minimum allocation period.
    pub async fn release(&self, host_db_id: &str) -> Result<()> {
        let mut host = self.store.get_dedicated_host(host_db_id).await?;

        if let Some(allocated_at) = host.allocated_at {
            let held = (Utc::now() - allocated_at).to_std().unwrap_or(Duration::ZERO);
            if held < host.min_allocation {
                return Err(CloudError::HostMinAllocation);
            }
        }

        let now = Utc::now();
        host.state = HostState::Available;
        host.current_instance_id = String::new();
        host.released_at = Some(now);
        host.updated_at = now;
        self.store.update_dedicated_host(&host).await?;

        info!(host_id = %host.host_id, "released dedicated host");
        Ok(())
    }

    /// Detaches the instance from the host without releasing it. Used when
    /// the instance terminates before the minimum allocation period has
    /// elapsed: the host stays `allocated` (and billed) but becomes eligible
    /// for the monitor's idle release once the threshold passes.
    pub async fn detach(&self, host_db_id: &str) -> Result<()> {
        let mut host = self.store.get_dedicated_host(host_db_id).await?;
        host.current_instance_id = String::new();
        host.updated_at = Utc::now();
        self.store.update_dedicated_host(&host).await
    }

    /// Rolls back a claim made moments ago for a launch that failed. The
    /// minimum allocation floor does not apply: the host never ran anything.
    pub async fn rollback(&self, host_db_id: &str) -> Result<()> {
        let mut host = self.store.get_dedicated_host(host_db_id).await?;
        host.state = HostState::Available;
        host.current_instance_id = String::new();
        host.allocated_at = None;
        host.updated_at = Utc::now();
        self.store.update_dedicated_host(&host).await?;

        info!(host_id = %host.host_id, "rolled back dedicated host claim");
        Ok(())
    }

    /// Seeds the store with configured host ids. Idempotent: hosts that
    /// already exist are left untouched.
    pub async fn seed(&self, host_ids: &[String], instance_type: &str) -> Result<()> {
        for host_id in host_ids {
            match self.store.get_dedicated_host_by_host_id(host_id).await {
                Ok(_) => continue,
                Err(CloudError::HostNotFound(_)) => {}
                Err(e) => return Err(e),
            }

            let host = DedicatedHost::new(host_id.clone(), instance_type, self.min_allocation);
            match self.store.create_dedicated_host(&host).await {
                Ok(()) => info!(host_id, "seeded dedicated host record"),
                Err(e) => warn!(host_id, error = %e, "failed to seed dedicated host"),
            }
        }
        Ok(())
    }
}

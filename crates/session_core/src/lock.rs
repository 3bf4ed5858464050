use std::time::Duration;

use anyhow::Result;
use shared::domain::{LeaseRecord, TenantId, WorkerId};
use storage::{now_ms, Storage};
use tracing::{debug, error, info, warn};

use crate::schedule::ScheduledTask;

/// Per-tenant exclusive lease held by one worker.
#[derive(Clone)]
pub struct DistributedLock {
    storage: Storage,
    worker_id: WorkerId,
    ttl_seconds: u64,
}

impl DistributedLock {
    pub fn new(storage: Storage, worker_id: WorkerId, ttl_seconds: u64) -> Self {
        Self {
            storage,
            worker_id,
            ttl_seconds,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn ttl_seconds(&self) -> u64 {
        self.ttl_seconds
    }

    /// Acquires the lease, or refreshes it when this worker already owns it.
    pub async fn acquire(&self, tenant_id: &TenantId) -> Result<bool> {
        let acquired = self
            .storage
            .try_acquire_lease(tenant_id, &self.worker_id, self.ttl_seconds, now_ms())
            .await?;
        if acquired {
            info!(
                tenant_id = %tenant_id,
                worker_id = %self.worker_id,
                ttl_seconds = self.ttl_seconds,
                "lock: acquired"
            );
        } else {
            debug!(
                tenant_id = %tenant_id,
                worker_id = %self.worker_id,
                "lock: held by another worker"
            );
        }
        Ok(acquired)
    }

    pub async fn renew(&self, tenant_id: &TenantId) -> Result<bool> {
        self.storage
            .renew_lease(tenant_id, &self.worker_id, self.ttl_seconds, now_ms())
            .await
    }

    pub async fn release(&self, tenant_id: &TenantId) -> Result<bool> {
        let released = self
            .storage
            .release_lease(tenant_id, &self.worker_id)
            .await?;
        if released {
            info!(tenant_id = %tenant_id, worker_id = %self.worker_id, "lock: released");
        } else {
            debug!(
                tenant_id = %tenant_id,
                worker_id = %self.worker_id,
                "lock: release skipped, not the owner"
            );
        }
        Ok(released)
    }

    pub async fn force_release(&self, tenant_id: &TenantId) -> Result<Option<WorkerId>> {
        let previous = self.storage.force_release_lease(tenant_id).await?;
        if let Some(previous_owner) = &previous {
            warn!(
                tenant_id = %tenant_id,
                previous_owner = %previous_owner,
                released_by = %self.worker_id,
                "lock: force released"
            );
        }
        Ok(previous)
    }

    /// Health cleanup: drops the lease only if it is still expired.
    pub async fn force_release_expired(&self, tenant_id: &TenantId) -> Result<Option<WorkerId>> {
        let previous = self
            .storage
            .release_expired_lease(tenant_id, now_ms())
            .await?;
        if let Some(previous_owner) = &previous {
            info!(
                tenant_id = %tenant_id,
                previous_owner = %previous_owner,
                released_by = %self.worker_id,
                "lock: expired lease cleaned up"
            );
        }
        Ok(previous)
    }

    pub async fn current(&self, tenant_id: &TenantId) -> Result<Option<LeaseRecord>> {
        self.storage.load_lease(tenant_id).await
    }

    pub async fn list(&self) -> Result<Vec<LeaseRecord>> {
        self.storage.list_leases().await
    }

    pub async fn is_owned(&self, tenant_id: &TenantId) -> Result<bool> {
        Ok(self
            .current(tenant_id)
            .await?
            .is_some_and(|lease| lease.worker_id == self.worker_id && !lease.is_expired(now_ms())))
    }

    /// Renews every `interval` until a renewal is refused or fails, then
    /// calls `on_lost` once and stops.
    pub fn spawn_renewal<F>(&self, tenant_id: TenantId, interval: Duration, on_lost: F) -> ScheduledTask
    where
        F: FnOnce() + Send + 'static,
    {
        let lock = self.clone();
        ScheduledTask::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                match lock.renew(&tenant_id).await {
                    Ok(true) => {
                        debug!(tenant_id = %tenant_id, "lock: renewed");
                    }
                    Ok(false) => {
                        warn!(
                            tenant_id = %tenant_id,
                            worker_id = %lock.worker_id,
                            "lock: renewal refused, lease lost"
                        );
                        break;
                    }
                    Err(err) => {
                        error!(
                            tenant_id = %tenant_id,
                            error = %err,
                            "lock: renewal failed"
                        );
                        break;
                    }
                }
            }
            on_lost();
        })
    }
}

#[cfg(test)]
#[path = "tests/lock_tests.rs"]
mod tests;

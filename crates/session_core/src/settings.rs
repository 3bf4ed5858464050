use std::time::Duration;

use shared::domain::{TenantId, WorkerId};

/// Runtime knobs for one worker's session subsystem.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub worker_id: WorkerId,
    pub max_sessions_per_worker: usize,
    pub claim_interval: Duration,
    pub auto_claim: bool,
    pub available_tenants: Vec<TenantId>,
    pub default_tenant_id: TenantId,

    pub lock_ttl_seconds: u64,
    pub min_renewal_interval: Duration,

    pub max_reconnect_attempts: u32,
    pub base_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub reconnect_jitter: Duration,
    pub stability_delay: Duration,
    pub inter_send_delay: Duration,
    pub queue_timeout: Duration,

    pub credential_ttl: Duration,
    pub clear_auth_on_conflict: bool,
    pub inbound_dedupe_ttl_seconds: u64,
    pub route_ttl: Duration,
    pub address_domain: String,

    pub health_check_interval: Duration,
    pub max_session_age: Duration,
    pub enforce_lock_ownership: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            worker_id: WorkerId::new("local-worker"),
            max_sessions_per_worker: 10,
            claim_interval: Duration::from_secs(60),
            auto_claim: true,
            available_tenants: Vec::new(),
            default_tenant_id: TenantId::new("default"),
            lock_ttl_seconds: 300,
            min_renewal_interval: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            base_reconnect_delay: Duration::from_millis(5_000),
            max_reconnect_delay: Duration::from_millis(60_000),
            reconnect_jitter: Duration::from_millis(1_000),
            stability_delay: Duration::from_millis(30_000),
            inter_send_delay: Duration::from_millis(100),
            queue_timeout: Duration::from_millis(60_000),
            credential_ttl: Duration::from_secs(30 * 24 * 60 * 60),
            clear_auth_on_conflict: true,
            inbound_dedupe_ttl_seconds: 60,
            route_ttl: Duration::from_secs(5 * 60),
            address_domain: "s.whatsapp.net".to_string(),
            health_check_interval: Duration::from_secs(30),
            max_session_age: Duration::from_secs(60 * 60),
            enforce_lock_ownership: false,
        }
    }
}

impl SessionSettings {
    /// Renewal runs at half the lease lifetime, never more often than the floor.
    pub fn renewal_interval(&self) -> Duration {
        let half_ttl = Duration::from_millis(self.lock_ttl_seconds.saturating_mul(500));
        half_ttl.max(self.min_renewal_interval)
    }

    /// Tenants this worker is configured to serve when nobody holds them.
    pub fn configured_tenants(&self) -> Vec<TenantId> {
        if self.available_tenants.is_empty() {
            vec![self.default_tenant_id.clone()]
        } else {
            self.available_tenants.clone()
        }
    }
}

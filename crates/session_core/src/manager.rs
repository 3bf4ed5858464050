use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{bail, Context, Result};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{TenantId, WorkerId},
    protocol::{
        ConnectionState, OutboundContent, SendReceipt, SessionEvent, SessionStatus, WorkerStatus,
    },
};
use storage::{now_ms, Storage};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::{
    cipher::Cipher,
    connection::{ConnectionContext, SessionConnection},
    credentials::CredentialStore,
    error::SendError,
    lock::DistributedLock,
    schedule::ScheduledTask,
    settings::SessionSettings,
    socket::SocketConnector,
};

const EVENT_BUFFER: usize = 256;

/// Connections currently owned by this worker, keyed by tenant.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<TenantId, Arc<SessionConnection>>>,
}

impl SessionRegistry {
    pub async fn insert(&self, conn: Arc<SessionConnection>) -> Option<Arc<SessionConnection>> {
        self.sessions
            .write()
            .await
            .insert(conn.tenant_id().clone(), conn)
    }

    pub async fn remove(&self, tenant_id: &TenantId) -> Option<Arc<SessionConnection>> {
        self.sessions.write().await.remove(tenant_id)
    }

    /// Removes the entry only if it is still `conn`, so a replacement
    /// registered in the meantime survives.
    pub async fn remove_exact(&self, conn: &Arc<SessionConnection>) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(conn.tenant_id()) {
            Some(current) if Arc::ptr_eq(current, conn) => {
                sessions.remove(conn.tenant_id());
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, tenant_id: &TenantId) -> Option<Arc<SessionConnection>> {
        self.sessions.read().await.get(tenant_id).cloned()
    }

    pub async fn contains(&self, tenant_id: &TenantId) -> bool {
        self.sessions.read().await.contains_key(tenant_id)
    }

    /// All registered connections ordered by tenant id.
    pub async fn snapshot(&self) -> Vec<Arc<SessionConnection>> {
        let mut sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by(|a, b| a.tenant_id().cmp(b.tenant_id()));
        sessions
    }

    pub async fn drain(&self) -> Vec<Arc<SessionConnection>> {
        self.sessions.write().await.drain().map(|(_, conn)| conn).collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimOutcome {
    Claimed,
    AlreadyActive,
    InProgress,
    /// Another worker holds the lease, or setup failed. The next scan retries.
    Unavailable,
    AtCapacity,
    ShuttingDown,
}

impl ClaimOutcome {
    /// Whether the tenant is served by this worker after the call.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Claimed | Self::AlreadyActive)
    }
}

/// Per-worker owner of tenant sessions: discovery, claiming, routing sends
/// and shutdown.
pub struct SessionManager {
    ctx: ConnectionContext,
    registry: SessionRegistry,
    claims_in_flight: Mutex<HashSet<TenantId>>,
    shutting_down: AtomicBool,
    tasks: Mutex<Vec<ScheduledTask>>,
}

impl SessionManager {
    pub fn new(
        settings: SessionSettings,
        storage: Storage,
        cipher: Arc<dyn Cipher>,
        connector: Arc<dyn SocketConnector>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let lock = DistributedLock::new(
            storage.clone(),
            settings.worker_id.clone(),
            settings.lock_ttl_seconds,
        );
        let credentials = CredentialStore::new(storage.clone(), cipher, settings.credential_ttl);
        Arc::new(Self {
            ctx: ConnectionContext {
                settings: Arc::new(settings),
                storage,
                lock,
                credentials,
                connector,
                events,
            },
            registry: SessionRegistry::default(),
            claims_in_flight: Mutex::new(HashSet::new()),
            shutting_down: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.ctx.events.subscribe()
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.ctx.settings.worker_id
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.ctx.settings
    }

    pub fn storage(&self) -> &Storage {
        &self.ctx.storage
    }

    pub fn lock(&self) -> &DistributedLock {
        &self.ctx.lock
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Starts the retirement listener and, with auto-claim on, runs one
    /// discovery scan and keeps scanning every `claim_interval`.
    pub async fn start(self: &Arc<Self>) {
        let settings = &self.ctx.settings;
        info!(
            worker_id = %settings.worker_id,
            max_sessions = settings.max_sessions_per_worker,
            claim_interval_secs = settings.claim_interval.as_secs(),
            auto_claim = settings.auto_claim,
            "manager: starting"
        );

        let mut tasks = Vec::new();
        tasks.push(self.spawn_retirement_listener());

        if settings.auto_claim {
            self.discover_and_claim().await;
            let weak = Arc::downgrade(self);
            tasks.push(ScheduledTask::every(settings.claim_interval, move || {
                let weak = weak.clone();
                async move {
                    let Some(manager) = weak.upgrade() else {
                        return false;
                    };
                    if manager.is_shutting_down() {
                        return false;
                    }
                    manager.discover_and_claim().await;
                    true
                }
            }));
        }
        self.tasks.lock().await.extend(tasks);
    }

    fn spawn_retirement_listener(self: &Arc<Self>) -> ScheduledTask {
        let weak = Arc::downgrade(self);
        let mut events = self.subscribe();
        ScheduledTask::spawn(async move {
            loop {
                let tenant_id = match events.recv().await {
                    Ok(SessionEvent::Terminal { tenant_id, reason }) if reason.retires_session() => {
                        tenant_id
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "manager: session event listener lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                let Some(manager) = weak.upgrade() else {
                    return;
                };
                manager.deregister_retired(&tenant_id).await;
            }
        })
    }

    async fn deregister_retired(&self, tenant_id: &TenantId) {
        let Some(conn) = self.registry.get(tenant_id).await else {
            return;
        };
        if conn.is_retired().await && self.registry.remove_exact(&conn).await {
            let remaining = self.registry.len().await;
            info!(
                tenant_id = %tenant_id,
                worker_id = %self.worker_id(),
                remaining,
                "manager: retired session deregistered"
            );
        }
    }

    /// Tenants this worker may try to claim right now: expired leases, our
    /// own leases without a local connection (restart recovery) and
    /// configured tenants nobody holds.
    pub async fn claimable_tenants(&self, now_ms: i64) -> Result<Vec<TenantId>> {
        let leases = self.ctx.lock.list().await?;
        let mut candidates: Vec<TenantId> = Vec::new();

        for lease in &leases {
            if self.registry.contains(&lease.tenant_id).await {
                continue;
            }
            if lease.is_expired(now_ms) || lease.worker_id == *self.worker_id() {
                candidates.push(lease.tenant_id.clone());
            }
        }

        let held: HashMap<&TenantId, bool> = leases
            .iter()
            .map(|lease| (&lease.tenant_id, lease.is_expired(now_ms)))
            .collect();
        for tenant_id in self.ctx.settings.configured_tenants() {
            if self.registry.contains(&tenant_id).await {
                continue;
            }
            if matches!(held.get(&tenant_id), Some(false)) || candidates.contains(&tenant_id) {
                continue;
            }
            candidates.push(tenant_id);
        }
        Ok(candidates)
    }

    /// One discovery pass. Returns the tenants claimed by it.
    pub async fn discover_and_claim(self: &Arc<Self>) -> Vec<TenantId> {
        if self.is_shutting_down() {
            return Vec::new();
        }
        let candidates = match self.claimable_tenants(now_ms()).await {
            Ok(candidates) => candidates,
            Err(err) => {
                error!(worker_id = %self.worker_id(), error = %err, "manager: discovery scan failed");
                return Vec::new();
            }
        };

        let mut claimed = Vec::new();
        for tenant_id in &candidates {
            if self.registry.len().await >= self.ctx.settings.max_sessions_per_worker {
                break;
            }
            if self.claim_session(tenant_id).await == ClaimOutcome::Claimed {
                claimed.push(tenant_id.clone());
            }
        }
        let active = self.registry.len().await;
        debug!(
            worker_id = %self.worker_id(),
            candidates = candidates.len(),
            claimed = claimed.len(),
            active,
            "manager: discovery scan completed"
        );
        claimed
    }

    /// Claims `tenant_id` for this worker unless it is already served here.
    ///
    /// A failed claim is dropped quietly; the next discovery scan retries.
    pub async fn claim_session(self: &Arc<Self>, tenant_id: &TenantId) -> ClaimOutcome {
        if self.is_shutting_down() {
            return ClaimOutcome::ShuttingDown;
        }

        {
            let mut in_flight = self.claims_in_flight.lock().await;
            if in_flight.contains(tenant_id) {
                return ClaimOutcome::InProgress;
            }
            // Checked under the in-flight guard so a claim that just finished
            // registering is seen here.
            if let Some(existing) = self.registry.get(tenant_id).await {
                if existing.state().await != ConnectionState::ClosedTerminal {
                    debug!(tenant_id = %tenant_id, "manager: claim skipped, already active");
                    return ClaimOutcome::AlreadyActive;
                }
                self.registry.remove_exact(&existing).await;
                info!(
                    tenant_id = %tenant_id,
                    "manager: replacing terminally closed session"
                );
            }
            let active = self.registry.len().await;
            let limit = self.ctx.settings.max_sessions_per_worker;
            if active + in_flight.len() >= limit {
                warn!(
                    tenant_id = %tenant_id,
                    worker_id = %self.worker_id(),
                    active,
                    limit,
                    "manager: claim refused, worker at capacity"
                );
                return ClaimOutcome::AtCapacity;
            }
            in_flight.insert(tenant_id.clone());
        }

        let conn = SessionConnection::new(tenant_id.clone(), self.ctx.clone());
        let outcome = if !conn.initialize().await {
            info!(
                tenant_id = %tenant_id,
                worker_id = %self.worker_id(),
                "manager: claim failed, will retry on next scan"
            );
            ClaimOutcome::Unavailable
        } else if self.is_shutting_down() {
            if let Err(err) = conn.disconnect().await {
                warn!(tenant_id = %tenant_id, error = %err, "manager: disconnect during shutdown failed");
            }
            ClaimOutcome::ShuttingDown
        } else {
            if let Some(previous) = self.registry.insert(conn).await {
                warn!(tenant_id = %tenant_id, "manager: claim displaced a registered session");
                if let Err(err) = previous.disconnect().await {
                    warn!(tenant_id = %tenant_id, error = %err, "manager: displaced session disconnect failed");
                }
                // Both sessions share this worker's lease; take it back for the survivor.
                if let Err(err) = self.ctx.lock.acquire(tenant_id).await {
                    warn!(tenant_id = %tenant_id, error = %err, "manager: lease re-acquire failed");
                }
            }
            let active = self.registry.len().await;
            info!(
                tenant_id = %tenant_id,
                worker_id = %self.worker_id(),
                active,
                "manager: session claimed"
            );
            ClaimOutcome::Claimed
        };

        self.claims_in_flight.lock().await.remove(tenant_id);
        outcome
    }

    /// Disconnects and deregisters. The entry is removed even when the
    /// disconnect fails. Returns `false` when nothing was registered.
    pub async fn release_session(&self, tenant_id: &TenantId) -> Result<bool> {
        let Some(conn) = self.registry.remove(tenant_id).await else {
            return Ok(false);
        };
        conn.disconnect()
            .await
            .with_context(|| format!("failed to disconnect session for tenant '{tenant_id}'"))?;
        let remaining = self.registry.len().await;
        info!(
            tenant_id = %tenant_id,
            worker_id = %self.worker_id(),
            remaining,
            "manager: session released"
        );
        Ok(true)
    }

    pub async fn enqueue(
        &self,
        tenant_id: &TenantId,
        target: &str,
        content: OutboundContent,
    ) -> Result<SendReceipt, SendError> {
        let Some(conn) = self.registry.get(tenant_id).await else {
            return Err(SendError::NotConnected);
        };
        conn.send_message(target, content).await
    }

    pub async fn status(&self, tenant_id: &TenantId) -> Option<SessionStatus> {
        match self.registry.get(tenant_id).await {
            Some(conn) => Some(conn.status().await),
            None => None,
        }
    }

    pub async fn worker_status(&self) -> WorkerStatus {
        let mut sessions = Vec::new();
        for conn in self.registry.snapshot().await {
            sessions.push(conn.status().await);
        }
        WorkerStatus {
            worker_id: self.worker_id().clone(),
            session_count: sessions.len(),
            sessions,
            max_sessions: self.ctx.settings.max_sessions_per_worker,
            is_shutting_down: self.is_shutting_down(),
        }
    }

    pub async fn pairing_code(&self, tenant_id: &TenantId) -> Option<String> {
        match self.registry.get(tenant_id).await {
            Some(conn) => conn.pairing_code().await,
            None => None,
        }
    }

    /// Drops a tenant's stored credentials so the next claim pairs again.
    /// Refused while this worker serves the tenant.
    pub async fn clear_credentials(&self, tenant_id: &TenantId) -> Result<u64> {
        if self.registry.contains(tenant_id).await {
            bail!("tenant '{tenant_id}' has an active session on this worker; release it first");
        }
        let removed = self.ctx.credentials.clear(tenant_id).await?;
        info!(
            tenant_id = %tenant_id,
            worker_id = %self.worker_id(),
            removed,
            "manager: stored credentials cleared"
        );
        Ok(removed)
    }

    /// Stops discovery and disconnects every session concurrently.
    /// Individual failures are logged and do not abort the shutdown.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.tasks.lock().await.clear();

        let sessions = self.registry.drain().await;
        let count = sessions.len();
        let results = join_all(sessions.iter().map(|conn| conn.disconnect())).await;
        for (conn, result) in sessions.iter().zip(results) {
            if let Err(err) = result {
                error!(
                    tenant_id = %conn.tenant_id(),
                    worker_id = %self.worker_id(),
                    error = %err,
                    "manager: disconnect during shutdown failed"
                );
            }
        }
        info!(
            worker_id = %self.worker_id(),
            sessions = count,
            "manager: shutdown complete"
        );
    }
}

#[cfg(test)]
#[path = "tests/manager_tests.rs"]
mod tests;

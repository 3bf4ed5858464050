use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use anyhow::Result;
use shared::{
    domain::{LeaseRecord, TenantId},
    protocol::{
        ConnectionState, HealthIssue, HealthStatus, HealthSummary, SessionHealth, SessionStatus,
    },
};
use storage::now_ms;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::{manager::SessionManager, schedule::ScheduledTask};

/// Reconciles this worker's registry against the shared lease table.
pub struct HealthMonitor {
    manager: Arc<SessionManager>,
    last_summary: RwLock<Option<HealthSummary>>,
}

impl HealthMonitor {
    pub fn new(manager: Arc<SessionManager>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            last_summary: RwLock::new(None),
        })
    }

    /// One entry per local session, then one per lease with no local
    /// session (orphaned, or expired and reclaimable).
    pub async fn detailed_status(&self) -> Result<Vec<SessionHealth>> {
        let now = now_ms();
        let leases = self.manager.lock().list().await?;
        let by_tenant: HashMap<&TenantId, &LeaseRecord> =
            leases.iter().map(|lease| (&lease.tenant_id, lease)).collect();

        let mut report = Vec::new();
        let sessions = self.manager.registry().snapshot().await;
        for conn in &sessions {
            let status = conn.status().await;
            let lease = by_tenant.get(conn.tenant_id()).copied();
            report.push(self.assess_session(&status, lease, now));
        }

        for lease in &leases {
            if sessions.iter().any(|conn| conn.tenant_id() == &lease.tenant_id) {
                continue;
            }
            report.push(self.assess_unattached_lease(lease, now));
        }
        Ok(report)
    }

    fn assess_session(
        &self,
        status: &SessionStatus,
        lease: Option<&LeaseRecord>,
        now: i64,
    ) -> SessionHealth {
        let settings = self.manager.settings();
        let open = status.connection_state == ConnectionState::Open;
        let mut issues = Vec::new();

        if !status.is_connected && status.connection_state != ConnectionState::Connecting {
            issues.push(HealthIssue::NotConnected);
        }

        // A live open connection outranks lease bookkeeping unless ownership
        // is enforced.
        let owner_matches = lease.is_some_and(|lease| lease.worker_id == *self.manager.worker_id());
        let lock_owned = owner_matches || (open && !settings.enforce_lock_ownership);
        if !lock_owned {
            issues.push(HealthIssue::LockNotOwned);
        } else if !owner_matches {
            issues.push(HealthIssue::LockOwnershipWarning);
        }

        let max_age_ms = i64::try_from(settings.max_session_age.as_millis()).unwrap_or(i64::MAX);
        if lease.is_some_and(|lease| lease.age_ms(now) > max_age_ms) {
            issues.push(HealthIssue::SessionTooOld);
        }

        let status_level = if issues
            .iter()
            .any(|issue| matches!(issue, HealthIssue::LockNotOwned | HealthIssue::NotConnected))
        {
            HealthStatus::Error
        } else if issues.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Warning
        };

        SessionHealth {
            tenant_id: status.tenant_id.clone(),
            worker_id: lease.map(|lease| lease.worker_id.clone()),
            connection_state: Some(status.connection_state),
            is_connected: status.is_connected,
            lock_owned,
            last_seen_ms: lease.map_or(0, |lease| lease.acquired_at_ms),
            qr_available: status.qr_available,
            status: status_level,
            issues,
        }
    }

    fn assess_unattached_lease(&self, lease: &LeaseRecord, now: i64) -> SessionHealth {
        let expired = lease.is_expired(now);
        SessionHealth {
            tenant_id: lease.tenant_id.clone(),
            worker_id: Some(lease.worker_id.clone()),
            connection_state: None,
            is_connected: false,
            lock_owned: lease.worker_id == *self.manager.worker_id(),
            last_seen_ms: lease.acquired_at_ms,
            qr_available: false,
            status: if expired {
                HealthStatus::Error
            } else {
                HealthStatus::Warning
            },
            issues: vec![if expired {
                HealthIssue::ExpiredLock
            } else {
                HealthIssue::OrphanedLock
            }],
        }
    }

    pub async fn summary(&self) -> Result<HealthSummary> {
        let report = self.detailed_status().await?;
        Ok(self.record_summary(&report).await)
    }

    pub async fn last_summary(&self) -> Option<HealthSummary> {
        self.last_summary.read().await.clone()
    }

    async fn record_summary(&self, report: &[SessionHealth]) -> HealthSummary {
        let summary = summarize(report, now_ms());
        *self.last_summary.write().await = Some(summary.clone());
        summary
    }

    /// Logs the current picture, enforces lease ownership when configured
    /// and cleans up expired leases and inbound dedupe rows.
    pub async fn run_check(&self) -> Result<HealthSummary> {
        let report = self.detailed_status().await?;
        let summary = self.record_summary(&report).await;
        info!(
            worker_id = %self.manager.worker_id(),
            total = summary.total_sessions,
            healthy = summary.healthy_sessions,
            warning = summary.warning_sessions,
            error = summary.error_sessions,
            orphaned_locks = summary.orphaned_locks,
            expired_locks = summary.expired_locks,
            "health: check completed"
        );

        for entry in report
            .iter()
            .filter(|entry| entry.status == HealthStatus::Error)
            .chain(report.iter().filter(|entry| entry.status == HealthStatus::Warning))
        {
            warn!(
                tenant_id = %entry.tenant_id,
                worker_id = ?entry.worker_id,
                status = ?entry.status,
                issues = ?entry.issues,
                connection_state = ?entry.connection_state,
                is_connected = entry.is_connected,
                lock_owned = entry.lock_owned,
                "health: session issue"
            );
        }

        if self.manager.settings().enforce_lock_ownership {
            self.release_split_brain_sessions(&report).await;
        }
        if summary.expired_locks > 0 {
            self.cleanup_expired_locks(&report).await;
        }
        self.purge_inbound_dedupe().await;
        Ok(summary)
    }

    /// Local sessions still connected while another worker holds the lease.
    async fn release_split_brain_sessions(&self, report: &[SessionHealth]) {
        for entry in report.iter().filter(|entry| {
            entry.connection_state.is_some()
                && entry.is_connected
                && entry.issues.contains(&HealthIssue::LockNotOwned)
        }) {
            error!(
                tenant_id = %entry.tenant_id,
                worker_id = %self.manager.worker_id(),
                lease_owner = ?entry.worker_id,
                "health: connected without owning the lease, releasing locally"
            );
            if let Err(err) = self.manager.release_session(&entry.tenant_id).await {
                error!(tenant_id = %entry.tenant_id, error = %err, "health: local release failed");
            }
        }
    }

    async fn cleanup_expired_locks(&self, report: &[SessionHealth]) {
        let mut cleaned = 0usize;
        for entry in report
            .iter()
            .filter(|entry| entry.issues.contains(&HealthIssue::ExpiredLock))
        {
            match self
                .manager
                .lock()
                .force_release_expired(&entry.tenant_id)
                .await
            {
                Ok(Some(_)) => cleaned += 1,
                Ok(None) => {}
                Err(err) => error!(
                    tenant_id = %entry.tenant_id,
                    error = %err,
                    "health: expired lease cleanup failed"
                ),
            }
        }
        if cleaned > 0 {
            info!(cleaned, "health: expired leases cleaned up");
        }
    }

    async fn purge_inbound_dedupe(&self) {
        match self.manager.storage().purge_expired_inbound(now_ms()).await {
            Ok(0) => {}
            Ok(purged) => info!(purged, "health: expired inbound events purged"),
            Err(err) => error!(error = %err, "health: inbound event purge failed"),
        }
    }

    /// No session in error and the shared store answers.
    pub async fn is_healthy(&self) -> bool {
        let summary = match self.summary().await {
            Ok(summary) => summary,
            Err(err) => {
                error!(error = %err, "health: overall check failed");
                return false;
            }
        };
        let store_ok = match self.manager.storage().health_check().await {
            Ok(()) => true,
            Err(err) => {
                error!(error = %err, "health: shared store unreachable");
                false
            }
        };
        summary.error_sessions == 0 && store_ok
    }

    /// Flat gauge map for scrapers.
    pub async fn metrics(&self) -> Result<BTreeMap<String, i64>> {
        let report = self.detailed_status().await?;
        let summary = self.record_summary(&report).await;

        let count = |value: usize| i64::try_from(value).unwrap_or(i64::MAX);
        let mut metrics = BTreeMap::from([
            ("whatsapp_sessions_total".to_string(), count(summary.total_sessions)),
            ("whatsapp_sessions_healthy".to_string(), count(summary.healthy_sessions)),
            ("whatsapp_sessions_warning".to_string(), count(summary.warning_sessions)),
            ("whatsapp_sessions_error".to_string(), count(summary.error_sessions)),
            ("whatsapp_locks_orphaned".to_string(), count(summary.orphaned_locks)),
            ("whatsapp_locks_expired".to_string(), count(summary.expired_locks)),
            ("whatsapp_health_check_timestamp".to_string(), summary.timestamp_ms),
        ]);
        for entry in &report {
            let prefix = format!("whatsapp_session_{}", entry.tenant_id);
            metrics.insert(format!("{prefix}_connected"), i64::from(entry.is_connected));
            metrics.insert(format!("{prefix}_lock_owned"), i64::from(entry.lock_owned));
            metrics.insert(
                format!("{prefix}_status"),
                match entry.status {
                    HealthStatus::Healthy => 2,
                    HealthStatus::Warning => 1,
                    HealthStatus::Error => 0,
                },
            );
            metrics.insert(format!("{prefix}_issues_count"), count(entry.issues.len()));
        }
        Ok(metrics)
    }

    /// Runs `run_check` every `health_check_interval` until the manager
    /// shuts down.
    pub fn spawn(self: &Arc<Self>) -> ScheduledTask {
        let monitor = Arc::clone(self);
        let interval = self.manager.settings().health_check_interval;
        info!(interval_secs = interval.as_secs(), "health: monitoring started");
        ScheduledTask::every(interval, move || {
            let monitor = Arc::clone(&monitor);
            async move {
                if monitor.manager.is_shutting_down() {
                    return false;
                }
                if let Err(err) = monitor.run_check().await {
                    error!(error = %err, "health: check failed");
                }
                true
            }
        })
    }
}

fn summarize(report: &[SessionHealth], timestamp_ms: i64) -> HealthSummary {
    let with_status = |status: HealthStatus| report.iter().filter(|e| e.status == status).count();
    let with_issue = |issue: HealthIssue| {
        report
            .iter()
            .filter(|e| e.issues.contains(&issue))
            .count()
    };
    HealthSummary {
        total_sessions: report.len(),
        healthy_sessions: with_status(HealthStatus::Healthy),
        warning_sessions: with_status(HealthStatus::Warning),
        error_sessions: with_status(HealthStatus::Error),
        orphaned_locks: with_issue(HealthIssue::OrphanedLock),
        expired_locks: with_issue(HealthIssue::ExpiredLock),
        timestamp_ms,
    }
}

#[cfg(test)]
#[path = "tests/health_tests.rs"]
mod tests;

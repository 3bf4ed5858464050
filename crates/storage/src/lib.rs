use anyhow::{Context, Result};
use chrono::Utc;
use shared::domain::{LeaseRecord, TenantId, WorkerId};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

const CREDS_KIND: &str = "creds";
const KEYS_KIND: &str = "keys";

/// Shared backing store for every worker of the fleet.
///
/// All lease mutations are single statements so that two workers racing on
/// the same tenant cannot both observe success.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCredentialBlobs {
    pub creds: Vec<u8>,
    pub keys: Vec<u8>,
    pub updated_at_ms: i64,
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let mut connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        // Shared-cache memory databases report table locks instead of waiting
        // on busy_timeout, so they get a single connection.
        let max_connections = if sqlite_path(database_url).is_some() {
            connect_options = connect_options.journal_mode(SqliteJournalMode::Wal);
            5
        } else {
            1
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Set-if-absent with expiry. An expired row, or a row already owned by
    /// `worker_id`, is overwritten in the same statement.
    pub async fn try_acquire_lease(
        &self,
        tenant_id: &TenantId,
        worker_id: &WorkerId,
        ttl_seconds: u64,
        now_ms: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO session_leases (tenant_id, worker_id, acquired_at_ms, ttl_seconds, expires_at_ms)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(tenant_id) DO UPDATE SET
                worker_id = excluded.worker_id,
                acquired_at_ms = excluded.acquired_at_ms,
                ttl_seconds = excluded.ttl_seconds,
                expires_at_ms = excluded.expires_at_ms
             WHERE session_leases.expires_at_ms <= excluded.acquired_at_ms
                OR session_leases.worker_id = excluded.worker_id",
        )
        .bind(tenant_id.as_str())
        .bind(worker_id.as_str())
        .bind(now_ms)
        .bind(ttl_as_i64(ttl_seconds))
        .bind(expires_at(now_ms, ttl_seconds))
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to acquire lease for tenant '{tenant_id}'"))?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn renew_lease(
        &self,
        tenant_id: &TenantId,
        worker_id: &WorkerId,
        ttl_seconds: u64,
        now_ms: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE session_leases
             SET acquired_at_ms = ?, ttl_seconds = ?, expires_at_ms = ?
             WHERE tenant_id = ? AND worker_id = ? AND expires_at_ms > ?",
        )
        .bind(now_ms)
        .bind(ttl_as_i64(ttl_seconds))
        .bind(expires_at(now_ms, ttl_seconds))
        .bind(tenant_id.as_str())
        .bind(worker_id.as_str())
        .bind(now_ms)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to renew lease for tenant '{tenant_id}'"))?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn release_lease(&self, tenant_id: &TenantId, worker_id: &WorkerId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM session_leases WHERE tenant_id = ? AND worker_id = ?")
            .bind(tenant_id.as_str())
            .bind(worker_id.as_str())
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to release lease for tenant '{tenant_id}'"))?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn force_release_lease(&self, tenant_id: &TenantId) -> Result<Option<WorkerId>> {
        let row = sqlx::query("DELETE FROM session_leases WHERE tenant_id = ? RETURNING worker_id")
            .bind(tenant_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to force release lease for tenant '{tenant_id}'"))?;
        Ok(row.map(|r| WorkerId(r.get::<String, _>(0))))
    }

    /// Deletes the lease only while it is still expired at `now_ms`, so a
    /// lease re-acquired in the meantime survives.
    pub async fn release_expired_lease(
        &self,
        tenant_id: &TenantId,
        now_ms: i64,
    ) -> Result<Option<WorkerId>> {
        let row = sqlx::query(
            "DELETE FROM session_leases
             WHERE tenant_id = ? AND expires_at_ms <= ?
             RETURNING worker_id",
        )
        .bind(tenant_id.as_str())
        .bind(now_ms)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to release expired lease for tenant '{tenant_id}'"))?;
        Ok(row.map(|r| WorkerId(r.get::<String, _>(0))))
    }

    pub async fn load_lease(&self, tenant_id: &TenantId) -> Result<Option<LeaseRecord>> {
        let row = sqlx::query(
            "SELECT tenant_id, worker_id, acquired_at_ms, ttl_seconds
             FROM session_leases
             WHERE tenant_id = ?",
        )
        .bind(tenant_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(lease_from_row))
    }

    pub async fn list_leases(&self) -> Result<Vec<LeaseRecord>> {
        let rows = sqlx::query(
            "SELECT tenant_id, worker_id, acquired_at_ms, ttl_seconds
             FROM session_leases
             ORDER BY tenant_id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list session leases")?;
        Ok(rows.into_iter().map(lease_from_row).collect())
    }

    pub async fn purge_expired_leases(&self, now_ms: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM session_leases WHERE expires_at_ms <= ?")
            .bind(now_ms)
            .execute(&self.pool)
            .await
            .context("failed to purge expired leases")?;
        Ok(result.rows_affected())
    }

    /// Replaces both credential rows for a tenant in one transaction.
    pub async fn save_credential_blobs(
        &self,
        tenant_id: &TenantId,
        creds_blob: &[u8],
        keys_blob: &[u8],
        expires_at_ms: i64,
        now_ms: i64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (kind, blob) in [(CREDS_KIND, creds_blob), (KEYS_KIND, keys_blob)] {
            sqlx::query(
                "INSERT INTO credential_blobs (tenant_id, kind, blob, expires_at_ms, updated_at_ms)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(tenant_id, kind) DO UPDATE SET
                    blob = excluded.blob,
                    expires_at_ms = excluded.expires_at_ms,
                    updated_at_ms = excluded.updated_at_ms",
            )
            .bind(tenant_id.as_str())
            .bind(kind)
            .bind(blob)
            .bind(expires_at_ms)
            .bind(now_ms)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to write {kind} blob for tenant '{tenant_id}'"))?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Returns both blobs only when both are present and unexpired.
    pub async fn load_credential_blobs(
        &self,
        tenant_id: &TenantId,
        now_ms: i64,
    ) -> Result<Option<StoredCredentialBlobs>> {
        let rows = sqlx::query(
            "SELECT kind, blob, updated_at_ms
             FROM credential_blobs
             WHERE tenant_id = ? AND expires_at_ms > ?",
        )
        .bind(tenant_id.as_str())
        .bind(now_ms)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to load credential blobs for tenant '{tenant_id}'"))?;

        let mut creds = None;
        let mut keys = None;
        let mut updated_at_ms = 0;
        for row in rows {
            let kind: String = row.try_get("kind")?;
            let blob: Vec<u8> = row.try_get("blob")?;
            updated_at_ms = updated_at_ms.max(row.try_get::<i64, _>("updated_at_ms")?);
            match kind.as_str() {
                CREDS_KIND => creds = Some(blob),
                KEYS_KIND => keys = Some(blob),
                _ => {}
            }
        }

        Ok(match (creds, keys) {
            (Some(creds), Some(keys)) => Some(StoredCredentialBlobs {
                creds,
                keys,
                updated_at_ms,
            }),
            _ => None,
        })
    }

    pub async fn clear_credential_blobs(&self, tenant_id: &TenantId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM credential_blobs WHERE tenant_id = ?")
            .bind(tenant_id.as_str())
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to clear credential blobs for tenant '{tenant_id}'"))?;
        Ok(result.rows_affected())
    }

    /// Returns `true` the first time an inbound event id is seen inside its
    /// expiry window.
    pub async fn mark_inbound_processed(
        &self,
        tenant_id: &TenantId,
        event_id: &str,
        ttl_seconds: u64,
        now_ms: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO inbound_dedupe (tenant_id, event_id, expires_at_ms)
             VALUES (?, ?, ?)
             ON CONFLICT(tenant_id, event_id) DO UPDATE SET
                expires_at_ms = excluded.expires_at_ms
             WHERE inbound_dedupe.expires_at_ms <= ?",
        )
        .bind(tenant_id.as_str())
        .bind(event_id)
        .bind(expires_at(now_ms, ttl_seconds))
        .bind(now_ms)
        .execute(&self.pool)
        .await
        .context("failed to record inbound event")?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn purge_expired_inbound(&self, now_ms: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM inbound_dedupe WHERE expires_at_ms <= ?")
            .bind(now_ms)
            .execute(&self.pool)
            .await
            .context("failed to purge expired inbound events")?;
        Ok(result.rows_affected())
    }
}

fn lease_from_row(row: SqliteRow) -> LeaseRecord {
    LeaseRecord {
        tenant_id: TenantId(row.get::<String, _>(0)),
        worker_id: WorkerId(row.get::<String, _>(1)),
        acquired_at_ms: row.get::<i64, _>(2),
        ttl_seconds: u64::try_from(row.get::<i64, _>(3)).unwrap_or_default(),
    }
}

fn ttl_as_i64(ttl_seconds: u64) -> i64 {
    i64::try_from(ttl_seconds).unwrap_or(i64::MAX)
}

fn expires_at(now_ms: i64, ttl_seconds: u64) -> i64 {
    now_ms.saturating_add(ttl_as_i64(ttl_seconds).saturating_mul(1000))
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

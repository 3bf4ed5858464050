use std::{collections::HashMap, fs, str::FromStr, time::Duration};

use anyhow::bail;
use session_core::SessionSettings;
use shared::domain::{TenantId, WorkerId};
use tracing::warn;

const SETTINGS_FILE: &str = "session-worker.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketBackend {
    Loopback,
    None,
}

impl FromStr for SocketBackend {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> anyhow::Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "loopback" => Ok(Self::Loopback),
            "none" | "" => Ok(Self::None),
            other => bail!("unknown socket backend '{other}'"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub worker_id: String,
    pub max_sessions_per_worker: usize,
    pub claim_interval_secs: u64,
    pub lock_ttl_secs: u64,
    pub max_reconnect_attempts: u32,
    pub base_reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub stability_delay_ms: u64,
    pub queue_timeout_ms: u64,
    pub encryption_key: Option<String>,
    pub disable_encryption: bool,
    pub available_tenants: Vec<String>,
    pub default_tenant_id: String,
    pub auto_claim: bool,
    pub health_check_interval_secs: u64,
    pub max_session_age_minutes: u64,
    pub internal_shared_key: Option<String>,
    pub clear_auth_on_conflict: bool,
    pub enforce_lock_ownership: bool,
    pub socket_backend: SocketBackend,
}

impl Default for Settings {
    fn default() -> Self {
        let session = SessionSettings::default();
        Self {
            server_bind: "127.0.0.1:8088".into(),
            database_url: "sqlite://./data/sessions.db".into(),
            worker_id: format!("worker-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
            max_sessions_per_worker: session.max_sessions_per_worker,
            claim_interval_secs: session.claim_interval.as_secs(),
            lock_ttl_secs: session.lock_ttl_seconds,
            max_reconnect_attempts: session.max_reconnect_attempts,
            base_reconnect_delay_ms: millis(session.base_reconnect_delay),
            max_reconnect_delay_ms: millis(session.max_reconnect_delay),
            stability_delay_ms: millis(session.stability_delay),
            queue_timeout_ms: millis(session.queue_timeout),
            encryption_key: None,
            disable_encryption: false,
            available_tenants: Vec::new(),
            default_tenant_id: session.default_tenant_id.0,
            auto_claim: session.auto_claim,
            health_check_interval_secs: session.health_check_interval.as_secs(),
            max_session_age_minutes: session.max_session_age.as_secs() / 60,
            internal_shared_key: None,
            clear_auth_on_conflict: session.clear_auth_on_conflict,
            enforce_lock_ownership: session.enforce_lock_ownership,
            socket_backend: SocketBackend::Loopback,
        }
    }
}

impl Settings {
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            worker_id: WorkerId::new(self.worker_id.clone()),
            max_sessions_per_worker: self.max_sessions_per_worker,
            claim_interval: Duration::from_secs(self.claim_interval_secs),
            auto_claim: self.auto_claim,
            available_tenants: self
                .available_tenants
                .iter()
                .map(|tenant| TenantId::new(tenant.clone()))
                .collect(),
            default_tenant_id: TenantId::new(self.default_tenant_id.clone()),
            lock_ttl_seconds: self.lock_ttl_secs,
            max_reconnect_attempts: self.max_reconnect_attempts,
            base_reconnect_delay: Duration::from_millis(self.base_reconnect_delay_ms),
            max_reconnect_delay: Duration::from_millis(self.max_reconnect_delay_ms),
            stability_delay: Duration::from_millis(self.stability_delay_ms),
            queue_timeout: Duration::from_millis(self.queue_timeout_ms),
            clear_auth_on_conflict: self.clear_auth_on_conflict,
            health_check_interval: Duration::from_secs(self.health_check_interval_secs),
            max_session_age: Duration::from_secs(self.max_session_age_minutes.saturating_mul(60)),
            enforce_lock_ownership: self.enforce_lock_ownership,
            ..SessionSettings::default()
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Defaults, then `session-worker.toml`, then the environment.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(SETTINGS_FILE) {
        match toml::from_str::<HashMap<String, String>>(&raw) {
            Ok(file_cfg) => apply_overrides(&mut settings, |key| file_cfg.get(&file_key(key)).cloned()),
            Err(error) => warn!(file = SETTINGS_FILE, %error, "config: settings file ignored"),
        }
    }

    apply_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

/// `WA_MAX_SESSIONS_PER_WORKER` is `max_sessions_per_worker` in the file.
pub(crate) fn file_key(env_key: &str) -> String {
    env_key
        .trim_start_matches("WA_")
        .trim_start_matches("APP__")
        .to_ascii_lowercase()
}

pub(crate) fn apply_overrides(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    for key in ["SERVER_BIND", "APP__BIND_ADDR"] {
        if let Some(v) = lookup(key) {
            settings.server_bind = v;
        }
    }
    for key in ["DATABASE_URL", "APP__DATABASE_URL"] {
        if let Some(v) = lookup(key) {
            settings.database_url = v;
        }
    }
    for key in ["HOSTNAME", "WA_WORKER_ID"] {
        if let Some(v) = lookup(key).filter(|v| !v.trim().is_empty()) {
            settings.worker_id = v.trim().to_string();
        }
    }

    parse_into(&lookup, "WA_MAX_SESSIONS_PER_WORKER", &mut settings.max_sessions_per_worker);
    parse_into(&lookup, "WA_SESSION_CLAIM_INTERVAL_SEC", &mut settings.claim_interval_secs);
    parse_into(&lookup, "WA_SESSION_LOCK_TTL_SEC", &mut settings.lock_ttl_secs);
    parse_into(&lookup, "WA_MAX_RECONNECT_ATTEMPTS", &mut settings.max_reconnect_attempts);
    parse_into(&lookup, "WA_BASE_RECONNECT_DELAY_MS", &mut settings.base_reconnect_delay_ms);
    parse_into(&lookup, "WA_MAX_RECONNECT_DELAY_MS", &mut settings.max_reconnect_delay_ms);
    parse_into(&lookup, "WA_CONNECTION_STABILITY_DELAY_MS", &mut settings.stability_delay_ms);
    parse_into(&lookup, "WA_MESSAGE_QUEUE_TIMEOUT_MS", &mut settings.queue_timeout_ms);
    parse_into(&lookup, "WA_HEALTH_CHECK_INTERVAL_SEC", &mut settings.health_check_interval_secs);
    parse_into(&lookup, "WA_MAX_SESSION_AGE_MINUTES", &mut settings.max_session_age_minutes);
    parse_into(&lookup, "WA_SOCKET_BACKEND", &mut settings.socket_backend);

    flag_into(&lookup, "WA_DISABLE_ENCRYPTION", &mut settings.disable_encryption);
    flag_into(&lookup, "WA_AUTO_CLAIM", &mut settings.auto_claim);
    flag_into(&lookup, "WA_CLEAR_AUTH_ON_CONFLICT", &mut settings.clear_auth_on_conflict);
    flag_into(&lookup, "WA_ENFORCE_LOCK_OWNERSHIP", &mut settings.enforce_lock_ownership);

    if let Some(v) = lookup("WA_ENCRYPTION_KEY").filter(|v| !v.is_empty()) {
        settings.encryption_key = Some(v);
    }
    if let Some(v) = lookup("WA_INTERNAL_SHARED_KEY").filter(|v| !v.is_empty()) {
        settings.internal_shared_key = Some(v);
    }
    if let Some(v) = lookup("WA_DEFAULT_TENANT_ID").filter(|v| !v.trim().is_empty()) {
        settings.default_tenant_id = v.trim().to_string();
    }
    if let Some(v) = lookup("WA_AVAILABLE_TENANTS") {
        settings.available_tenants = v
            .split(',')
            .map(str::trim)
            .filter(|tenant| !tenant.is_empty())
            .map(str::to_string)
            .collect();
    }
}

fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => warn!(key, value = %raw, "config: ignoring unparsable value"),
    }
}

fn flag_into(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut bool) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => *slot = true,
        "0" | "false" | "no" | "off" => *slot = false,
        _ => warn!(key, value = %raw, "config: ignoring unparsable flag"),
    }
}

/// Accepts bare file paths as well as sqlite URLs.
pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;

use super::*;

use std::{
    env, fs,
    time::{SystemTime, UNIX_EPOCH},
};

fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let table: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| table.get(key).cloned()
}

#[test]
fn defaults_match_session_defaults() {
    let settings = Settings::default();
    let session = settings.session_settings();

    assert!(settings.worker_id.starts_with("worker-"));
    assert_eq!(session.max_sessions_per_worker, 10);
    assert_eq!(session.lock_ttl_seconds, 300);
    assert_eq!(session.max_reconnect_attempts, 5);
    assert_eq!(session.base_reconnect_delay, Duration::from_secs(5));
    assert_eq!(session.max_reconnect_delay, Duration::from_secs(60));
    assert_eq!(session.queue_timeout, Duration::from_secs(60));
    assert_eq!(session.max_session_age, Duration::from_secs(3_600));
    assert_eq!(session.configured_tenants(), vec![TenantId::new("default")]);
    assert_eq!(settings.socket_backend, SocketBackend::Loopback);
    assert!(settings.encryption_key.is_none());
}

#[test]
fn environment_overrides_are_applied() {
    let mut settings = Settings::default();
    apply_overrides(
        &mut settings,
        lookup_from(&[
            ("HOSTNAME", "pod-7"),
            ("WA_MAX_SESSIONS_PER_WORKER", "3"),
            ("WA_SESSION_LOCK_TTL_SEC", "45"),
            ("WA_BASE_RECONNECT_DELAY_MS", "250"),
            ("WA_AVAILABLE_TENANTS", "acme, globex,,"),
            ("WA_AUTO_CLAIM", "false"),
            ("WA_ENFORCE_LOCK_OWNERSHIP", "1"),
            ("WA_SOCKET_BACKEND", "none"),
            ("WA_INTERNAL_SHARED_KEY", "s3cret"),
            ("APP__DATABASE_URL", "sqlite::memory:"),
        ]),
    );

    assert_eq!(settings.worker_id, "pod-7");
    assert_eq!(settings.database_url, "sqlite::memory:");
    assert_eq!(settings.internal_shared_key.as_deref(), Some("s3cret"));
    assert_eq!(settings.socket_backend, SocketBackend::None);

    let session = settings.session_settings();
    assert_eq!(session.worker_id, WorkerId::new("pod-7"));
    assert_eq!(session.max_sessions_per_worker, 3);
    assert_eq!(session.lock_ttl_seconds, 45);
    assert_eq!(session.base_reconnect_delay, Duration::from_millis(250));
    assert!(!session.auto_claim);
    assert!(session.enforce_lock_ownership);
    assert_eq!(
        session.configured_tenants(),
        vec![TenantId::new("acme"), TenantId::new("globex")]
    );
}

#[test]
fn explicit_worker_id_wins_over_hostname() {
    let mut settings = Settings::default();
    apply_overrides(
        &mut settings,
        lookup_from(&[("HOSTNAME", "pod-7"), ("WA_WORKER_ID", "blue")]),
    );
    assert_eq!(settings.worker_id, "blue");
}

#[test]
fn unparsable_values_keep_the_previous_setting() {
    let mut settings = Settings::default();
    apply_overrides(
        &mut settings,
        lookup_from(&[
            ("WA_MAX_RECONNECT_ATTEMPTS", "many"),
            ("WA_DISABLE_ENCRYPTION", "perhaps"),
            ("WA_SOCKET_BACKEND", "carrier-pigeon"),
        ]),
    );
    assert_eq!(settings.max_reconnect_attempts, 5);
    assert!(!settings.disable_encryption);
    assert_eq!(settings.socket_backend, SocketBackend::Loopback);
}

#[test]
fn settings_file_uses_lowercase_keys() {
    assert_eq!(file_key("WA_MAX_SESSIONS_PER_WORKER"), "max_sessions_per_worker");
    assert_eq!(file_key("APP__BIND_ADDR"), "bind_addr");
    assert_eq!(file_key("DATABASE_URL"), "database_url");

    let file_cfg: HashMap<String, String> = toml::from_str(
        r#"
bind_addr = "0.0.0.0:9000"
session_lock_ttl_sec = "120"
"#,
    )
    .expect("toml");
    let mut settings = Settings::default();
    apply_overrides(&mut settings, |key| file_cfg.get(&file_key(key)).cloned());
    assert_eq!(settings.server_bind, "0.0.0.0:9000");
    assert_eq!(settings.lock_ttl_secs, 120);
}

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
    assert_eq!(
        normalize_database_url("  "),
        Settings::default().database_url
    );
}

#[tokio::test]
async fn normalized_url_opens_a_fresh_sqlite_file() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();

    let temp_root = env::temp_dir().join(format!("session_worker_open_test_{suffix}"));
    let db_path = temp_root.join("nested").join("sessions.db");

    let url = normalize_database_url(db_path.to_string_lossy().as_ref());
    let storage = storage::Storage::new(&url).await.expect("open sqlite");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should be created: {}",
        db_path.display()
    );

    fs::remove_dir_all(temp_root).expect("cleanup");
}

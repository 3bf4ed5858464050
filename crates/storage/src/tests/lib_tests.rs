use super::*;

const T0: i64 = 1_700_000_000_000;

fn tenant(id: &str) -> TenantId {
    TenantId::new(id)
}

fn worker(id: &str) -> WorkerId {
    WorkerId::new(id)
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("sessions.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}

#[test]
fn sqlite_path_ignores_memory_and_foreign_urls() {
    assert_eq!(sqlite_path("sqlite::memory:"), None);
    assert_eq!(sqlite_path("postgres://db/sessions"), None);
    assert_eq!(
        sqlite_path("sqlite://data/sessions.db?mode=rwc"),
        Some(PathBuf::from("data/sessions.db"))
    );
}

#[tokio::test]
async fn first_acquire_wins_and_second_worker_is_refused() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let t = tenant("acme");

    assert!(storage
        .try_acquire_lease(&t, &worker("w1"), 300, T0)
        .await
        .expect("acquire w1"));
    assert!(!storage
        .try_acquire_lease(&t, &worker("w2"), 300, T0 + 1_000)
        .await
        .expect("acquire w2"));

    let lease = storage.load_lease(&t).await.expect("load").expect("lease");
    assert_eq!(lease.worker_id, worker("w1"));
    assert_eq!(lease.ttl_seconds, 300);
    assert_eq!(lease.expires_at_ms(), T0 + 300_000);
}

#[tokio::test]
async fn reacquire_by_owner_refreshes_expiry() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let t = tenant("acme");

    assert!(storage
        .try_acquire_lease(&t, &worker("w1"), 10, T0)
        .await
        .expect("acquire"));
    assert!(storage
        .try_acquire_lease(&t, &worker("w1"), 10, T0 + 5_000)
        .await
        .expect("reacquire"));

    let lease = storage.load_lease(&t).await.expect("load").expect("lease");
    assert_eq!(lease.acquired_at_ms, T0 + 5_000);
}

#[tokio::test]
async fn expired_lease_can_be_taken_over() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let t = tenant("acme");

    storage
        .try_acquire_lease(&t, &worker("w1"), 10, T0)
        .await
        .expect("acquire w1");
    assert!(storage
        .try_acquire_lease(&t, &worker("w2"), 10, T0 + 10_000)
        .await
        .expect("takeover"));

    let lease = storage.load_lease(&t).await.expect("load").expect("lease");
    assert_eq!(lease.worker_id, worker("w2"));
}

#[tokio::test]
async fn renew_requires_live_ownership() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let t = tenant("acme");

    storage
        .try_acquire_lease(&t, &worker("w1"), 10, T0)
        .await
        .expect("acquire");

    assert!(!storage
        .renew_lease(&t, &worker("w2"), 10, T0 + 1_000)
        .await
        .expect("renew by stranger"));
    assert!(storage
        .renew_lease(&t, &worker("w1"), 10, T0 + 1_000)
        .await
        .expect("renew by owner"));
    assert!(!storage
        .renew_lease(&t, &worker("w1"), 10, T0 + 60_000)
        .await
        .expect("renew after expiry"));
}

#[tokio::test]
async fn release_is_conditional_on_owner() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let t = tenant("acme");

    storage
        .try_acquire_lease(&t, &worker("w1"), 300, T0)
        .await
        .expect("acquire");

    assert!(!storage
        .release_lease(&t, &worker("w2"))
        .await
        .expect("release by stranger"));
    assert!(storage.load_lease(&t).await.expect("load").is_some());

    assert!(storage
        .release_lease(&t, &worker("w1"))
        .await
        .expect("release by owner"));
    assert!(storage.load_lease(&t).await.expect("load").is_none());
    assert!(!storage
        .release_lease(&t, &worker("w1"))
        .await
        .expect("second release"));
}

#[tokio::test]
async fn force_release_reports_previous_owner() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let t = tenant("acme");

    assert_eq!(storage.force_release_lease(&t).await.expect("empty"), None);

    storage
        .try_acquire_lease(&t, &worker("w1"), 300, T0)
        .await
        .expect("acquire");
    assert_eq!(
        storage.force_release_lease(&t).await.expect("force"),
        Some(worker("w1"))
    );
    assert!(storage.load_lease(&t).await.expect("load").is_none());
}

#[tokio::test]
async fn expired_release_leaves_a_retaken_lease_alone() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let t = tenant("acme");
    storage
        .try_acquire_lease(&t, &worker("w1"), 10, T0)
        .await
        .expect("acquire");

    assert_eq!(
        storage.release_expired_lease(&t, T0 + 5_000).await.expect("live"),
        None
    );

    storage
        .try_acquire_lease(&t, &worker("w2"), 300, T0 + 20_000)
        .await
        .expect("retake");
    assert_eq!(
        storage
            .release_expired_lease(&t, T0 + 20_000)
            .await
            .expect("retaken"),
        None
    );
    assert_eq!(
        storage
            .release_expired_lease(&t, T0 + 400_000)
            .await
            .expect("expired"),
        Some(worker("w2"))
    );
}

#[tokio::test]
async fn purge_drops_only_expired_leases() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");

    storage
        .try_acquire_lease(&tenant("old"), &worker("w1"), 10, T0)
        .await
        .expect("old");
    storage
        .try_acquire_lease(&tenant("young"), &worker("w1"), 300, T0)
        .await
        .expect("young");

    let purged = storage
        .purge_expired_leases(T0 + 20_000)
        .await
        .expect("purge");
    assert_eq!(purged, 1);

    let leases = storage.list_leases().await.expect("list");
    assert_eq!(leases.len(), 1);
    assert_eq!(leases[0].tenant_id, tenant("young"));
}

#[tokio::test]
async fn credential_blobs_round_trip_and_expire() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let t = tenant("acme");

    storage
        .save_credential_blobs(&t, b"creds-v1", b"keys-v1", T0 + 1_000, T0)
        .await
        .expect("save");
    storage
        .save_credential_blobs(&t, b"creds-v2", b"keys-v2", T0 + 1_000, T0 + 10)
        .await
        .expect("overwrite");

    let blobs = storage
        .load_credential_blobs(&t, T0 + 500)
        .await
        .expect("load")
        .expect("blobs");
    assert_eq!(blobs.creds, b"creds-v2");
    assert_eq!(blobs.keys, b"keys-v2");
    assert_eq!(blobs.updated_at_ms, T0 + 10);

    assert!(storage
        .load_credential_blobs(&t, T0 + 1_000)
        .await
        .expect("load expired")
        .is_none());
}

#[tokio::test]
async fn clearing_credentials_is_scoped_to_tenant() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");

    for id in ["acme", "globex"] {
        storage
            .save_credential_blobs(&tenant(id), b"c", b"k", T0 + 60_000, T0)
            .await
            .expect("save");
    }

    let removed = storage
        .clear_credential_blobs(&tenant("acme"))
        .await
        .expect("clear");
    assert_eq!(removed, 2);
    assert!(storage
        .load_credential_blobs(&tenant("acme"), T0)
        .await
        .expect("load")
        .is_none());
    assert!(storage
        .load_credential_blobs(&tenant("globex"), T0)
        .await
        .expect("load")
        .is_some());
}

#[tokio::test]
async fn inbound_events_are_processed_once_per_window() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let t = tenant("acme");

    assert!(storage
        .mark_inbound_processed(&t, "evt-1", 60, T0)
        .await
        .expect("first"));
    assert!(!storage
        .mark_inbound_processed(&t, "evt-1", 60, T0 + 1_000)
        .await
        .expect("duplicate"));
    assert!(storage
        .mark_inbound_processed(&tenant("globex"), "evt-1", 60, T0)
        .await
        .expect("other tenant"));
    assert!(storage
        .mark_inbound_processed(&t, "evt-1", 60, T0 + 60_000)
        .await
        .expect("after window"));
}

#[tokio::test]
async fn purge_drops_only_expired_inbound_events() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let t = tenant("acme");

    storage
        .mark_inbound_processed(&t, "evt-old", 10, T0)
        .await
        .expect("old");
    storage
        .mark_inbound_processed(&t, "evt-new", 300, T0)
        .await
        .expect("new");

    let purged = storage
        .purge_expired_inbound(T0 + 20_000)
        .await
        .expect("purge");
    assert_eq!(purged, 1);
    assert_eq!(
        storage
            .purge_expired_inbound(T0 + 20_000)
            .await
            .expect("second purge"),
        0
    );

    assert!(!storage
        .mark_inbound_processed(&t, "evt-new", 300, T0 + 20_000)
        .await
        .expect("still deduplicated"));
}

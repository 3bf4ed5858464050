use super::*;
use crate::{
    cipher::PassthroughCipher,
    socket::LoopbackConnector,
    test_support::{eventually, fast_settings, next_socket, ScriptedConnector, WAIT},
};
use std::time::Duration;

fn loopback_manager(storage: &Storage, settings: SessionSettings) -> Arc<SessionManager> {
    SessionManager::new(
        settings,
        storage.clone(),
        Arc::new(PassthroughCipher),
        Arc::new(LoopbackConnector),
    )
}

fn tenants(ids: &[&str]) -> Vec<TenantId> {
    ids.iter().map(|id| TenantId::new(*id)).collect()
}

#[tokio::test]
async fn claim_records_lease_for_this_worker() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let manager = loopback_manager(&storage, fast_settings("w1"));
    let tenant = TenantId::new("t1");

    assert_eq!(manager.claim_session(&tenant).await, ClaimOutcome::Claimed);
    assert_eq!(manager.claim_session(&tenant).await, ClaimOutcome::AlreadyActive);

    let lease = storage.load_lease(&tenant).await.expect("load").expect("lease");
    assert_eq!(lease.worker_id, WorkerId::new("w1"));
    assert_eq!(lease.ttl_seconds, 300);
    assert_eq!(manager.registry().len().await, 1);
}

#[tokio::test]
async fn second_worker_waits_for_lease_expiry() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let mut first_settings = fast_settings("w1");
    first_settings.lock_ttl_seconds = 1;
    let first = loopback_manager(&storage, first_settings);
    let second = loopback_manager(&storage, fast_settings("w2"));
    let tenant = TenantId::new("t1");

    assert_eq!(first.claim_session(&tenant).await, ClaimOutcome::Claimed);
    assert_eq!(second.claim_session(&tenant).await, ClaimOutcome::Unavailable);
    assert!(!second.registry().contains(&tenant).await);

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(second.claim_session(&tenant).await, ClaimOutcome::Claimed);
    let lease = storage.load_lease(&tenant).await.expect("load").expect("lease");
    assert_eq!(lease.worker_id, WorkerId::new("w2"));
}

#[tokio::test]
async fn concurrent_claims_for_one_tenant_initialize_once() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let manager = loopback_manager(&storage, fast_settings("w1"));
    let tenant = TenantId::new("t1");

    let (a, b) = tokio::join!(manager.claim_session(&tenant), manager.claim_session(&tenant));
    let claimed = [a, b]
        .iter()
        .filter(|outcome| **outcome == ClaimOutcome::Claimed)
        .count();
    assert_eq!(claimed, 1, "outcomes were {a:?} and {b:?}");
    assert!(a.is_active() || b.is_active());
    assert_eq!(manager.registry().len().await, 1);
}

#[tokio::test]
async fn claim_waiting_on_an_in_flight_registration_sees_it() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let (connector, mut sockets) = ScriptedConnector::new();
    let manager = SessionManager::new(
        fast_settings("w1"),
        storage.clone(),
        Arc::new(PassthroughCipher),
        connector,
    );
    let tenant = TenantId::new("t1");

    let guard = manager.claims_in_flight.lock().await;
    let competing = {
        let manager = Arc::clone(&manager);
        let tenant = tenant.clone();
        tokio::spawn(async move { manager.claim_session(&tenant).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let first = SessionConnection::new(tenant.clone(), manager.ctx.clone());
    assert!(first.initialize().await);
    assert!(manager.registry.insert(Arc::clone(&first)).await.is_none());
    drop(guard);

    let outcome = tokio::time::timeout(WAIT, competing)
        .await
        .expect("claim finished")
        .expect("claim task");
    assert_eq!(outcome, ClaimOutcome::AlreadyActive);

    let opened = next_socket(&mut sockets).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(sockets.try_recv().is_err(), "a second socket was opened");
    assert!(!opened.socket.is_closed());

    let registered = manager.registry().get(&tenant).await.expect("registered");
    assert!(Arc::ptr_eq(&registered, &first));
    assert!(manager.claims_in_flight.lock().await.is_empty());
}

#[tokio::test]
async fn claims_stop_at_capacity() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let mut settings = fast_settings("w1");
    settings.max_sessions_per_worker = 1;
    let manager = loopback_manager(&storage, settings);

    assert_eq!(
        manager.claim_session(&TenantId::new("t1")).await,
        ClaimOutcome::Claimed
    );
    assert_eq!(
        manager.claim_session(&TenantId::new("t2")).await,
        ClaimOutcome::AtCapacity
    );
    assert!(storage
        .load_lease(&TenantId::new("t2"))
        .await
        .expect("load")
        .is_none());
}

#[tokio::test]
async fn claimable_tenants_cover_expired_own_and_unheld_configured() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let mut settings = fast_settings("w1");
    settings.available_tenants = tenants(&["t-config", "t-live"]);
    let manager = loopback_manager(&storage, settings);
    let now = now_ms();

    let other = WorkerId::new("w2");
    let me = WorkerId::new("w1");
    storage
        .try_acquire_lease(&TenantId::new("t-expired"), &other, 1, now - 10_000)
        .await
        .expect("expired lease");
    storage
        .try_acquire_lease(&TenantId::new("t-live"), &other, 300, now)
        .await
        .expect("live lease");
    storage
        .try_acquire_lease(&TenantId::new("t-mine"), &me, 300, now)
        .await
        .expect("own lease");

    assert_eq!(
        manager.claimable_tenants(now).await.expect("scan"),
        tenants(&["t-expired", "t-mine", "t-config"])
    );
}

#[tokio::test]
async fn default_tenant_is_discovered_without_configuration() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let manager = loopback_manager(&storage, fast_settings("w1"));

    assert_eq!(manager.discover_and_claim().await, tenants(&["default"]));
    assert!(manager.registry().contains(&TenantId::new("default")).await);
    assert!(manager.discover_and_claim().await.is_empty());
}

#[tokio::test]
async fn discovery_respects_capacity() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let mut settings = fast_settings("w1");
    settings.available_tenants = tenants(&["a", "b", "c"]);
    settings.max_sessions_per_worker = 2;
    let manager = loopback_manager(&storage, settings);

    assert_eq!(manager.discover_and_claim().await, tenants(&["a", "b"]));
    assert_eq!(manager.registry().len().await, 2);
    assert!(storage
        .load_lease(&TenantId::new("c"))
        .await
        .expect("load")
        .is_none());
}

#[tokio::test]
async fn enqueue_routes_to_registered_session() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let manager = loopback_manager(&storage, fast_settings("w1"));
    let tenant = TenantId::new("t1");

    assert_eq!(
        manager
            .enqueue(&tenant, "15550001111", OutboundContent::text("hi"))
            .await,
        Err(SendError::NotConnected)
    );

    assert_eq!(manager.claim_session(&tenant).await, ClaimOutcome::Claimed);
    let receipt = tokio::time::timeout(
        WAIT,
        manager.enqueue(&tenant, "15550001111", OutboundContent::text("hi")),
    )
    .await
    .expect("settled")
    .expect("delivered");
    assert_eq!(receipt.target, "15550001111@s.whatsapp.net");
    assert!(receipt.message_id.is_some());

    let status = manager.status(&tenant).await.expect("status");
    assert!(status.is_connected);
    assert_eq!(status.worker_id, WorkerId::new("w1"));
}

#[tokio::test]
async fn release_disconnects_and_frees_the_lease() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let manager = loopback_manager(&storage, fast_settings("w1"));
    let tenant = TenantId::new("t1");
    assert_eq!(manager.claim_session(&tenant).await, ClaimOutcome::Claimed);

    assert!(manager.release_session(&tenant).await.expect("release"));
    assert!(!manager.release_session(&tenant).await.expect("second release"));
    assert!(!manager.registry().contains(&tenant).await);
    assert!(storage.load_lease(&tenant).await.expect("load").is_none());
}

#[tokio::test]
async fn credentials_only_cleared_without_local_session() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let manager = loopback_manager(&storage, fast_settings("w1"));
    let tenant = TenantId::new("t1");
    assert_eq!(manager.claim_session(&tenant).await, ClaimOutcome::Claimed);

    let watcher = storage.clone();
    let watched_tenant = tenant.clone();
    eventually(move || {
        let watcher = watcher.clone();
        let tenant = watched_tenant.clone();
        async move {
            watcher
                .load_credential_blobs(&tenant, now_ms())
                .await
                .expect("load")
                .is_some()
        }
    })
    .await;

    assert!(manager.clear_credentials(&tenant).await.is_err());
    manager.release_session(&tenant).await.expect("release");
    assert_eq!(manager.clear_credentials(&tenant).await.expect("clear"), 2);
    assert!(storage
        .load_credential_blobs(&tenant, now_ms())
        .await
        .expect("load")
        .is_none());
}

#[tokio::test]
async fn retired_sessions_leave_the_registry() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let mut settings = fast_settings("w1");
    settings.max_reconnect_attempts = 0;
    let (connector, mut sockets) = ScriptedConnector::new();
    let manager = SessionManager::new(
        settings,
        storage.clone(),
        Arc::new(PassthroughCipher),
        connector,
    );
    manager.start().await;
    let tenant = TenantId::new("t1");

    assert_eq!(manager.claim_session(&tenant).await, ClaimOutcome::Claimed);
    let socket = next_socket(&mut sockets).await;
    socket.close_with(428, "connection closed").await;

    let watcher = Arc::clone(&manager);
    eventually(move || {
        let watcher = Arc::clone(&watcher);
        async move { watcher.registry().is_empty().await }
    })
    .await;
    assert!(storage
        .load_lease(&TenantId::new("t1"))
        .await
        .expect("load")
        .is_none());
}

#[tokio::test]
async fn shutdown_disconnects_everything_and_refuses_new_claims() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let mut settings = fast_settings("w1");
    settings.available_tenants = tenants(&["a", "b"]);
    settings.auto_claim = true;
    let manager = loopback_manager(&storage, settings);

    manager.start().await;
    assert_eq!(manager.registry().len().await, 2);

    manager.shutdown().await;
    manager.shutdown().await;
    assert!(manager.registry().is_empty().await);
    assert!(storage.list_leases().await.expect("leases").is_empty());
    assert_eq!(
        manager.claim_session(&TenantId::new("a")).await,
        ClaimOutcome::ShuttingDown
    );
    assert!(manager.worker_status().await.is_shutting_down);
}

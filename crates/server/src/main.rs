use std::{net::SocketAddr, sync::Arc};

use anyhow::bail;
use session_core::{
    AesGcmCipher, Cipher, HealthMonitor, LoopbackConnector, MissingSocketConnector,
    PassthroughCipher, SessionManager, SocketConnector,
};
use storage::Storage;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod api;
mod app_state;
mod config;

use api::build_router;
use app_state::AppState;
use config::{load_settings, normalize_database_url, Settings, SocketBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings();
    let database_url = normalize_database_url(&settings.database_url);
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let manager = SessionManager::new(
        settings.session_settings(),
        storage,
        select_cipher(&settings)?,
        select_connector(settings.socket_backend),
    );
    let health = HealthMonitor::new(Arc::clone(&manager));
    manager.start().await;
    let health_task = health.spawn();

    let state = AppState {
        manager: Arc::clone(&manager),
        health,
        internal_key: settings.internal_shared_key.clone(),
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, worker_id = %manager.worker_id(), "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    health_task.cancel();
    manager.shutdown().await;
    info!(worker_id = %manager.worker_id(), "server stopped");
    Ok(())
}

fn select_cipher(settings: &Settings) -> anyhow::Result<Arc<dyn Cipher>> {
    if settings.disable_encryption {
        warn!("credential encryption disabled; blobs are stored in plaintext");
        return Ok(Arc::new(PassthroughCipher));
    }
    match settings.encryption_key.as_deref() {
        Some(key) => Ok(Arc::new(AesGcmCipher::new(key))),
        None => bail!("WA_ENCRYPTION_KEY is required unless WA_DISABLE_ENCRYPTION is set"),
    }
}

fn select_connector(backend: SocketBackend) -> Arc<dyn SocketConnector> {
    match backend {
        SocketBackend::Loopback => {
            warn!("using the loopback socket backend; no messages leave this process");
            Arc::new(LoopbackConnector)
        }
        SocketBackend::None => Arc::new(MissingSocketConnector),
    }
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(%error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

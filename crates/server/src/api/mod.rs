use std::{collections::BTreeMap, sync::Arc};

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use session_core::{ClaimOutcome, SendError};
use shared::{
    domain::{TenantId, WorkerId},
    error::{ApiError, ErrorCode},
    protocol::{HealthSummary, OutboundContent, SendReceipt, SessionHealth, SessionStatus, WorkerStatus},
};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, warn};

use crate::app_state::AppState;

pub(crate) const INTERNAL_KEY_HEADER: &str = "x-internal-key";
pub(crate) const MAX_BODY_BYTES: usize = 64 * 1024;

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct HealthResponse {
    pub(crate) healthy: bool,
    pub(crate) worker_id: WorkerId,
    pub(crate) summary: HealthSummary,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ClaimResponse {
    pub(crate) tenant_id: TenantId,
    pub(crate) outcome: ClaimOutcome,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ReleaseResponse {
    pub(crate) tenant_id: TenantId,
    pub(crate) released: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SendMessageRequest {
    to: String,
    text: String,
}

pub(crate) fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/health", get(health))
        .route("/health/detailed", get(health_detailed))
        .route("/health/metrics", get(health_metrics))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:tenant_id", get(session_status))
        .route("/sessions/:tenant_id/claim", post(claim_session))
        .route("/sessions/:tenant_id/release", post(release_session))
        .route("/sessions/:tenant_id/messages", post(send_message))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

fn internal_error(error: anyhow::Error) -> (StatusCode, Json<ApiError>) {
    error!(%error, "api: request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiError::new(ErrorCode::Internal, error.to_string())),
    )
}

fn send_error(error: SendError) -> (StatusCode, Json<ApiError>) {
    let code = error.code();
    let status = match code {
        ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::Terminal => StatusCode::GONE,
        ErrorCode::NetworkError => StatusCode::BAD_GATEWAY,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(ApiError::new(code, error.to_string())))
}

/// Mutating routes are open when no shared key is configured.
fn require_internal_key(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let Some(expected) = state.internal_key.as_deref() else {
        return Ok(());
    };
    let presented = headers
        .get(INTERNAL_KEY_HEADER)
        .and_then(|value| value.to_str().ok());
    if presented == Some(expected) {
        return Ok(());
    }
    warn!("api: rejected request without a valid internal key");
    Err((
        StatusCode::FORBIDDEN,
        Json(ApiError::new(ErrorCode::Forbidden, "missing or invalid internal key")),
    ))
}

async fn healthz() -> &'static str {
    "ok"
}

async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let healthy = state.health.is_healthy().await;
    let summary = state.health.last_summary().await.unwrap_or_default();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            healthy,
            worker_id: state.manager.worker_id().clone(),
            summary,
        }),
    )
}

async fn health_detailed(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<SessionHealth>>> {
    state
        .health
        .detailed_status()
        .await
        .map(Json)
        .map_err(internal_error)
}

async fn health_metrics(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<BTreeMap<String, i64>>> {
    state.health.metrics().await.map(Json).map_err(internal_error)
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<WorkerStatus> {
    Json(state.manager.worker_status().await)
}

async fn session_status(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
) -> ApiResult<Json<SessionStatus>> {
    let tenant_id = TenantId::new(tenant_id);
    match state.manager.status(&tenant_id).await {
        Some(status) => Ok(Json(status)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ApiError::new(
                ErrorCode::NotFound,
                format!("tenant '{tenant_id}' is not served by this worker"),
            )),
        )),
    }
}

async fn claim_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
) -> ApiResult<(StatusCode, Json<ClaimResponse>)> {
    require_internal_key(&state, &headers)?;
    let tenant_id = TenantId::new(tenant_id);
    let outcome = state.manager.claim_session(&tenant_id).await;
    let status = match outcome {
        ClaimOutcome::Claimed | ClaimOutcome::AlreadyActive => StatusCode::OK,
        ClaimOutcome::InProgress => StatusCode::ACCEPTED,
        ClaimOutcome::Unavailable => StatusCode::CONFLICT,
        ClaimOutcome::AtCapacity | ClaimOutcome::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
    };
    Ok((status, Json(ClaimResponse { tenant_id, outcome })))
}

async fn release_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
) -> ApiResult<Json<ReleaseResponse>> {
    require_internal_key(&state, &headers)?;
    let tenant_id = TenantId::new(tenant_id);
    let released = state
        .manager
        .release_session(&tenant_id)
        .await
        .map_err(internal_error)?;
    Ok(Json(ReleaseResponse {
        tenant_id,
        released,
    }))
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<Json<SendReceipt>> {
    require_internal_key(&state, &headers)?;
    if req.to.trim().is_empty() || req.text.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiError::new(
                ErrorCode::Validation,
                "both 'to' and 'text' are required",
            )),
        ));
    }
    let tenant_id = TenantId::new(tenant_id);
    state
        .manager
        .enqueue(&tenant_id, &req.to, OutboundContent::text(req.text))
        .await
        .map(Json)
        .map_err(send_error)
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;

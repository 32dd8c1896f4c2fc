//! Defines the API routes and handlers for the web server.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, Method},
    response::Response,
    routing::{any, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::{
    auth::{self, ApiKeyStore, AuthenticatedUser},
    error::AppError,
    lifecycle::LifecycleController,
    proxy::RequestRouter,
    registry::{ModelInfo, Reservation, Worker, WorkerRegistry, WorkerState},
};

/// Shared application state passed into route handlers.
#[derive(Clone)]
pub struct AppState {
    registry: WorkerRegistry,
    lifecycle: Arc<LifecycleController>,
    request_router: Arc<RequestRouter>,
    auth: Arc<ApiKeyStore>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

impl AppState {
    /// Creates a new `AppState` instance.
    pub fn new(
        registry: WorkerRegistry,
        lifecycle: Arc<LifecycleController>,
        request_router: Arc<RequestRouter>,
        auth: Arc<ApiKeyStore>,
    ) -> Self {
        Self {
            registry,
            lifecycle,
            request_router,
            auth,
        }
    }

    fn authenticate(&self, headers: &HeaderMap) -> Result<AuthenticatedUser, AppError> {
        auth::authenticate(&self.auth, headers)
    }
}

/// Creates the main API router for the application.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/gpu/discover", get(discover_handler))
        .route("/gpu/stats", get(stats_handler))
        .route("/gpu/:id/status", get(gpu_status_handler))
        .route("/gpu/:id/resume", post(gpu_resume_handler))
        .route("/gpu/:id/pause", post(gpu_pause_handler))
        .route("/api/generate", post(generate_handler))
        .route("/api/chat", post(chat_handler))
        .route("/v1/chat/completions", post(openai_chat_handler))
        .route("/api/*path", any(passthrough_handler))
        .with_state(state)
}

/// Serialized view of one worker record.
#[derive(Debug, Serialize)]
struct GpuSnapshot {
    id: String,
    name: String,
    ip_address: String,
    flavor: String,
    status: WorkerState,
    loaded_model: Option<ModelInfo>,
    reservation: Option<Reservation>,
    active_requests: u32,
    max_slots: u32,
    is_available: bool,
    last_state_change: DateTime<Utc>,
    last_request: Option<DateTime<Utc>>,
    idle_since: Option<DateTime<Utc>>,
    total_requests: u64,
    requests_today: u64,
}

impl From<Worker> for GpuSnapshot {
    fn from(worker: Worker) -> Self {
        let is_available = worker.is_available();
        Self {
            id: worker.id,
            name: worker.name,
            ip_address: worker.ip,
            flavor: worker.flavor,
            status: worker.state,
            loaded_model: worker.loaded_model,
            reservation: worker.reservation,
            active_requests: worker.active_requests,
            max_slots: worker.max_slots,
            is_available,
            last_state_change: worker.last_state_change,
            last_request: worker.last_request,
            idle_since: worker.idle_since,
            total_requests: worker.total_requests,
            requests_today: worker.requests_today,
        }
    }
}

#[derive(Debug, Serialize)]
struct ActionResult {
    success: bool,
    message: String,
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy", "service": "gpu-gateway" }))
}

async fn discover_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    let _user = state.authenticate(&headers)?;

    let gpus: Vec<GpuSnapshot> = state
        .registry
        .snapshot()
        .into_iter()
        .map(GpuSnapshot::from)
        .collect();

    Ok(Json(json!({
        "discovered_gpus": gpus.len(),
        "gpus": gpus,
    })))
}

async fn stats_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<crate::registry::FleetStats>, AppError> {
    let _user = state.authenticate(&headers)?;
    Ok(Json(state.registry.stats()))
}

async fn gpu_status_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<GpuSnapshot>, AppError> {
    let _user = state.authenticate(&headers)?;

    let worker = state
        .registry
        .get(&id)
        .ok_or_else(|| AppError::NotFound(id))?;
    Ok(Json(GpuSnapshot::from(worker)))
}

async fn gpu_resume_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ActionResult>, AppError> {
    let _user = state.authenticate(&headers)?;

    state.lifecycle.resume(&id).await?;
    Ok(Json(ActionResult {
        success: true,
        message: format!("GPU {id} running"),
    }))
}

async fn gpu_pause_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ActionResult>, AppError> {
    let _user = state.authenticate(&headers)?;

    state.lifecycle.pause(&id).await?;
    Ok(Json(ActionResult {
        success: true,
        message: format!("GPU {id} paused"),
    }))
}

async fn generate_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let user = state.authenticate(&headers)?;
    state
        .request_router
        .handle_ollama(&user, "/api/generate", body)
        .await
}

async fn chat_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let user = state.authenticate(&headers)?;
    state
        .request_router
        .handle_ollama(&user, "/api/chat", body)
        .await
}

async fn openai_chat_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let user = state.authenticate(&headers)?;

    let request: crate::protocol::OpenAiChatRequest = serde_json::from_slice(&body)
        .map_err(|err| AppError::BadState(format!("Invalid request body: {err}")))?;

    state.request_router.handle_openai_chat(&user, request).await
}

async fn passthrough_handler(
    State(state): State<AppState>,
    Path(path): Path<String>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let user = state.authenticate(&headers)?;

    state
        .request_router
        .handle_passthrough(&user, method.as_str(), &format!("/api/{path}"), body)
        .await
}

// src/http.rs
//
// =============================================================================
// STRATUS: HTTP SURFACE
// =============================================================================
//
// The axum router and handlers. Authentication lives in front of this
// process: the auth layer injects `x-user-id` / `x-user-name`, and the
// Principal extractor turns them into an identity (401 without them).
//
// Handlers stay thin; everything with semantics is in the dispatcher, the
// registry, or the bridge. CoreError -> status code mapping lives here so
// the rest of the crate never imports HTTP types.

use crate::bridge;
use crate::core::{ComputeTaskRequest, FileNode, Principal, Task};
use crate::dispatcher::Dispatcher;
use crate::error::CoreError;
use crate::monitor::{self, SystemMonitor};
use crate::registry::{GpuRegistry, GpuSnapshot};
use crate::store::TaskStore;

use axum::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, request::Parts, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Period of the resource/VRAM status streams.
const STATUS_TICK: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub store: Arc<TaskStore>,
    pub registry: Arc<dyn GpuRegistry>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/compute/start", post(start_compute))
        .route("/compute/tasks", get(list_tasks))
        .route("/compute/:task_id/files", get(list_files))
        .route("/compute/:task_id/download", get(download_file))
        .route("/compute/:task_id/tree", get(workspace_tree))
        .route("/compute/:task_id", delete(delete_task))
        .route("/status/task/:task_id", get(task_status))
        .route("/status/logs/:task_id", get(task_logs))
        .route("/status/gpu", get(gpu_status))
        .route("/status/ws/logs/:task_id", get(ws_logs))
        .route("/status/ws/resource_status", get(ws_resource_status))
        .route("/status/ws/gpu_vram", get(ws_gpu_vram))
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

// ============================================================================
// 1. PRINCIPAL EXTRACTION
// ============================================================================

#[async_trait]
impl<S> axum::extract::FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = CoreError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok());
        let name = parts
            .headers
            .get("x-user-name")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        match (id, name) {
            (Some(id), Some(name)) if !name.is_empty() => Ok(Principal { id, name }),
            _ => Err(CoreError::Unauthenticated),
        }
    }
}

// ============================================================================
// 2. ERROR MAPPING
// ============================================================================

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = match &self {
            CoreError::InvalidArgument(_) | CoreError::InvalidPath => StatusCode::BAD_REQUEST,
            CoreError::Unauthenticated => StatusCode::UNAUTHORIZED,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::Io(_) | CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            log::error!("Request failed: {}", self);
            (status, "Internal server error".to_string()).into_response()
        } else {
            (status, self.to_string()).into_response()
        }
    }
}

// ============================================================================
// 3. COMPUTE ROUTES
// ============================================================================

async fn start_compute(
    State(state): State<AppState>,
    principal: Principal,
    Json(request): Json<ComputeTaskRequest>,
) -> Result<Json<Task>, CoreError> {
    let task = state.dispatcher.start_compute(request, &principal).await?;
    Ok(Json(task))
}

async fn list_tasks(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<Vec<Task>>, CoreError> {
    Ok(Json(state.dispatcher.list_tasks(&principal)?))
}

#[derive(Deserialize)]
struct FilesQuery {
    #[serde(default)]
    path: String,
}

async fn list_files(
    State(state): State<AppState>,
    principal: Principal,
    Path(task_id): Path<i64>,
    Query(query): Query<FilesQuery>,
) -> Result<Json<Vec<FileNode>>, CoreError> {
    Ok(Json(state.dispatcher.list_task_files(
        &principal,
        task_id,
        &query.path,
    )?))
}

#[derive(Deserialize)]
struct DownloadQuery {
    path: String,
}

async fn download_file(
    State(state): State<AppState>,
    principal: Principal,
    Path(task_id): Path<i64>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, CoreError> {
    let file = state
        .dispatcher
        .download_path(&principal, task_id, &query.path)?;
    let bytes = tokio::fs::read(&file).await?;

    let filename = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());

    Ok((
        [
            (
                header::CONTENT_TYPE,
                "application/octet-stream".to_string(),
            ),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        bytes,
    )
        .into_response())
}

async fn workspace_tree(
    State(state): State<AppState>,
    principal: Principal,
    Path(task_id): Path<i64>,
) -> Result<Json<Vec<FileNode>>, CoreError> {
    Ok(Json(state.dispatcher.workspace_tree(&principal, task_id)?))
}

async fn delete_task(
    State(state): State<AppState>,
    principal: Principal,
    Path(task_id): Path<i64>,
) -> Result<StatusCode, CoreError> {
    state.dispatcher.delete_task(&principal, task_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// 4. STATUS ROUTES
// ============================================================================

async fn task_status(
    State(state): State<AppState>,
    principal: Principal,
    Path(task_id): Path<i64>,
) -> Result<Json<Task>, CoreError> {
    Ok(Json(state.dispatcher.owned_task(&principal, task_id)?))
}

async fn task_logs(
    State(state): State<AppState>,
    principal: Principal,
    Path(task_id): Path<i64>,
) -> Result<Response, CoreError> {
    let logs = state.dispatcher.task_logs(&principal, task_id)?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        logs,
    )
        .into_response())
}

async fn gpu_status(
    State(state): State<AppState>,
    _principal: Principal,
) -> Result<Json<GpuSnapshot>, CoreError> {
    let snapshot = state.registry.snapshot().await.map_err(CoreError::Internal)?;
    Ok(Json(snapshot))
}

// ============================================================================
// 5. WEBSOCKETS
// ============================================================================

async fn ws_logs(
    State(state): State<AppState>,
    principal: Principal,
    Path(task_id): Path<i64>,
    ws: WebSocketUpgrade,
) -> Response {
    let store = state.store.clone();
    ws.on_upgrade(move |socket| bridge::stream_task_logs(store, principal, task_id, socket))
}

async fn ws_resource_status(_principal: Principal, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|socket| push_resource_status(socket))
}

async fn push_resource_status(mut socket: WebSocket) {
    let mut sys = SystemMonitor::new();
    loop {
        let status = sys.snapshot();
        let Ok(frame) = serde_json::to_string(&status) else {
            break;
        };
        if socket.send(Message::Text(frame)).await.is_err() {
            break;
        }
        tokio::time::sleep(STATUS_TICK).await;
    }
}

async fn ws_gpu_vram(_principal: Principal, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|socket| push_gpu_vram(socket))
}

async fn push_gpu_vram(mut socket: WebSocket) {
    loop {
        let frame = match monitor::gpu_free_vram() {
            Some(free) => json!({ "available_vram": free }),
            None => json!({ "error": "Could not fetch GPU VRAM" }),
        };
        if socket.send(Message::Text(frame.to_string())).await.is_err() {
            break;
        }
        tokio::time::sleep(STATUS_TICK).await;
    }
}

// ============================================================================
// 6. MIDDLEWARE
// ============================================================================

async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    log::info!(
        "{} {} -> {} ({} ms)",
        method,
        path,
        response.status().as_u16(),
        started.elapsed().as_millis()
    );
    response
}

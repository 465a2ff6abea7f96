use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::GatewayConfig;
use crate::diagnostics::{Diagnostics, DiagnosticsReport};
use crate::errors::TermResult;
use crate::gateway;
use crate::manager::SessionManager;
use crate::models::{
    AuthModeRequest, ConnectParams, CreateSessionRequest, HealthResponse, InputRequest,
    InputResponse, ResizeRequest, SessionListResponse, TerminatedResponse,
};
use crate::services::ServiceRegistry;
use crate::session::SessionInfo;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub services: Arc<ServiceRegistry>,
    pub diagnostics: Diagnostics,
    pub gateway: GatewayConfig,
}

impl AppState {
    pub fn new(
        manager: Arc<SessionManager>,
        services: Arc<ServiceRegistry>,
        gateway: GatewayConfig,
    ) -> Self {
        Self {
            manager,
            services,
            diagnostics: Diagnostics::new(),
            gateway,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/readyz", get(ready))
        .route("/diagnostics", get(diagnostics))
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/:id", get(get_session).delete(kill_session))
        .route("/sessions/:id/input", post(write_input))
        .route("/sessions/:id/resize", post(resize_session))
        .route("/sessions/:id/auth-mode", post(set_auth_mode))
        .route("/sessions/:id/ws", get(connect_session))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn ready(State(state): State<AppState>) -> Response {
    let services = state.services.readiness().await;
    let status = if services.iter().all(|s| s.healthy) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let label = if status == StatusCode::OK {
        "ready"
    } else {
        "not_ready"
    };
    (
        status,
        Json(serde_json::json!({ "status": label, "services": services })),
    )
        .into_response()
}

async fn diagnostics(State(state): State<AppState>) -> Json<DiagnosticsReport> {
    Json(
        state
            .diagnostics
            .collect(&state.manager, &state.services)
            .await,
    )
}

async fn list_sessions(State(state): State<AppState>) -> Json<SessionListResponse> {
    Json(SessionListResponse {
        sessions: state.manager.list_sessions(),
    })
}

async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> TermResult<(StatusCode, Json<SessionInfo>)> {
    let info = state
        .manager
        .create_session(request.into_options()?)
        .await?;
    Ok((StatusCode::CREATED, Json(info)))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> TermResult<Json<SessionInfo>> {
    Ok(Json(state.manager.get_session(&id)?))
}

async fn kill_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> TermResult<Json<TerminatedResponse>> {
    state.manager.kill_session(&id)?;
    info!("[api] terminated session {}", id);
    Ok(Json(TerminatedResponse {
        status: "terminated",
        id,
    }))
}

async fn write_input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<InputRequest>,
) -> TermResult<Json<InputResponse>> {
    state.manager.write_input(&id, &request.data)?;
    Ok(Json(InputResponse {
        status: "ok",
        bytes: request.data.len(),
    }))
}

async fn resize_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ResizeRequest>,
) -> TermResult<Json<SessionInfo>> {
    Ok(Json(state.manager.resize_session(
        &id,
        request.cols,
        request.rows,
    )?))
}

async fn set_auth_mode(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<AuthModeRequest>,
) -> TermResult<Json<SessionInfo>> {
    let info = state
        .manager
        .set_session_auth_mode(&id, request.mode, request.user_token, request.delegated_host)
        .await?;
    Ok(Json(info))
}

async fn connect_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let manager = state.manager.clone();
    let config = state.gateway.clone();
    ws.on_upgrade(move |socket| gateway::serve_connection(socket, manager, id, params, config))
}

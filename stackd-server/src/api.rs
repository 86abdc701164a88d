//! REST + WebSocket surface.
//!
//! Public endpoints: login, the mapper, stats, version. Everything else
//! sits behind the session guard; the WebSocket path authenticates via a
//! `token` query parameter because browsers cannot set headers on socket
//! upgrades.

use crate::error::ApiError;
use crate::projects::{self, ApplyService};
use crate::proxy_editor::SaveError;
use crate::pty::{self, AttachQuery};
use crate::state::AppState;
use crate::status;
use axum::extract::{ConnectInfo, Query, Request, State, WebSocketUpgrade};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use stackd_core::access_log::StatsRange;
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::warn;

pub fn router(state: Arc<AppState>) -> Router {
    let public = Router::new()
        .route("/api/login", post(login))
        .route("/api/mapper", get(get_mapper))
        .route("/api/stats", get(get_stats))
        .route("/api/version", get(get_version));

    let protected = Router::new()
        .route("/api/status", get(get_status))
        .route("/api/next-ip", get(get_next_ip))
        .route("/api/networks", get(get_networks))
        .route("/api/networks/create", post(post_network_create))
        .route("/api/networks/delete", post(post_network_delete))
        .route("/api/networks/update", post(post_network_update))
        .route("/api/apply", post(post_apply))
        .route("/api/add", post(post_add))
        .route("/api/rename", post(post_rename))
        .route("/api/delete", post(post_delete))
        .route("/api/stop", post(post_stop))
        .route("/api/restart", post(post_restart))
        .route("/api/attach", post(post_attach))
        .route("/api/config-files", get(get_config_files))
        .route("/api/config", get(get_config_file))
        .route("/api/save-config", post(post_save_config))
        .route("/api/nginx", get(get_nginx))
        .route("/api/nginx/save", post(post_nginx_save))
        .route("/api/images/list", get(get_images))
        .route("/api/images/pull", post(post_image_pull))
        .route("/api/images/delete", post(post_image_delete))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_session,
        ));

    let ws = Router::new().route("/ws/attach", get(ws_attach));

    let mut app = public
        .merge(protected)
        .merge(ws)
        .layer(cors_layer(&state.config.cors_origins))
        .layer(TraceLayer::new_for_http());

    if let Some(ui_dir) = &state.config.ui_dir {
        app = app.fallback_service(
            ServeDir::new(ui_dir).append_index_html_on_directories(true),
        );
    }

    app.with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::new();
    }
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(
            origins.iter().filter_map(|o| o.parse().ok()),
        ))
        .allow_methods(Any)
        .allow_headers(Any)
}

async fn require_session(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v))
        .unwrap_or("");
    if token.is_empty() || !state.sessions.validate(token, addr.ip()) {
        return ApiError::Auth("missing or invalid session token".into()).into_response();
    }
    next.run(req).await
}

// ---------------------------------------------------------------------------
// public
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LoginRequest {
    password: String,
}

async fn login(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    use crate::session::LoginError;
    match state.sessions.login(&req.password, addr.ip()) {
        Ok(token) => Ok(Json(json!({ "token": token }))),
        Err(LoginError::RateLimited) => Err(ApiError::RateLimited),
        Err(LoginError::Rejected) => Err(ApiError::Auth("invalid password".into())),
        Err(LoginError::Disabled) => Err(ApiError::Auth("login is disabled".into())),
    }
}

async fn get_mapper(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut index = state.mapper.snapshot().await;
    // In-flight transitions are fresher than the last tick.
    status::overlay_transient(&mut index, &state.lifecycle);
    Json(index)
}

#[derive(Debug, Deserialize)]
struct RangeQuery {
    #[serde(default)]
    range: Option<String>,
}

async fn get_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RangeQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let range = query.range.as_deref().unwrap_or("1h");
    let range = StatsRange::parse(range)
        .ok_or_else(|| ApiError::Validation(format!("invalid range: {range}")))?;
    let index = state.mapper.snapshot().await;
    Ok(Json(crate::stats::compute(&state.config, &index, range).await))
}

async fn get_version() -> impl IntoResponse {
    Json(json!({ "version": env!("CARGO_PKG_VERSION") }))
}

// ---------------------------------------------------------------------------
// projects & lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ServiceQuery {
    path: String,
    service: String,
}

async fn get_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ServiceQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let project = projects::resolve_project(&state.config, &query.path)?;
    let status = state.lifecycle.service_status(&project, &query.service).await;
    Ok(Json(json!({ "status": status })))
}

#[derive(Debug, Deserialize)]
struct ApplyRequest {
    path: String,
    #[serde(default)]
    services: BTreeMap<String, ApplyService>,
}

async fn post_apply(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ApplyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let changed = projects::apply(&state.config, &req.path, &req.services)?;
    state.reconciler.tick_now().await;
    Ok(Json(json!({ "changed": changed })))
}

#[derive(Debug, Deserialize)]
struct AddRequest {
    name: String,
}

async fn post_add(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let project = projects::add_from_template(&state.config, &req.name)?;
    state.reconciler.tick_now().await;
    Ok(Json(json!({ "path": project.rel })))
}

async fn running_or_empty(state: &AppState, rel: &str) -> HashSet<String> {
    let Ok(project) = projects::resolve_project(&state.config, rel) else {
        return HashSet::new();
    };
    match state.lifecycle.running_services(&project).await {
        Ok(running) => running,
        Err(e) => {
            warn!("cannot query running services for {rel}: {e:#}");
            HashSet::new()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenameRequest {
    path: String,
    new_name: String,
}

async fn post_rename(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RenameRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let running = running_or_empty(&state, &req.path).await;
    let new_rel = projects::rename(&state.config, &running, &req.path, &req.new_name)?;
    state.reconciler.tick_now().await;
    Ok(Json(json!({ "path": new_rel })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteRequest {
    path: String,
    confirm_name: String,
}

async fn post_delete(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DeleteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let running = running_or_empty(&state, &req.path).await;
    projects::delete(&state.config, &running, &req.path, &req.confirm_name)?;
    state.reconciler.tick_now().await;
    Ok(Json(json!({ "ok": true })))
}

async fn post_stop(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ServiceQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let project = projects::resolve_project(&state.config, &req.path)?;
    state.lifecycle.stop(&project, &req.service).await?;
    state.reconciler.tick_now().await;
    Ok(Json(json!({ "ok": true })))
}

async fn post_restart(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ServiceQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let project = projects::resolve_project(&state.config, &req.path)?;
    state.lifecycle.restart(&project, &req.service).await?;
    state.reconciler.tick_now().await;
    Ok(Json(json!({ "ok": true })))
}

/// Start is restart under the hood: the restart script (or `compose
/// restart`) brings a stopped service up.
async fn post_attach(
    state: State<Arc<AppState>>,
    req: Json<ServiceQuery>,
) -> Result<impl IntoResponse, ApiError> {
    post_restart(state, req).await
}

// ---------------------------------------------------------------------------
// per-project config files
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ConfigQuery {
    path: String,
    #[serde(default)]
    file: Option<String>,
}

async fn get_config_files(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConfigQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let files = projects::list_config_files(&state.config, &query.path)?;
    Ok(Json(json!({ "files": files })))
}

async fn get_config_file(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConfigQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let file = query
        .file
        .as_deref()
        .ok_or_else(|| ApiError::Validation("file is required".into()))?;
    let content = projects::read_config_file(&state.config, &query.path, file)?;
    Ok(Json(json!({ "content": content })))
}

#[derive(Debug, Deserialize)]
struct SaveConfigRequest {
    path: String,
    file: String,
    content: String,
}

async fn post_save_config(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SaveConfigRequest>,
) -> Result<impl IntoResponse, ApiError> {
    projects::save_config_file(&state.config, &req.path, &req.file, &req.content)?;
    Ok(Json(json!({ "ok": true })))
}

// ---------------------------------------------------------------------------
// proxy config
// ---------------------------------------------------------------------------

async fn get_nginx(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let content = state.proxy.read().await.map_err(ApiError::Internal)?;
    let parsed = stackd_core::nginx::parse(&content);
    Ok(Json(json!({ "content": content, "parsed": parsed })))
}

#[derive(Debug, Deserialize)]
struct NginxSaveRequest {
    content: String,
}

async fn post_nginx_save(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NginxSaveRequest>,
) -> Result<Response, ApiError> {
    match state.proxy.save(&req.content).await {
        Ok(()) => Ok(Json(json!({ "ok": true })).into_response()),
        Err(SaveError::RolledBack(failure)) => Ok((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": format!("proxy config {} failed", failure.phase),
                "phase": failure.phase,
                "stderr": failure.stderr,
            })),
        )
            .into_response()),
        Err(SaveError::Io(e)) => Err(ApiError::Internal(e)),
    }
}

// ---------------------------------------------------------------------------
// docker networks & images
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct NetworkQuery {
    network: String,
}

async fn get_next_ip(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NetworkQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let index = state.mapper.snapshot().await;
    let ip = state
        .docker
        .next_ip(&state.config, &index, &query.network)
        .await?;
    Ok(Json(json!({ "ip": ip })))
}

async fn get_networks(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.docker.list_networks().await?))
}

#[derive(Debug, Deserialize)]
struct NetworkCreateRequest {
    name: String,
    #[serde(default)]
    subnet: Option<String>,
    #[serde(default)]
    gateway: Option<String>,
}

async fn post_network_create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NetworkCreateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .docker
        .create_network(&req.name, req.subnet.as_deref(), req.gateway.as_deref())
        .await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct NetworkDeleteRequest {
    name: String,
}

async fn post_network_delete(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NetworkDeleteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.docker.delete_network(&req.name).await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct NetworkUpdateRequest {
    name: String,
    subnet: String,
    #[serde(default)]
    gateway: Option<String>,
}

async fn post_network_update(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NetworkUpdateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .docker
        .update_network(&req.name, &req.subnet, req.gateway.as_deref())
        .await?;
    Ok(Json(json!({ "ok": true })))
}

async fn get_images(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.docker.list_images().await?))
}

#[derive(Debug, Deserialize)]
struct ImagePullRequest {
    image: String,
}

async fn post_image_pull(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ImagePullRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.docker.pull_image(&req.image).await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct ImageDeleteRequest {
    id: String,
}

async fn post_image_delete(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ImageDeleteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.docker.delete_image(&req.id).await?;
    Ok(Json(json!({ "ok": true })))
}

// ---------------------------------------------------------------------------
// websocket
// ---------------------------------------------------------------------------

async fn ws_attach(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<AttachQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = query.token.as_deref().unwrap_or("");
    if token.is_empty() || !state.sessions.validate(token, addr.ip()) {
        return ApiError::Auth("missing or invalid session token".into()).into_response();
    }
    ws.on_upgrade(move |socket| pty::handle_session(state, socket, query))
}

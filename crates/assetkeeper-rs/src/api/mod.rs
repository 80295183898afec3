use std::time::Duration;

use axum::{
    extract::{Path, Query, Request, State},
    http::{HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;
use uuid::Uuid;

use crate::{
    auth::Session,
    error::{InventoryError, InventoryResult},
    inventory::{self, ForceDelete, Reconciler},
    ledger,
    models::{AssetRecord, DiscoveredDevice, Fingerprints, ImportSummary},
    probe::ToolAdapter,
    scan::{ScanEvent, ScanSession},
    security::{probe_token_matches, validate_target},
    AppState,
};

pub const PROBE_TOKEN_HEADER: &str = "x-probe-token";
pub const SCAN_ID_HEADER: &str = "x-scan-id";

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "assetkeeper-rs",
        "time": chrono::Utc::now().to_rfc3339(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    token: String,
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> InventoryResult<Json<LoginResponse>> {
    if req.username.trim().is_empty() || req.password.is_empty() {
        return Err(InventoryError::Validation("username and password required".to_string()));
    }
    let token = state
        .sessions
        .login(&state.config.operators, &req.username, &req.password)
        .await
        .ok_or(InventoryError::Unauthorized("invalid credentials"))?;
    Ok(Json(LoginResponse { token }))
}

pub async fn logout(State(state): State<AppState>, req: Request) -> Response {
    if let Some(token) = bearer(&req) {
        state.sessions.logout(&token).await;
    }
    Json(serde_json::json!({"ok": true})).into_response()
}

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    #[serde(default)]
    target: String,
}

/// Batch scan: waits for the probe and returns the reconciled result.
pub async fn scan(
    State(state): State<AppState>,
    Json(req): Json<ScanRequest>,
) -> InventoryResult<Json<Vec<DiscoveredDevice>>> {
    let target = validate_target(&req.target)?;
    info!(tool = state.probe.name(), %target, "batch scan requested");
    let devices = state.probe.discover(&target).await?;
    let devices = Reconciler::new(state.pool.clone()).prepare(devices).await?;
    Ok(Json(devices))
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    target: String,
}

/// Streaming scan over Server-Sent Events. Closing the connection kills the
/// probe.
pub async fn scan_stream(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> InventoryResult<Response> {
    let keepalive = Duration::from_secs(state.config.keepalive_secs.max(1));
    let session = ScanSession::start(&state.probe, &query.target, keepalive)?
        .with_reconciler(Reconciler::new(state.pool.clone()));
    let (id, rx, _) = state.scans.launch(session).await;

    let stream = ReceiverStream::new(rx).map(to_sse);
    let mut response = Sse::new(stream).into_response();
    if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(SCAN_ID_HEADER), value);
    }
    Ok(response)
}

fn to_sse(event: ScanEvent) -> Result<Event, axum::Error> {
    // Event::data rejects carriage returns.
    let clean = |s: String| s.replace('\r', "");
    match event {
        ScanEvent::Log(line) => Ok(Event::default().event("log").data(clean(line))),
        ScanEvent::KeepAlive => Ok(Event::default().comment("")),
        ScanEvent::Result(devices) => Event::default().event("result").json_data(devices),
        ScanEvent::Error(msg) => Ok(Event::default().event("error").data(clean(msg))),
    }
}

pub async fn stop_scan(State(state): State<AppState>, Path(id): Path<Uuid>) -> Json<serde_json::Value> {
    let stopped = state.scans.stop(&id).await;
    Json(serde_json::json!({ "stopped": stopped }))
}

pub async fn list_assets(State(state): State<AppState>) -> InventoryResult<Json<Vec<AssetRecord>>> {
    Ok(Json(inventory::list(&state.pool).await?))
}

pub async fn create_asset(
    State(state): State<AppState>,
    Json(device): Json<DiscoveredDevice>,
) -> InventoryResult<Response> {
    let id = inventory::create(&state.pool, &device).await?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": id }))).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ImportRequest {
    #[serde(default)]
    assets: Vec<DiscoveredDevice>,
}

pub async fn import_assets(
    State(state): State<AppState>,
    session: Option<axum::Extension<Session>>,
    Json(req): Json<ImportRequest>,
) -> InventoryResult<Json<ImportSummary>> {
    let actor = session.map(|s| s.0.username).unwrap_or_default();
    info!(%actor, count = req.assets.len(), "bulk import requested");
    Ok(Json(inventory::import(&state.pool, &req.assets).await?))
}

pub async fn update_asset(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(device): Json<DiscoveredDevice>,
) -> InventoryResult<Json<serde_json::Value>> {
    let updated = inventory::update(&state.pool, &id, &device).await?;
    Ok(Json(serde_json::json!({ "updated": updated })))
}

pub async fn force_delete_assets(
    State(state): State<AppState>,
    Query(criteria): Query<ForceDelete>,
) -> InventoryResult<Json<serde_json::Value>> {
    let deleted = inventory::force_delete(&state.pool, &criteria).await?;
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

pub async fn delete_asset(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> InventoryResult<Json<serde_json::Value>> {
    let deleted = inventory::delete(&state.pool, &id).await?;
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

pub async fn fingerprints(State(state): State<AppState>) -> InventoryResult<Json<Fingerprints>> {
    Ok(Json(inventory::known_fingerprints(&state.pool).await?))
}

pub async fn next_id(
    State(state): State<AppState>,
    Path(asset_type): Path<String>,
) -> InventoryResult<Json<serde_json::Value>> {
    let id = ledger::next_id(&state.pool, &asset_type).await?;
    Ok(Json(serde_json::json!({ "id": id })))
}

pub async fn auth_middleware(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    if let Some(token) = bearer(&req) {
        if let Some(session) = state.sessions.get(&token).await {
            req.extensions_mut().insert(session);
            return next.run(req).await;
        }
    }
    InventoryError::Unauthorized("unauthorized").into_response()
}

/// Admits the probe by shared secret, otherwise falls back to a session.
pub async fn probe_or_auth_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let presented = req
        .headers()
        .get(PROBE_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    if let Some(presented) = presented {
        if probe_token_matches(&state.config.probe_token, presented) {
            return next.run(req).await;
        }
        return InventoryError::Unauthorized("invalid probe token").into_response();
    }
    auth_middleware(State(state), req, next).await
}

fn bearer(req: &Request) -> Option<String> {
    let value = req.headers().get("Authorization")?.to_str().ok()?;
    value.strip_prefix("Bearer ").map(ToString::to_string)
}

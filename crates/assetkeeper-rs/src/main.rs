mod api;
mod auth;
mod config;
mod db;
mod error;
mod inventory;
mod ledger;
mod models;
mod normalize;
mod probe;
mod scan;
mod security;

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    http::HeaderValue,
    middleware::from_fn_with_state,
    routing::{delete, get, post, put},
    Router,
};
use tower_http::{
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::{
    api::{
        auth_middleware, create_asset, delete_asset, fingerprints, force_delete_assets, health,
        import_assets, list_assets, login, logout, next_id, probe_or_auth_middleware, scan,
        scan_stream, stop_scan, update_asset,
    },
    auth::SessionStore,
    config::AppConfig,
    probe::ProbeRunner,
    scan::ScanRegistry,
};

#[derive(Clone)]
pub struct AppState {
    pub pool: sqlx::SqlitePool,
    pub sessions: SessionStore,
    pub scans: ScanRegistry,
    pub probe: Arc<ProbeRunner>,
    pub config: Arc<AppConfig>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = Arc::new(AppConfig::load()?);

    let pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(&pool).await?;

    if config.probe_token.is_empty() {
        warn!("probe_token is empty; probe callbacks will be rejected");
    }
    if config.operators.is_empty() {
        warn!("no operators configured; nobody can log in");
    }

    let state = AppState {
        pool,
        sessions: SessionStore::default(),
        scans: ScanRegistry::default(),
        probe: Arc::new(ProbeRunner::from_config(&config)),
        config: config.clone(),
    };

    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "assetkeeper-rs listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    let operator = Router::new()
        .route("/api/auth/logout", post(logout))
        .route("/api/scan", post(scan))
        .route("/api/scan/stream", get(scan_stream))
        .route("/api/scan/:id", delete(stop_scan))
        .route("/api/assets", get(list_assets).post(create_asset))
        .route("/api/assets/bulk", post(import_assets))
        .route("/api/assets/force-delete", delete(force_delete_assets))
        .route("/api/assets/:id", put(update_asset).delete(delete_asset))
        .route_layer(from_fn_with_state(state.clone(), auth_middleware));

    let probe = Router::new()
        .route("/api/assets/fingerprints", get(fingerprints))
        .route("/api/assets/next-id/:asset_type", get(next_id))
        .route_layer(from_fn_with_state(state.clone(), probe_or_auth_middleware));

    let cors = cors_layer(&state.config.cors_origins);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/auth/login", post(login))
        .merge(operator)
        .merge(probe)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    if allowed.is_empty() {
        return CorsLayer::permissive();
    }
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();
}

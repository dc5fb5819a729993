use anyhow::{anyhow, Context, Result};
use ap_core::{config as env, db, http, logging, server};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use sqlx::{Pool, Postgres};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub mod filters;
pub mod groups;
pub mod instance;
pub mod kinds;
pub mod kv;
pub mod management;
pub mod registry;
pub mod store;
pub mod tenant;
mod ws;

#[cfg(test)]
mod testing;

pub(crate) const SERVICE_NAME: &str = "ap-relay";

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool<Postgres>,
    pub registry: Arc<registry::Registry>,
}

#[derive(Serialize)]
struct HealthStatus {
    status: String,
}

#[derive(Clone)]
pub struct RelayConfig {
    pub addr: SocketAddr,
    pub database_url: String,
    pub config_dir: PathBuf,
    pub media_dir: PathBuf,
    pub config_poll_seconds: u64,
}

pub fn load_config() -> Result<RelayConfig> {
    let port: u16 = env::env_or("PORT", "3334")
        .parse()
        .map_err(|err| anyhow!("invalid PORT: {err}"))?;
    let database_url = env::required_env("DATABASE_URL")?;
    let config_dir = PathBuf::from(env::env_or("CONFIG", "./config"));
    let media_dir = PathBuf::from(env::env_or("MEDIA", "./media"));
    let config_poll_seconds = env::int_from_env("CONFIG_POLL_SECONDS", 10) as u64;

    Ok(RelayConfig {
        addr: SocketAddr::from(([0, 0, 0, 0], port)),
        database_url,
        config_dir,
        media_dir,
        config_poll_seconds,
    })
}

pub async fn run(config: RelayConfig) -> Result<()> {
    logging::init(SERVICE_NAME);

    std::fs::create_dir_all(&config.media_dir).context("failed to create media directory")?;

    let pool = db::connect(&config.database_url).await?;
    let registry = registry::Registry::boot(pool.clone(), &config.config_dir).await?;
    registry.spawn_reload_loop(Duration::from_secs(config.config_poll_seconds.max(1)));

    let state = AppState { pool, registry };
    let router = Router::new()
        .route("/", get(ws::root_handler))
        .route("/healthz", get(healthz))
        .with_state(state);

    let router = http::apply_standard_layers(router, SERVICE_NAME);
    server::serve(config.addr, router).await
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    match db::check_ready(&state.pool).await {
        Ok(_) => (StatusCode::OK, Json(HealthStatus { status: "ok".into() })),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthStatus {
                status: "unavailable".into(),
            }),
        ),
    }
}

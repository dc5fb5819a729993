use anyhow::Result;
use sqlx::{postgres::PgPoolOptions, Pool, Postgres};
use std::time::Duration;

use crate::config::int_from_env;

/// Open the shared process-wide pool. Sizing knobs are optional envs with
/// defaults that match a small deployment.
pub async fn connect(database_url: &str) -> Result<Pool<Postgres>> {
    let max_conns = int_from_env("DB_MAX_CONNS", 20);
    let acquire_timeout = int_from_env("DB_ACQUIRE_TIMEOUT_SECS", 30);
    let max_lifetime = int_from_env("DB_CONN_MAX_LIFETIME_SECS", 300);

    let pool = PgPoolOptions::new()
        .max_connections(max_conns)
        .acquire_timeout(Duration::from_secs(acquire_timeout as u64))
        .max_lifetime(Duration::from_secs(max_lifetime as u64))
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn check_ready(pool: &Pool<Postgres>) -> Result<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

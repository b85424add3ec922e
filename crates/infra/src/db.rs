//! Postgres connection pool and embedded migrations.

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::store::{StoreError, StoreResult};

/// Open a pool and wait until the first connection succeeds.
pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
        .map_err(|e| StoreError::database("connect", e.to_string()))?;

    info!(max_connections, "postgres connection pool established");
    Ok(pool)
}

/// Apply pending migrations from `crates/infra/migrations`.
pub async fn migrate(pool: &PgPool) -> StoreResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::database("migrate", e.to_string()))?;
    info!("database migrations applied");
    Ok(())
}

pub async fn health_check(pool: &PgPool) -> StoreResult<()> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map_err(|e| StoreError::database("health_check", e.to_string()))?;
    Ok(())
}

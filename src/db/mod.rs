//! Database pool construction and schema migrations.
//!
//! SYSTEM CONTEXT
//! ==============
//! `main` calls [`init_pool`] once before binding the listener, so no request
//! is ever served against an unmigrated schema.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::config::DatabaseConfig;

/// Connect the `PostgreSQL` pool and apply pending migrations.
///
/// # Errors
///
/// Returns an error if the connection or a migration fails.
pub async fn init_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .connect(&config.url)
        .await?;

    sqlx::migrate!("src/db/migrations").run(&pool).await?;
    info!(max_connections = config.max_connections, "database ready");

    Ok(pool)
}

//! Document storages on PostgreSQL.
//!
//! Entities are JSONB documents; uniqueness is enforced by expression
//! indexes. Every call is bounded by the configured timeout.

mod app;
mod token;
mod user;
mod verification;

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};

use crate::error::{Result, ToInternal};

pub use app::PgAppStorage;
pub use token::{PgTokenBlacklist, PgTokenStorage};
pub use user::PgUserStorage;
pub use verification::PgVerificationCodeStorage;

pub const DEFAULT_POOL_SIZE: u32 = 10;

/// Connect to PostgreSQL, then run migrations.
pub async fn connect(
    uri: &str,
    pool_size: Option<u32>,
    timeout: Duration,
) -> Result<Pool<Postgres>> {
    let pool = PgPoolOptions::new()
        .max_connections(pool_size.unwrap_or(DEFAULT_POOL_SIZE))
        .acquire_timeout(timeout)
        .connect(uri)
        .await?;

    sqlx::migrate!("migrations/postgres")
        .run(&pool)
        .await
        .catch()?;

    tracing::debug!("postgres database ready");
    Ok(pool)
}

/// Test pool from `DATABASE_URL`.
#[cfg(test)]
pub(crate) async fn test_pool() -> Pool<Postgres> {
    let uri = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL must be set to run postgres tests");
    connect(&uri, Some(2), Duration::from_secs(5)).await.unwrap()
}

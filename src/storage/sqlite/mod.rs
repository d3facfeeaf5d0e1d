//! Embedded key-value storages.
//!
//! Everything lives in one `kv` table split in buckets. Unique lookups
//! (username, email, ...) are buckets too, mapping a key to an ID.

mod app;
mod token;
mod user;
mod verification;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions,
};
use sqlx::{Pool, Sqlite, SqliteConnection, Transaction};

use crate::error::{Result, ToInternal};

pub use app::SqliteAppStorage;
pub use token::{SqliteTokenBlacklist, SqliteTokenStorage};
pub use user::SqliteUserStorage;
pub use verification::SqliteVerificationCodeStorage;

/// Path opening a private in-memory database.
pub const IN_MEMORY: &str = ":memory:";
const DEFAULT_POOL_SIZE: u32 = 5;
/// How long a writer waits for the database lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (and create when missing) database at `path`, then run migrations.
pub async fn connect(path: &str, pool_size: Option<u32>) -> Result<Pool<Sqlite>> {
    let in_memory = path.is_empty() || path == IN_MEMORY;

    let (options, pool_size) = if in_memory {
        // Each connection owns its own memory database.
        (SqliteConnectOptions::from_str("sqlite::memory:")?, 1)
    } else {
        (
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(BUSY_TIMEOUT),
            pool_size.unwrap_or(DEFAULT_POOL_SIZE),
        )
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(pool_size)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    sqlx::migrate!("migrations/sqlite").run(&pool).await.catch()?;

    tracing::debug!(path, "sqlite database ready");
    Ok(pool)
}

/// Start a transaction holding the write lock from its first statement.
///
/// A deferred transaction reading then writing cannot upgrade its lock
/// while another connection writes, and fails with `SQLITE_BUSY` instead
/// of waiting.
pub(crate) async fn begin_write(
    pool: &Pool<Sqlite>,
) -> Result<Transaction<'static, Sqlite>> {
    Ok(pool.begin_with("BEGIN IMMEDIATE").await?)
}

pub(crate) async fn get(
    conn: &mut SqliteConnection,
    bucket: &str,
    key: &str,
) -> Result<Option<String>> {
    let row = sqlx::query_as::<_, (String,)>(
        "SELECT value FROM kv WHERE bucket = ?1 AND key = ?2",
    )
    .bind(bucket)
    .bind(key)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(|(value,)| value))
}

/// Insert a new key, failing with `AlreadyExists` when taken.
pub(crate) async fn insert(
    conn: &mut SqliteConnection,
    bucket: &str,
    key: &str,
    value: &str,
    expires_at: Option<i64>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO kv (bucket, key, value, expires_at) VALUES (?1, ?2, ?3, ?4)",
    )
    .bind(bucket)
    .bind(key)
    .bind(value)
    .bind(expires_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub(crate) async fn upsert(
    conn: &mut SqliteConnection,
    bucket: &str,
    key: &str,
    value: &str,
    expires_at: Option<i64>,
) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO kv (bucket, key, value, expires_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (bucket, key) DO UPDATE
            SET value = excluded.value, expires_at = excluded.expires_at"#,
    )
    .bind(bucket)
    .bind(key)
    .bind(value)
    .bind(expires_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Insert a key, keeping the latest of both expiries on conflict.
pub(crate) async fn extend(
    conn: &mut SqliteConnection,
    bucket: &str,
    key: &str,
    expires_at: i64,
) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO kv (bucket, key, value, expires_at)
            VALUES (?1, ?2, '', ?3)
            ON CONFLICT (bucket, key) DO UPDATE
            SET expires_at = max(
                coalesce(kv.expires_at, excluded.expires_at),
                excluded.expires_at
            )"#,
    )
    .bind(bucket)
    .bind(key)
    .bind(expires_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Remove a key, returning whether it existed.
pub(crate) async fn remove(
    conn: &mut SqliteConnection,
    bucket: &str,
    key: &str,
) -> Result<bool> {
    let result = sqlx::query("DELETE FROM kv WHERE bucket = ?1 AND key = ?2")
        .bind(bucket)
        .bind(key)
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected() > 0)
}

pub(crate) async fn values(
    conn: &mut SqliteConnection,
    bucket: &str,
) -> Result<Vec<String>> {
    let rows = sqlx::query_as::<_, (String,)>(
        "SELECT value FROM kv WHERE bucket = ?1 ORDER BY key",
    )
    .bind(bucket)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows.into_iter().map(|(value,)| value).collect())
}

/// Remove every key of `bucket` expired at `now`.
pub(crate) async fn remove_expired(
    conn: &mut SqliteConnection,
    bucket: &str,
    now: i64,
) -> Result<u64> {
    let result = sqlx::query(
        r#"DELETE FROM kv
            WHERE bucket = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2"#,
    )
    .bind(bucket)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

#[cfg(test)]
pub(crate) async fn test_pool() -> Pool<Sqlite> {
    connect(IN_MEMORY, None).await.unwrap()
}

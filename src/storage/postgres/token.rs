use std::time::Duration;

use async_trait::async_trait;
use sqlx::{Pool, Postgres};

use crate::error::{Result, ServerError};
use crate::storage::{TokenBlacklist, TokenStorage, with_timeout};

pub struct PgTokenStorage {
    pool: Pool<Postgres>,
    timeout: Duration,
}

impl PgTokenStorage {
    pub fn new(pool: Pool<Postgres>, timeout: Duration) -> Self {
        Self { pool, timeout }
    }
}

#[async_trait]
impl TokenStorage for PgTokenStorage {
    async fn save_token(&self, token: &str, expires_at: i64) -> Result<()> {
        with_timeout(self.timeout, async {
            sqlx::query(
                r#"INSERT INTO refresh_tokens (token, created_at, expires_at)
                    VALUES ($1, $2, $3) ON CONFLICT (token) DO NOTHING"#,
            )
            .bind(token)
            .bind(chrono::Utc::now().timestamp())
            .bind(expires_at)
            .execute(&self.pool)
            .await?;
            Ok::<_, ServerError>(())
        })
        .await
    }

    async fn has_token(&self, token: &str) -> Result<bool> {
        with_timeout(self.timeout, async {
            let (exists,) = sqlx::query_as::<_, (bool,)>(
                "SELECT EXISTS (SELECT 1 FROM refresh_tokens WHERE token = $1)",
            )
            .bind(token)
            .fetch_one(&self.pool)
            .await?;
            Ok::<_, ServerError>(exists)
        })
        .await
    }

    async fn delete_token(&self, token: &str) -> Result<()> {
        with_timeout(self.timeout, async {
            sqlx::query("DELETE FROM refresh_tokens WHERE token = $1")
                .bind(token)
                .execute(&self.pool)
                .await?;
            Ok::<_, ServerError>(())
        })
        .await
    }

    async fn delete_expired(&self) -> Result<u64> {
        with_timeout(self.timeout, async {
            let result = sqlx::query(
                r#"DELETE FROM refresh_tokens
                    WHERE expires_at IS NOT NULL AND expires_at <= $1"#,
            )
            .bind(chrono::Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
            Ok::<_, ServerError>(result.rows_affected())
        })
        .await
    }
}

pub struct PgTokenBlacklist {
    pool: Pool<Postgres>,
    timeout: Duration,
}

impl PgTokenBlacklist {
    pub fn new(pool: Pool<Postgres>, timeout: Duration) -> Self {
        Self { pool, timeout }
    }
}

#[async_trait]
impl TokenBlacklist for PgTokenBlacklist {
    async fn is_blacklisted(&self, jti: &str) -> Result<bool> {
        with_timeout(self.timeout, async {
            let (exists,) = sqlx::query_as::<_, (bool,)>(
                "SELECT EXISTS (SELECT 1 FROM token_blacklist WHERE jti = $1)",
            )
            .bind(jti)
            .fetch_one(&self.pool)
            .await?;
            Ok::<_, ServerError>(exists)
        })
        .await
    }

    async fn add(&self, jti: &str, expires_at: i64) -> Result<()> {
        with_timeout(self.timeout, async {
            sqlx::query(
                r#"INSERT INTO token_blacklist (jti, expires_at) VALUES ($1, $2)
                    ON CONFLICT (jti) DO UPDATE SET expires_at =
                        GREATEST(token_blacklist.expires_at, excluded.expires_at)"#,
            )
            .bind(jti)
            .bind(expires_at)
            .execute(&self.pool)
            .await?;
            Ok::<_, ServerError>(())
        })
        .await
    }

    async fn cleanup_expired(&self) -> Result<u64> {
        with_timeout(self.timeout, async {
            let result =
                sqlx::query("DELETE FROM token_blacklist WHERE expires_at <= $1")
                    .bind(chrono::Utc::now().timestamp())
                    .execute(&self.pool)
                    .await?;
            Ok::<_, ServerError>(result.rows_affected())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::postgres::test_pool;

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_blacklist() {
        let blacklist =
            PgTokenBlacklist::new(test_pool().await, Duration::from_secs(5));
        let jti = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp();

        assert!(!blacklist.is_blacklisted(&jti).await.unwrap());
        blacklist.add(&jti, now + 60).await.unwrap();
        blacklist.add(&jti, now + 60).await.unwrap();
        assert!(blacklist.is_blacklisted(&jti).await.unwrap());

        blacklist.cleanup_expired().await.unwrap();
        assert!(blacklist.is_blacklisted(&jti).await.unwrap());
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_token_storage() {
        let storage =
            PgTokenStorage::new(test_pool().await, Duration::from_secs(5));
        let token = uuid::Uuid::new_v4().to_string();
        let stale = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp();

        storage.save_token(&token, now + 60).await.unwrap();
        storage.save_token(&stale, now - 60).await.unwrap();
        assert!(storage.has_token(&token).await.unwrap());

        assert!(storage.delete_expired().await.unwrap() >= 1);
        assert!(!storage.has_token(&stale).await.unwrap());
        assert!(storage.has_token(&token).await.unwrap());
        storage.delete_token(&token).await.unwrap();
        assert!(!storage.has_token(&token).await.unwrap());
    }
}

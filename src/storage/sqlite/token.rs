use async_trait::async_trait;
use sqlx::{Pool, Sqlite};

use super::{extend, get, remove, remove_expired, upsert};
use crate::error::Result;
use crate::storage::{TokenBlacklist, TokenStorage};

const REFRESH_TOKENS: &str = "refresh_tokens";
const BLACKLIST: &str = "blacklist";

pub struct SqliteTokenStorage {
    pool: Pool<Sqlite>,
}

impl SqliteTokenStorage {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TokenStorage for SqliteTokenStorage {
    async fn save_token(&self, token: &str, expires_at: i64) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        upsert(&mut conn, REFRESH_TOKENS, token, "", Some(expires_at)).await
    }

    async fn has_token(&self, token: &str) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        Ok(get(&mut conn, REFRESH_TOKENS, token).await?.is_some())
    }

    async fn delete_token(&self, token: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        remove(&mut conn, REFRESH_TOKENS, token).await?;
        Ok(())
    }

    async fn delete_expired(&self) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        let now = chrono::Utc::now().timestamp();
        remove_expired(&mut conn, REFRESH_TOKENS, now).await
    }
}

pub struct SqliteTokenBlacklist {
    pool: Pool<Sqlite>,
}

impl SqliteTokenBlacklist {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TokenBlacklist for SqliteTokenBlacklist {
    async fn is_blacklisted(&self, jti: &str) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        Ok(get(&mut conn, BLACKLIST, jti).await?.is_some())
    }

    async fn add(&self, jti: &str, expires_at: i64) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        extend(&mut conn, BLACKLIST, jti, expires_at).await
    }

    async fn cleanup_expired(&self) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        remove_expired(&mut conn, BLACKLIST, chrono::Utc::now().timestamp())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::test_pool;

    #[tokio::test]
    async fn test_token_storage() {
        let storage = SqliteTokenStorage::new(test_pool().await);
        let now = chrono::Utc::now().timestamp();
        storage.save_token("refresh", now + 60).await.unwrap();
        storage.save_token("refresh", now + 60).await.unwrap();
        storage.save_token("stale", now - 60).await.unwrap();
        assert!(storage.has_token("refresh").await.unwrap());

        assert_eq!(storage.delete_expired().await.unwrap(), 1);
        assert!(!storage.has_token("stale").await.unwrap());
        assert!(storage.has_token("refresh").await.unwrap());

        storage.delete_token("refresh").await.unwrap();
        assert!(!storage.has_token("refresh").await.unwrap());
    }

    #[tokio::test]
    async fn test_blacklist() {
        let pool = test_pool().await;
        let blacklist = SqliteTokenBlacklist::new(pool.clone());
        let now = chrono::Utc::now().timestamp();

        blacklist.add("live", now + 60).await.unwrap();
        blacklist.add("dead", now - 60).await.unwrap();
        assert!(blacklist.is_blacklisted("dead").await.unwrap());

        // Buckets are independent.
        let tokens = SqliteTokenStorage::new(pool);
        assert!(!tokens.has_token("live").await.unwrap());

        assert_eq!(blacklist.cleanup_expired().await.unwrap(), 1);
        assert!(blacklist.is_blacklisted("live").await.unwrap());
        assert!(!blacklist.is_blacklisted("dead").await.unwrap());
    }

    #[tokio::test]
    async fn test_blacklist_keeps_latest_expiry() {
        let blacklist = SqliteTokenBlacklist::new(test_pool().await);
        let now = chrono::Utc::now().timestamp();

        blacklist.add("jti", now + 60).await.unwrap();
        blacklist.add("jti", now - 60).await.unwrap();

        assert_eq!(blacklist.cleanup_expired().await.unwrap(), 0);
        assert!(blacklist.is_blacklisted("jti").await.unwrap());
    }
}

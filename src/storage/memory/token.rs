use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::storage::{TokenBlacklist, TokenStorage};

/// Refresh tokens with their expiry.
#[derive(Default)]
pub struct MemoryTokenStorage {
    tokens: RwLock<HashMap<String, i64>>,
}

impl MemoryTokenStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStorage for MemoryTokenStorage {
    async fn save_token(&self, token: &str, expires_at: i64) -> Result<()> {
        self.tokens.write().await.insert(token.to_owned(), expires_at);
        Ok(())
    }

    async fn has_token(&self, token: &str) -> Result<bool> {
        Ok(self.tokens.read().await.contains_key(token))
    }

    async fn delete_token(&self, token: &str) -> Result<()> {
        self.tokens.write().await.remove(token);
        Ok(())
    }

    async fn delete_expired(&self) -> Result<u64> {
        let now = chrono::Utc::now().timestamp();
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|_, expires_at| *expires_at > now);

        Ok((before - tokens.len()) as u64)
    }
}

/// Revoked `jti` with their expiry.
#[derive(Default)]
pub struct MemoryTokenBlacklist {
    entries: RwLock<HashMap<String, i64>>,
}

impl MemoryTokenBlacklist {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenBlacklist for MemoryTokenBlacklist {
    async fn is_blacklisted(&self, jti: &str) -> Result<bool> {
        Ok(self.entries.read().await.contains_key(jti))
    }

    async fn add(&self, jti: &str, expires_at: i64) -> Result<()> {
        self.entries
            .write()
            .await
            .entry(jti.to_owned())
            .and_modify(|exp| *exp = (*exp).max(expires_at))
            .or_insert(expires_at);
        Ok(())
    }

    async fn cleanup_expired(&self) -> Result<u64> {
        let now = chrono::Utc::now().timestamp();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, expires_at| *expires_at > now);

        Ok((before - entries.len()) as u64)
    }
}

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{Result, ServerError};
use crate::model::{Purpose, VerificationCode, code_key};
use crate::storage::VerificationCodeStorage;

/// Codes keyed by user and purpose.
#[derive(Default)]
pub struct MemoryVerificationCodeStorage {
    codes: RwLock<HashMap<String, VerificationCode>>,
}

impl MemoryVerificationCodeStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VerificationCodeStorage for MemoryVerificationCodeStorage {
    async fn create_code(&self, code: &VerificationCode) -> Result<()> {
        self.codes.write().await.insert(code.key(), code.clone());
        Ok(())
    }

    async fn consume_code(
        &self,
        user_id: &str,
        purpose: Purpose,
        code: &str,
    ) -> Result<()> {
        let key = code_key(user_id, purpose);
        let mut codes = self.codes.write().await;

        match codes.get(&key) {
            Some(stored) if stored.code == code => {
                let expired =
                    stored.is_expired(chrono::Utc::now().timestamp());
                codes.remove(&key);
                if expired {
                    return Err(ServerError::NotFound);
                }
                Ok(())
            },
            _ => Err(ServerError::NotFound),
        }
    }

    async fn delete_expired(&self) -> Result<u64> {
        let now = chrono::Utc::now().timestamp();
        let mut codes = self.codes.write().await;
        let before = codes.len();
        codes.retain(|_, code| !code.is_expired(now));

        Ok((before - codes.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_single_use() {
        let storage = MemoryVerificationCodeStorage::new();
        let code = VerificationCode::generate("id", Purpose::Phone, 60);
        storage.create_code(&code).await.unwrap();

        assert!(matches!(
            storage.consume_code("id", Purpose::Email, &code.code).await,
            Err(ServerError::NotFound)
        ));
        storage
            .consume_code("id", Purpose::Phone, &code.code)
            .await
            .unwrap();
        assert!(matches!(
            storage.consume_code("id", Purpose::Phone, &code.code).await,
            Err(ServerError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_expired() {
        let storage = MemoryVerificationCodeStorage::new();
        let code = VerificationCode::generate("id", Purpose::Email, -1);
        storage.create_code(&code).await.unwrap();

        assert_eq!(storage.delete_expired().await.unwrap(), 1);
        assert!(matches!(
            storage.consume_code("id", Purpose::Email, &code.code).await,
            Err(ServerError::NotFound)
        ));
    }
}

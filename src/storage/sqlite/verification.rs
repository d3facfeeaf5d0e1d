use async_trait::async_trait;
use sqlx::{Pool, Sqlite};

use super::{begin_write, get, remove, remove_expired, upsert};
use crate::error::{Result, ServerError};
use crate::model::{Purpose, VerificationCode, code_key};
use crate::storage::VerificationCodeStorage;

const CODES: &str = "verification_codes";

pub struct SqliteVerificationCodeStorage {
    pool: Pool<Sqlite>,
}

impl SqliteVerificationCodeStorage {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VerificationCodeStorage for SqliteVerificationCodeStorage {
    async fn create_code(&self, code: &VerificationCode) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        upsert(
            &mut conn,
            CODES,
            &code.key(),
            &serde_json::to_string(code)?,
            Some(code.expires_at),
        )
        .await
    }

    async fn consume_code(
        &self,
        user_id: &str,
        purpose: Purpose,
        code: &str,
    ) -> Result<()> {
        let key = code_key(user_id, purpose);

        let mut tx = begin_write(&self.pool).await?;
        let stored: VerificationCode = match get(&mut tx, CODES, &key).await? {
            Some(value) => serde_json::from_str(&value)?,
            None => return Err(ServerError::NotFound),
        };
        if stored.code != code {
            return Err(ServerError::NotFound);
        }

        remove(&mut tx, CODES, &key).await?;
        tx.commit().await?;

        if stored.is_expired(chrono::Utc::now().timestamp()) {
            return Err(ServerError::NotFound);
        }

        Ok(())
    }

    async fn delete_expired(&self) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        remove_expired(&mut conn, CODES, chrono::Utc::now().timestamp()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::test_pool;

    #[tokio::test]
    async fn test_single_use() {
        let storage = SqliteVerificationCodeStorage::new(test_pool().await);
        let first = VerificationCode::generate("id", Purpose::ResetPassword, 60);
        storage.create_code(&first).await.unwrap();

        // A new code replaces the previous one.
        let mut second = first.clone();
        second.code = if first.code == "000000" { "000001" } else { "000000" }.into();
        storage.create_code(&second).await.unwrap();

        assert!(matches!(
            storage
                .consume_code("id", Purpose::ResetPassword, &first.code)
                .await,
            Err(ServerError::NotFound)
        ));
        storage
            .consume_code("id", Purpose::ResetPassword, &second.code)
            .await
            .unwrap();
        assert!(matches!(
            storage
                .consume_code("id", Purpose::ResetPassword, &second.code)
                .await,
            Err(ServerError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_expired() {
        let storage = SqliteVerificationCodeStorage::new(test_pool().await);
        let code = VerificationCode::generate("id", Purpose::Email, -10);
        storage.create_code(&code).await.unwrap();

        assert!(matches!(
            storage.consume_code("id", Purpose::Email, &code.code).await,
            Err(ServerError::NotFound)
        ));
        assert_eq!(storage.delete_expired().await.unwrap(), 0);
    }
}

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{Pool, Postgres};

use crate::error::{Result, ServerError};
use crate::model::{Purpose, VerificationCode};
use crate::storage::{VerificationCodeStorage, with_timeout};

pub struct PgVerificationCodeStorage {
    pool: Pool<Postgres>,
    timeout: Duration,
}

impl PgVerificationCodeStorage {
    pub fn new(pool: Pool<Postgres>, timeout: Duration) -> Self {
        Self { pool, timeout }
    }
}

#[async_trait]
impl VerificationCodeStorage for PgVerificationCodeStorage {
    async fn create_code(&self, code: &VerificationCode) -> Result<()> {
        let document = serde_json::to_string(code)?;

        with_timeout(self.timeout, async {
            sqlx::query(
                r#"INSERT INTO verification_codes
                        (user_id, purpose, document, expires_at)
                    VALUES ($1, $2, $3::jsonb, $4)
                    ON CONFLICT (user_id, purpose) DO UPDATE
                    SET document = excluded.document,
                        expires_at = excluded.expires_at"#,
            )
            .bind(&code.user_id)
            .bind(code.purpose.as_str())
            .bind(&document)
            .bind(code.expires_at)
            .execute(&self.pool)
            .await?;
            Ok::<_, ServerError>(())
        })
        .await
    }

    async fn consume_code(
        &self,
        user_id: &str,
        purpose: Purpose,
        code: &str,
    ) -> Result<()> {
        // Deleting and checking in one statement keeps codes single-use.
        let deleted = with_timeout(self.timeout, async {
            Ok::<_, ServerError>(
                sqlx::query_as::<_, (i64,)>(
                    r#"DELETE FROM verification_codes
                        WHERE user_id = $1 AND purpose = $2
                            AND document->>'code' = $3
                        RETURNING expires_at"#,
                )
                .bind(user_id)
                .bind(purpose.as_str())
                .bind(code)
                .fetch_optional(&self.pool)
                .await?,
            )
        })
        .await?;

        match deleted {
            Some((expires_at,)) if expires_at > chrono::Utc::now().timestamp() => {
                Ok(())
            },
            _ => Err(ServerError::NotFound),
        }
    }

    async fn delete_expired(&self) -> Result<u64> {
        with_timeout(self.timeout, async {
            let result =
                sqlx::query("DELETE FROM verification_codes WHERE expires_at <= $1")
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
    async fn test_single_use() {
        let storage = PgVerificationCodeStorage::new(
            test_pool().await,
            Duration::from_secs(5),
        );
        let user_id = uuid::Uuid::new_v4().to_string();
        let code = VerificationCode::generate(&user_id, Purpose::Email, 60);
        storage.create_code(&code).await.unwrap();

        storage
            .consume_code(&user_id, Purpose::Email, &code.code)
            .await
            .unwrap();
        assert!(matches!(
            storage.consume_code(&user_id, Purpose::Email, &code.code).await,
            Err(ServerError::NotFound)
        ));
    }
}

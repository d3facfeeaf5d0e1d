use std::time::Duration;

use async_trait::async_trait;
use sqlx::{Pool, Postgres};

use crate::error::{Result, ServerError};
use crate::model::App;
use crate::storage::{
    AppStorage, filter_pattern, prepare_new_app, with_timeout,
};

pub struct PgAppStorage {
    pool: Pool<Postgres>,
    timeout: Duration,
}

impl PgAppStorage {
    /// Create a new [`PgAppStorage`].
    pub fn new(pool: Pool<Postgres>, timeout: Duration) -> Self {
        Self { pool, timeout }
    }
}

#[async_trait]
impl AppStorage for PgAppStorage {
    async fn app_by_id(&self, id: &str) -> Result<App> {
        let (document,) = with_timeout(self.timeout, async {
            Ok::<_, ServerError>(
                sqlx::query_as::<_, (String,)>(
                    "SELECT document::text FROM apps WHERE id = $1",
                )
                .bind(id)
                .fetch_one(&self.pool)
                .await?,
            )
        })
        .await?;

        Ok(serde_json::from_str(&document)?)
    }

    async fn add_app(&self, app: App) -> Result<App> {
        let app = prepare_new_app(app);
        let document = serde_json::to_string(&app)?;

        with_timeout(self.timeout, async {
            sqlx::query("INSERT INTO apps (id, document) VALUES ($1, $2::jsonb)")
                .bind(&app.id)
                .bind(&document)
                .execute(&self.pool)
                .await?;
            Ok::<_, ServerError>(())
        })
        .await?;

        Ok(app)
    }

    async fn update_app(&self, id: &str, mut app: App) -> Result<App> {
        app.id = id.to_owned();
        let document = serde_json::to_string(&app)?;

        let result = with_timeout(self.timeout, async {
            Ok::<_, ServerError>(
                sqlx::query("UPDATE apps SET document = $2::jsonb WHERE id = $1")
                    .bind(id)
                    .bind(&document)
                    .execute(&self.pool)
                    .await?,
            )
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(ServerError::NotFound);
        }

        Ok(app)
    }

    async fn delete_app(&self, id: &str) -> Result<()> {
        let result = with_timeout(self.timeout, async {
            Ok::<_, ServerError>(
                sqlx::query("DELETE FROM apps WHERE id = $1")
                    .bind(id)
                    .execute(&self.pool)
                    .await?,
            )
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(ServerError::NotFound);
        }

        Ok(())
    }

    async fn fetch_apps(
        &self,
        filter: &str,
        skip: usize,
        limit: usize,
    ) -> Result<(Vec<App>, u64)> {
        const CONDITION: &str = "($1 = '' OR document->>'name' ~* $1)";

        let pattern = filter_pattern(filter);

        with_timeout(self.timeout * 2, async {
            let (total,) = sqlx::query_as::<_, (i64,)>(&format!(
                "SELECT count(*) FROM apps WHERE {CONDITION}"
            ))
            .bind(pattern.as_ref())
            .fetch_one(&self.pool)
            .await?;

            let documents = sqlx::query_as::<_, (String,)>(&format!(
                r#"SELECT document::text FROM apps WHERE {CONDITION}
                    ORDER BY lower(document->>'name') OFFSET $2 LIMIT $3"#
            ))
            .bind(pattern.as_ref())
            .bind(skip as i64)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

            let apps = documents
                .into_iter()
                .map(|(document,)| serde_json::from_str::<App>(&document))
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok::<_, ServerError>((apps, total as u64))
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
    async fn test_crud() {
        let storage = PgAppStorage::new(test_pool().await, Duration::from_secs(5));
        let app = storage
            .add_app(App {
                name: "Web".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(storage.app_by_id(&app.id).await.unwrap(), app);
        assert!(matches!(
            storage.add_app(app.clone()).await,
            Err(ServerError::AlreadyExists)
        ));

        storage.delete_app(&app.id).await.unwrap();
        assert!(matches!(
            storage.app_by_id(&app.id).await,
            Err(ServerError::NotFound)
        ));
    }
}

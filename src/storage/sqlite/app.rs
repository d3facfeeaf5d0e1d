use async_trait::async_trait;
use sqlx::{Pool, Sqlite};

use super::{begin_write, get, insert, remove, upsert, values};
use crate::error::{Result, ServerError};
use crate::model::App;
use crate::storage::{AppStorage, filter_regex, page_apps, prepare_new_app};

const APPS: &str = "apps";

pub struct SqliteAppStorage {
    pool: Pool<Sqlite>,
}

impl SqliteAppStorage {
    /// Create a new [`SqliteAppStorage`].
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AppStorage for SqliteAppStorage {
    async fn app_by_id(&self, id: &str) -> Result<App> {
        let mut conn = self.pool.acquire().await?;
        let value = get(&mut conn, APPS, id).await?.ok_or(ServerError::NotFound)?;

        Ok(serde_json::from_str(&value)?)
    }

    async fn add_app(&self, app: App) -> Result<App> {
        let app = prepare_new_app(app);

        let mut conn = self.pool.acquire().await?;
        insert(&mut conn, APPS, &app.id, &serde_json::to_string(&app)?, None)
            .await?;

        Ok(app)
    }

    async fn update_app(&self, id: &str, mut app: App) -> Result<App> {
        app.id = id.to_owned();

        let mut tx = begin_write(&self.pool).await?;
        if get(&mut tx, APPS, id).await?.is_none() {
            return Err(ServerError::NotFound);
        }
        upsert(&mut tx, APPS, id, &serde_json::to_string(&app)?, None).await?;
        tx.commit().await?;

        Ok(app)
    }

    async fn delete_app(&self, id: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        if !remove(&mut conn, APPS, id).await? {
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
        let regex = filter_regex(filter);
        let mut conn = self.pool.acquire().await?;

        let mut apps = Vec::new();
        for value in values(&mut conn, APPS).await? {
            let app: App = serde_json::from_str(&value)?;
            if regex.as_ref().is_none_or(|r| r.is_match(&app.name)) {
                apps.push(app);
            }
        }

        Ok(page_apps(apps, skip, limit))
    }
}

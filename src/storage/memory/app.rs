use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{Result, ServerError};
use crate::model::App;
use crate::storage::{AppStorage, filter_regex, page_apps, prepare_new_app};

/// Apps kept in a map, keyed by ID.
#[derive(Default)]
pub struct MemoryAppStorage {
    apps: RwLock<HashMap<String, App>>,
}

impl MemoryAppStorage {
    /// Create a new [`MemoryAppStorage`].
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AppStorage for MemoryAppStorage {
    async fn app_by_id(&self, id: &str) -> Result<App> {
        self.apps
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(ServerError::NotFound)
    }

    async fn add_app(&self, app: App) -> Result<App> {
        let app = prepare_new_app(app);

        let mut apps = self.apps.write().await;
        if apps.contains_key(&app.id) {
            return Err(ServerError::AlreadyExists);
        }
        apps.insert(app.id.clone(), app.clone());

        Ok(app)
    }

    async fn update_app(&self, id: &str, mut app: App) -> Result<App> {
        let mut apps = self.apps.write().await;
        if !apps.contains_key(id) {
            return Err(ServerError::NotFound);
        }

        app.id = id.to_owned();
        apps.insert(app.id.clone(), app.clone());

        Ok(app)
    }

    async fn delete_app(&self, id: &str) -> Result<()> {
        self.apps
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or(ServerError::NotFound)
    }

    async fn fetch_apps(
        &self,
        filter: &str,
        skip: usize,
        limit: usize,
    ) -> Result<(Vec<App>, u64)> {
        let regex = filter_regex(filter);
        let apps = self
            .apps
            .read()
            .await
            .values()
            .filter(|app| regex.as_ref().is_none_or(|r| r.is_match(&app.name)))
            .cloned()
            .collect();

        Ok(page_apps(apps, skip, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_crud() {
        let storage = MemoryAppStorage::new();
        let app = storage
            .add_app(App {
                name: "Web".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!app.id.is_empty());
        assert!(!app.secret.is_empty());

        assert!(matches!(
            storage.add_app(app.clone()).await,
            Err(ServerError::AlreadyExists)
        ));

        let mut update = app.clone();
        update.name = "Mobile".into();
        storage.update_app(&app.id, update).await.unwrap();
        assert_eq!(storage.app_by_id(&app.id).await.unwrap().name, "Mobile");

        storage.delete_app(&app.id).await.unwrap();
        assert!(matches!(
            storage.app_by_id(&app.id).await,
            Err(ServerError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_import_and_fetch() {
        let storage = MemoryAppStorage::new();
        storage
            .import_json(
                br#"[{"id":"59fd884d8f6b180001f5b4e2","name":"web","active":true},
                    {"id":"b","name":"Android"}]"#,
            )
            .await
            .unwrap();

        let app = storage.app_by_id("59fd884d8f6b180001f5b4e2").await.unwrap();
        assert!(app.active);

        let (apps, total) = storage.fetch_apps("", 0, 10).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(apps[0].name, "Android");
    }
}

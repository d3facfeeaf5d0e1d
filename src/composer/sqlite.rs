use std::sync::Arc;

use sqlx::{Pool, Sqlite};

use crate::composer::{Factory, PartialComposer, factory};
use crate::config::{Database, DatabaseKind};
use crate::crypto::PasswordManager;
use crate::error::Result;
use crate::storage::sqlite::{
    self, SqliteAppStorage, SqliteTokenBlacklist, SqliteTokenStorage,
    SqliteUserStorage, SqliteVerificationCodeStorage,
};
use crate::storage::{
    AppStorage, Category, TokenBlacklist, TokenStorage, UserStorage,
    VerificationCodeStorage,
};

/// Categories sharing one embedded database file.
pub struct SqlitePartialComposer {
    pool: Pool<Sqlite>,
    categories: Vec<Category>,
    passwords: Arc<PasswordManager>,
}

impl SqlitePartialComposer {
    /// Open the database right away, so a bad path fails the startup.
    pub async fn connect(
        database: &Database,
        categories: Vec<Category>,
        passwords: Arc<PasswordManager>,
    ) -> Result<Self> {
        let pool = sqlite::connect(&database.location(), database.pool_size).await?;

        Ok(Self {
            pool,
            categories,
            passwords,
        })
    }

    fn pool_for(&self, category: Category) -> Option<Pool<Sqlite>> {
        self.categories
            .contains(&category)
            .then(|| self.pool.clone())
    }
}

impl PartialComposer for SqlitePartialComposer {
    fn family(&self) -> DatabaseKind {
        DatabaseKind::Sqlite
    }

    fn app_storage(&self) -> Option<Factory<dyn AppStorage>> {
        let pool = self.pool_for(Category::App)?;
        Some(factory(move || async move {
            Ok(Arc::new(SqliteAppStorage::new(pool)) as Arc<dyn AppStorage>)
        }))
    }

    fn user_storage(&self) -> Option<Factory<dyn UserStorage>> {
        let pool = self.pool_for(Category::User)?;
        let passwords = Arc::clone(&self.passwords);
        Some(factory(move || async move {
            Ok(Arc::new(SqliteUserStorage::new(pool, passwords))
                as Arc<dyn UserStorage>)
        }))
    }

    fn token_storage(&self) -> Option<Factory<dyn TokenStorage>> {
        let pool = self.pool_for(Category::Token)?;
        Some(factory(move || async move {
            Ok(Arc::new(SqliteTokenStorage::new(pool)) as Arc<dyn TokenStorage>)
        }))
    }

    fn token_blacklist(&self) -> Option<Factory<dyn TokenBlacklist>> {
        let pool = self.pool_for(Category::TokenBlacklist)?;
        Some(factory(move || async move {
            Ok(Arc::new(SqliteTokenBlacklist::new(pool))
                as Arc<dyn TokenBlacklist>)
        }))
    }

    fn verification_code_storage(
        &self,
    ) -> Option<Factory<dyn VerificationCodeStorage>> {
        let pool = self.pool_for(Category::VerificationCode)?;
        Some(factory(move || async move {
            Ok(Arc::new(SqliteVerificationCodeStorage::new(pool))
                as Arc<dyn VerificationCodeStorage>)
        }))
    }
}

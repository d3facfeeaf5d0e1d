use std::sync::Arc;
use std::time::Duration;

use sqlx::{Pool, Postgres};

use crate::composer::{Factory, PartialComposer, factory};
use crate::config::{Database, DatabaseKind};
use crate::crypto::PasswordManager;
use crate::error::{Result, ServerError};
use crate::storage::postgres::{
    self, PgAppStorage, PgTokenBlacklist, PgTokenStorage, PgUserStorage,
    PgVerificationCodeStorage,
};
use crate::storage::{
    AppStorage, Category, TokenBlacklist, TokenStorage, UserStorage,
    VerificationCodeStorage,
};

/// Categories sharing one PostgreSQL database.
pub struct PgPartialComposer {
    pool: Pool<Postgres>,
    categories: Vec<Category>,
    passwords: Arc<PasswordManager>,
    timeout: Duration,
}

impl PgPartialComposer {
    pub async fn connect(
        database: &Database,
        categories: Vec<Category>,
        passwords: Arc<PasswordManager>,
        timeout: Duration,
    ) -> Result<Self> {
        let uri = database.location();
        if uri.is_empty() {
            return Err(ServerError::Config(
                "postgres storage requires an `uri`".into(),
            ));
        }

        let pool = postgres::connect(&uri, database.pool_size, timeout).await?;

        Ok(Self {
            pool,
            categories,
            passwords,
            timeout,
        })
    }

    fn pool_for(&self, category: Category) -> Option<Pool<Postgres>> {
        self.categories
            .contains(&category)
            .then(|| self.pool.clone())
    }
}

impl PartialComposer for PgPartialComposer {
    fn family(&self) -> DatabaseKind {
        DatabaseKind::Postgres
    }

    fn app_storage(&self) -> Option<Factory<dyn AppStorage>> {
        let pool = self.pool_for(Category::App)?;
        let timeout = self.timeout;
        Some(factory(move || async move {
            Ok(Arc::new(PgAppStorage::new(pool, timeout)) as Arc<dyn AppStorage>)
        }))
    }

    fn user_storage(&self) -> Option<Factory<dyn UserStorage>> {
        let pool = self.pool_for(Category::User)?;
        let passwords = Arc::clone(&self.passwords);
        let timeout = self.timeout;
        Some(factory(move || async move {
            Ok(Arc::new(PgUserStorage::new(pool, passwords, timeout))
                as Arc<dyn UserStorage>)
        }))
    }

    fn token_storage(&self) -> Option<Factory<dyn TokenStorage>> {
        let pool = self.pool_for(Category::Token)?;
        let timeout = self.timeout;
        Some(factory(move || async move {
            Ok(Arc::new(PgTokenStorage::new(pool, timeout))
                as Arc<dyn TokenStorage>)
        }))
    }

    fn token_blacklist(&self) -> Option<Factory<dyn TokenBlacklist>> {
        let pool = self.pool_for(Category::TokenBlacklist)?;
        let timeout = self.timeout;
        Some(factory(move || async move {
            Ok(Arc::new(PgTokenBlacklist::new(pool, timeout))
                as Arc<dyn TokenBlacklist>)
        }))
    }

    fn verification_code_storage(
        &self,
    ) -> Option<Factory<dyn VerificationCodeStorage>> {
        let pool = self.pool_for(Category::VerificationCode)?;
        let timeout = self.timeout;
        Some(factory(move || async move {
            Ok(Arc::new(PgVerificationCodeStorage::new(pool, timeout))
                as Arc<dyn VerificationCodeStorage>)
        }))
    }
}

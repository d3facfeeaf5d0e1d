//! Assemble the five storages and the token service from configuration.
//!
//! Each backend family provides a [`PartialComposer`] handing out deferred
//! factories for the categories it serves. The [`Composer`] keeps, for each
//! category, the factory of the last partial providing it, then invokes
//! every factory exactly once.

mod memory;
mod postgres;
mod sqlite;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::config::{self, Configuration, DatabaseKind};
use crate::crypto::PasswordManager;
use crate::error::{Result, ServerError};
use crate::storage::{
    AppStorage, Category, TokenBlacklist, TokenStorage, UserStorage,
    VerificationCodeStorage,
};
use crate::token::TokenService;

pub use memory::MemoryPartialComposer;
pub use postgres::PgPartialComposer;
pub use sqlite::SqlitePartialComposer;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Deferred storage constructor, invoked once by [`Composer::compose`].
pub type Factory<T> = Box<dyn FnOnce() -> BoxFuture<Result<Arc<T>>> + Send>;

/// Box a storage constructor into a [`Factory`].
pub fn factory<T, F, Fut>(build: F) -> Factory<T>
where
    T: ?Sized + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Arc<T>>> + Send + 'static,
{
    Box::new(move || -> BoxFuture<Result<Arc<T>>> { Box::pin(build()) })
}

/// Wrap an already built storage into a [`Factory`].
pub fn ready<T: ?Sized + Send + Sync + 'static>(storage: Arc<T>) -> Factory<T> {
    factory(move || async move { Ok(storage) })
}

/// Storages one backend family is able to build.
///
/// Accessors return `None` for categories the partial does not serve.
pub trait PartialComposer: Send {
    fn family(&self) -> DatabaseKind;

    fn app_storage(&self) -> Option<Factory<dyn AppStorage>>;

    fn user_storage(&self) -> Option<Factory<dyn UserStorage>>;

    fn token_storage(&self) -> Option<Factory<dyn TokenStorage>>;

    fn token_blacklist(&self) -> Option<Factory<dyn TokenBlacklist>>;

    fn verification_code_storage(
        &self,
    ) -> Option<Factory<dyn VerificationCodeStorage>>;
}

/// Build one partial composer per `(family, location)` group of categories.
///
/// Database handles are opened here. Plugin categories are skipped since
/// the plugin client is installed with [`Composer::with_user_storage`].
pub async fn build_partial_composers(
    settings: &config::Storage,
    passwords: Arc<PasswordManager>,
) -> Result<Vec<Box<dyn PartialComposer>>> {
    let mut groups: Vec<(&config::Database, Vec<Category>)> = Vec::new();

    for category in Category::ALL {
        let database = settings.get(category);
        if database.kind == DatabaseKind::Plugin {
            if category != Category::User {
                return Err(ServerError::Config(format!(
                    "{category} cannot be served by a plugin"
                )));
            }
            continue;
        }

        match groups.iter_mut().find(|(db, _)| {
            db.kind == database.kind && db.location() == database.location()
        }) {
            Some((_, categories)) => categories.push(category),
            None => groups.push((database, vec![category])),
        }
    }

    let mut partials: Vec<Box<dyn PartialComposer>> = Vec::new();
    for (database, categories) in groups {
        tracing::debug!(
            family = database.kind.as_str(),
            ?categories,
            "building partial composer"
        );

        let partial: Box<dyn PartialComposer> = match database.kind {
            DatabaseKind::Memory => Box::new(MemoryPartialComposer::new(
                categories,
                Arc::clone(&passwords),
            )),
            DatabaseKind::Sqlite => Box::new(
                SqlitePartialComposer::connect(
                    database,
                    categories,
                    Arc::clone(&passwords),
                )
                .await?,
            ),
            DatabaseKind::Postgres => Box::new(
                PgPartialComposer::connect(
                    database,
                    categories,
                    Arc::clone(&passwords),
                    settings.timeout(),
                )
                .await?,
            ),
            DatabaseKind::Plugin => continue,
        };
        partials.push(partial);
    }

    Ok(partials)
}

struct Slot<T: ?Sized> {
    family: DatabaseKind,
    factory: Factory<T>,
}

fn keep_last<T: ?Sized>(
    slot: &mut Option<Slot<T>>,
    family: DatabaseKind,
    factory: Option<Factory<T>>,
) {
    if let Some(factory) = factory {
        *slot = Some(Slot { family, factory });
    }
}

async fn invoke<T: ?Sized>(
    slot: Option<Slot<T>>,
    category: Category,
) -> Result<Arc<T>> {
    let slot = slot.ok_or_else(|| {
        ServerError::Config(format!("no storage configured for {category}"))
    })?;

    let storage = (slot.factory)().await?;
    tracing::info!(%category, family = slot.family.as_str(), "storage ready");

    Ok(storage)
}

/// Resolves one storage per category, then the token service.
pub struct Composer {
    issuer: String,
    token: config::Token,
    app: Option<Slot<dyn AppStorage>>,
    user: Option<Slot<dyn UserStorage>>,
    token_storage: Option<Slot<dyn TokenStorage>>,
    token_blacklist: Option<Slot<dyn TokenBlacklist>>,
    verification: Option<Slot<dyn VerificationCodeStorage>>,
}

impl Composer {
    /// Create a new [`Composer`]. Later partials override earlier ones.
    pub fn new(
        config: &Configuration,
        partials: Vec<Box<dyn PartialComposer>>,
    ) -> Self {
        let mut composer = Self {
            issuer: config.url.clone(),
            token: config.token.clone(),
            app: None,
            user: None,
            token_storage: None,
            token_blacklist: None,
            verification: None,
        };

        for partial in partials {
            let family = partial.family();
            keep_last(&mut composer.app, family, partial.app_storage());
            keep_last(&mut composer.user, family, partial.user_storage());
            keep_last(
                &mut composer.token_storage,
                family,
                partial.token_storage(),
            );
            keep_last(
                &mut composer.token_blacklist,
                family,
                partial.token_blacklist(),
            );
            keep_last(
                &mut composer.verification,
                family,
                partial.verification_code_storage(),
            );
        }

        composer
    }

    /// Install a plugin user storage. It wins over any partial.
    pub fn with_user_storage(mut self, storage: Arc<dyn UserStorage>) -> Self {
        self.user = Some(Slot {
            family: DatabaseKind::Plugin,
            factory: ready(storage),
        });
        self
    }

    /// Family which will build `category`.
    pub fn source(&self, category: Category) -> Option<DatabaseKind> {
        match category {
            Category::App => self.app.as_ref().map(|slot| slot.family),
            Category::User => self.user.as_ref().map(|slot| slot.family),
            Category::Token => self.token_storage.as_ref().map(|slot| slot.family),
            Category::TokenBlacklist => {
                self.token_blacklist.as_ref().map(|slot| slot.family)
            },
            Category::VerificationCode => {
                self.verification.as_ref().map(|slot| slot.family)
            },
        }
    }

    /// Invoke every factory, failing on the first error.
    pub async fn compose(self) -> Result<Composed> {
        let app_storage = invoke(self.app, Category::App).await?;
        let user_storage = invoke(self.user, Category::User).await?;
        let token_storage = invoke(self.token_storage, Category::Token).await?;
        let token_blacklist =
            invoke(self.token_blacklist, Category::TokenBlacklist).await?;
        let verification_code_storage =
            invoke(self.verification, Category::VerificationCode).await?;

        let token_service = TokenService::new(
            &self.issuer,
            &self.token,
            Arc::clone(&token_storage),
            Arc::clone(&token_blacklist),
            Arc::clone(&app_storage),
            Arc::clone(&user_storage),
        )?;

        Ok(Composed {
            app_storage,
            user_storage,
            token_storage,
            token_blacklist,
            verification_code_storage,
            token_service: Arc::new(token_service),
        })
    }
}

/// Storages and token service ready to serve.
#[derive(Clone)]
pub struct Composed {
    pub app_storage: Arc<dyn AppStorage>,
    pub user_storage: Arc<dyn UserStorage>,
    pub token_storage: Arc<dyn TokenStorage>,
    pub token_blacklist: Arc<dyn TokenBlacklist>,
    pub verification_code_storage: Arc<dyn VerificationCodeStorage>,
    pub token_service: Arc<TokenService>,
}

impl Composed {
    /// Remove expired refresh tokens, blacklist entries and codes.
    /// Failures are logged, next run retries.
    pub async fn purge_expired(&self) {
        match self.token_storage.delete_expired().await {
            Ok(0) => {},
            Ok(count) => {
                tracing::debug!(count, "expired refresh tokens removed")
            },
            Err(err) => tracing::warn!(%err, "refresh tokens cleanup failed"),
        }
        match self.token_blacklist.cleanup_expired().await {
            Ok(0) => {},
            Ok(count) => {
                tracing::debug!(count, "expired blacklist entries removed")
            },
            Err(err) => tracing::warn!(%err, "blacklist cleanup failed"),
        }
        match self.verification_code_storage.delete_expired().await {
            Ok(0) => {},
            Ok(count) => tracing::debug!(count, "expired codes removed"),
            Err(err) => tracing::warn!(%err, "codes cleanup failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::crypto::test_password_manager;
    use crate::storage::memory::{MemoryAppStorage, MemoryUserStorage};

    fn config() -> Configuration {
        let mut config = Configuration::default();
        config.url = "https://id.example.com/".into();
        config.token.generate = true;
        config
    }

    fn memory(categories: &[Category]) -> Box<dyn PartialComposer> {
        Box::new(MemoryPartialComposer::new(
            categories.to_vec(),
            test_password_manager(),
        ))
    }

    /// Serves app storage only, counting factory calls.
    struct Counting {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl PartialComposer for Counting {
        fn family(&self) -> DatabaseKind {
            DatabaseKind::Postgres
        }

        fn app_storage(&self) -> Option<Factory<dyn AppStorage>> {
            let calls = Arc::clone(&self.calls);
            let fail = self.fail;
            Some(factory(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if fail {
                    return Err(ServerError::internal("unreachable"));
                }
                Ok(Arc::new(MemoryAppStorage::new()) as Arc<dyn AppStorage>)
            }))
        }

        fn user_storage(&self) -> Option<Factory<dyn UserStorage>> {
            None
        }

        fn token_storage(&self) -> Option<Factory<dyn TokenStorage>> {
            None
        }

        fn token_blacklist(&self) -> Option<Factory<dyn TokenBlacklist>> {
            None
        }

        fn verification_code_storage(
            &self,
        ) -> Option<Factory<dyn VerificationCodeStorage>> {
            None
        }
    }

    #[tokio::test]
    async fn test_last_wins() {
        let calls = Arc::new(AtomicUsize::new(0));
        let composer = Composer::new(
            &config(),
            vec![
                memory(&Category::ALL),
                Box::new(Counting {
                    calls: Arc::clone(&calls),
                    fail: false,
                }),
            ],
        );

        assert_eq!(composer.source(Category::App), Some(DatabaseKind::Postgres));
        assert_eq!(composer.source(Category::User), Some(DatabaseKind::Memory));

        composer.compose().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Reversed order, memory wins and counting factory is never called.
        let calls = Arc::new(AtomicUsize::new(0));
        let composer = Composer::new(
            &config(),
            vec![
                Box::new(Counting {
                    calls: Arc::clone(&calls),
                    fail: false,
                }),
                memory(&Category::ALL),
            ],
        );
        assert_eq!(composer.source(Category::App), Some(DatabaseKind::Memory));
        composer.compose().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_factory_failure() {
        let composer = Composer::new(
            &config(),
            vec![
                memory(&Category::ALL),
                Box::new(Counting {
                    calls: Arc::new(AtomicUsize::new(0)),
                    fail: true,
                }),
            ],
        );

        assert!(matches!(
            composer.compose().await,
            Err(ServerError::Internal { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_category() {
        let composer = Composer::new(
            &config(),
            vec![memory(&[Category::App, Category::User, Category::Token])],
        );
        assert_eq!(composer.source(Category::TokenBlacklist), None);

        assert!(matches!(
            composer.compose().await,
            Err(ServerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_algorithm() {
        let mut config = config();
        config.token.algorithm = "none".into();

        let composer = Composer::new(&config, vec![memory(&Category::ALL)]);
        assert!(matches!(
            composer.compose().await,
            Err(ServerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_with_user_storage() {
        let plugin = Arc::new(MemoryUserStorage::new(test_password_manager()));
        plugin
            .add_user_by_name_and_password("alice", "password", "user", false)
            .await
            .unwrap();

        let composer = Composer::new(&config(), vec![memory(&Category::ALL)])
            .with_user_storage(plugin);
        assert_eq!(composer.source(Category::User), Some(DatabaseKind::Plugin));

        let composed = composer.compose().await.unwrap();
        assert!(composed.user_storage.user_exists("ALICE").await.unwrap());
    }

    #[tokio::test]
    async fn test_build_partial_composers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vouch.db").display().to_string();

        let mut settings = config::Storage::default();
        for database in [&mut settings.user_storage, &mut settings.token_storage] {
            database.kind = DatabaseKind::Sqlite;
            database.path = Some(path.clone());
        }

        let partials =
            build_partial_composers(&settings, test_password_manager())
                .await
                .unwrap();
        assert_eq!(partials.len(), 2);
        assert_eq!(partials[0].family(), DatabaseKind::Memory);
        assert_eq!(partials[1].family(), DatabaseKind::Sqlite);
        assert!(partials[0].user_storage().is_none());
        assert!(partials[1].user_storage().is_some());
        assert!(partials[1].app_storage().is_none());

        let composer = Composer::new(&config(), partials);
        assert_eq!(composer.source(Category::Token), Some(DatabaseKind::Sqlite));
        assert_eq!(
            composer.source(Category::TokenBlacklist),
            Some(DatabaseKind::Memory)
        );
        composer.compose().await.unwrap();
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let composed = Composer::new(&config(), vec![memory(&Category::ALL)])
            .compose()
            .await
            .unwrap();
        let now = chrono::Utc::now().timestamp();

        composed.token_storage.save_token("live", now + 60).await.unwrap();
        composed.token_storage.save_token("stale", now - 60).await.unwrap();
        composed.token_blacklist.add("stale", now - 60).await.unwrap();

        composed.purge_expired().await;

        assert!(composed.token_storage.has_token("live").await.unwrap());
        assert!(!composed.token_storage.has_token("stale").await.unwrap());
        assert!(!composed.token_blacklist.is_blacklisted("stale").await.unwrap());
    }

    #[tokio::test]
    async fn test_plugin_only_for_users() {
        let mut settings = config::Storage::default();
        settings.app_storage.kind = DatabaseKind::Plugin;

        assert!(matches!(
            build_partial_composers(&settings, test_password_manager()).await,
            Err(ServerError::Config(_))
        ));
    }
}

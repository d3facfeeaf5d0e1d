use std::sync::Arc;

use crate::composer::{Factory, PartialComposer, factory};
use crate::config::DatabaseKind;
use crate::crypto::PasswordManager;
use crate::storage::memory::{
    MemoryAppStorage, MemoryTokenBlacklist, MemoryTokenStorage,
    MemoryUserStorage, MemoryVerificationCodeStorage,
};
use crate::storage::{
    AppStorage, Category, TokenBlacklist, TokenStorage, UserStorage,
    VerificationCodeStorage,
};

/// In-process storages.
pub struct MemoryPartialComposer {
    categories: Vec<Category>,
    passwords: Arc<PasswordManager>,
}

impl MemoryPartialComposer {
    pub fn new(categories: Vec<Category>, passwords: Arc<PasswordManager>) -> Self {
        Self {
            categories,
            passwords,
        }
    }

    fn serves(&self, category: Category) -> bool {
        self.categories.contains(&category)
    }
}

impl PartialComposer for MemoryPartialComposer {
    fn family(&self) -> DatabaseKind {
        DatabaseKind::Memory
    }

    fn app_storage(&self) -> Option<Factory<dyn AppStorage>> {
        self.serves(Category::App).then(|| {
            factory(|| async {
                Ok(Arc::new(MemoryAppStorage::new()) as Arc<dyn AppStorage>)
            })
        })
    }

    fn user_storage(&self) -> Option<Factory<dyn UserStorage>> {
        let passwords = Arc::clone(&self.passwords);
        self.serves(Category::User).then(|| {
            factory(move || async move {
                Ok(Arc::new(MemoryUserStorage::new(passwords))
                    as Arc<dyn UserStorage>)
            })
        })
    }

    fn token_storage(&self) -> Option<Factory<dyn TokenStorage>> {
        self.serves(Category::Token).then(|| {
            factory(|| async {
                Ok(Arc::new(MemoryTokenStorage::new()) as Arc<dyn TokenStorage>)
            })
        })
    }

    fn token_blacklist(&self) -> Option<Factory<dyn TokenBlacklist>> {
        self.serves(Category::TokenBlacklist).then(|| {
            factory(|| async {
                Ok(Arc::new(MemoryTokenBlacklist::new())
                    as Arc<dyn TokenBlacklist>)
            })
        })
    }

    fn verification_code_storage(
        &self,
    ) -> Option<Factory<dyn VerificationCodeStorage>> {
        self.serves(Category::VerificationCode).then(|| {
            factory(|| async {
                Ok(Arc::new(MemoryVerificationCodeStorage::new())
                    as Arc<dyn VerificationCodeStorage>)
            })
        })
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::crypto::PasswordManager;
use crate::error::{Result, ServerError};
use crate::model::User;
use crate::storage::{
    StoredUser, UserStorage, check_id, filter_regex, merge_update, page_users,
    prepare_new_user, username_key,
};

/// Users kept in a map, keyed by ID.
pub struct MemoryUserStorage {
    users: RwLock<HashMap<String, StoredUser>>,
    passwords: Arc<PasswordManager>,
}

impl MemoryUserStorage {
    /// Create a new [`MemoryUserStorage`].
    pub fn new(passwords: Arc<PasswordManager>) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            passwords,
        }
    }

    async fn find(
        &self,
        predicate: impl Fn(&StoredUser) -> bool,
    ) -> Result<StoredUser> {
        self.users
            .read()
            .await
            .values()
            .find(|user| predicate(user))
            .cloned()
            .ok_or(ServerError::NotFound)
    }

    async fn find_by_name(&self, name: &str) -> Result<StoredUser> {
        let key = username_key(name);
        self.find(|user| username_key(&user.user.username) == key)
            .await
    }
}

/// Whether another user already owns one of `candidate` unique keys.
fn has_conflict(
    users: &HashMap<String, StoredUser>,
    candidate: &StoredUser,
) -> bool {
    let keys = candidate.unique_keys();

    users
        .values()
        .filter(|user| user.user.id != candidate.user.id)
        .any(|user| user.unique_keys().iter().any(|key| keys.contains(key)))
}

#[async_trait]
impl UserStorage for MemoryUserStorage {
    async fn user_by_id(&self, id: &str) -> Result<User> {
        check_id(id)?;

        self.users
            .read()
            .await
            .get(id)
            .cloned()
            .map(StoredUser::into_user)
            .ok_or(ServerError::NotFound)
    }

    async fn user_by_email(&self, email: &str) -> Result<User> {
        let email = email.trim().to_lowercase();
        self.find(|user| user.user.email.as_deref() == Some(email.as_str()))
            .await
            .map(StoredUser::into_user)
    }

    async fn user_by_phone(&self, phone: &str) -> Result<User> {
        let phone = phone.trim();
        self.find(|user| user.user.phone.as_deref() == Some(phone))
            .await
            .map(StoredUser::into_user)
    }

    async fn user_by_federated_id(
        &self,
        provider: &str,
        id: &str,
    ) -> Result<User> {
        let sid = User::federated_id(provider, id);
        self.find(|user| user.user.federated_ids.contains(&sid))
            .await
            .map(StoredUser::into_user)
    }

    async fn user_exists(&self, name: &str) -> Result<bool> {
        match self.find_by_name(name).await {
            Ok(_) => Ok(true),
            Err(ServerError::NotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn user_by_name_password(
        &self,
        name: &str,
        password: &str,
    ) -> Result<User> {
        let stored = self.find_by_name(name).await?;

        if stored.password_hash.is_empty()
            || !self
                .passwords
                .verify(password.to_owned(), stored.password_hash.clone())
                .await?
        {
            return Err(ServerError::NotFound);
        }

        Ok(stored.into_user())
    }

    async fn id_by_name(&self, name: &str) -> Result<String> {
        let stored = self.find_by_name(name).await?;
        if !stored.user.active {
            return Err(ServerError::InactiveUser);
        }

        Ok(stored.user.id)
    }

    async fn add_new_user(&self, user: User, password: &str) -> Result<User> {
        let hash = if password.is_empty() {
            String::new()
        } else {
            self.passwords.hash(password.to_owned()).await?
        };
        let stored = prepare_new_user(user, hash)?;

        let mut users = self.users.write().await;
        if has_conflict(&users, &stored) {
            return Err(ServerError::AlreadyExists);
        }
        users.insert(stored.user.id.clone(), stored.clone());

        Ok(stored.into_user())
    }

    async fn update_user(&self, id: &str, user: User) -> Result<User> {
        check_id(id)?;

        let mut users = self.users.write().await;
        let existing = users.get(id).ok_or(ServerError::NotFound)?;
        let updated = merge_update(existing, user)?;
        if has_conflict(&users, &updated) {
            return Err(ServerError::AlreadyExists);
        }
        users.insert(id.to_owned(), updated.clone());

        Ok(updated.into_user())
    }

    async fn reset_password(&self, id: &str, password: &str) -> Result<()> {
        check_id(id)?;
        let hash = self.passwords.hash(password.to_owned()).await?;

        let mut users = self.users.write().await;
        let user = users.get_mut(id).ok_or(ServerError::NotFound)?;
        user.password_hash = hash;

        Ok(())
    }

    async fn reset_username(&self, id: &str, username: &str) -> Result<()> {
        check_id(id)?;
        if username.trim().is_empty() {
            return Err(ServerError::WrongDataFormat("empty username".into()));
        }

        let mut users = self.users.write().await;
        let mut updated = users.get(id).cloned().ok_or(ServerError::NotFound)?;
        updated.user.username = username.to_owned();
        if has_conflict(&users, &updated) {
            return Err(ServerError::AlreadyExists);
        }
        users.insert(id.to_owned(), updated);

        Ok(())
    }

    async fn delete_user(&self, id: &str) -> Result<()> {
        check_id(id)?;

        self.users
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or(ServerError::NotFound)
    }

    async fn fetch_users(
        &self,
        filter: &str,
        skip: usize,
        limit: usize,
    ) -> Result<(Vec<User>, u64)> {
        let regex = filter_regex(filter);
        let users = self
            .users
            .read()
            .await
            .values()
            .filter(|user| {
                regex
                    .as_ref()
                    .is_none_or(|regex| regex.is_match(&user.user.username))
            })
            .cloned()
            .map(StoredUser::into_user)
            .collect();

        Ok(page_users(users, skip, limit))
    }

    async fn update_login_metadata(&self, id: &str) {
        match self.users.write().await.get_mut(id) {
            Some(user) => {
                user.user.num_of_logins += 1;
                user.user.latest_login_time = chrono::Utc::now().timestamp();
            },
            None => {
                tracing::warn!(user_id = id, "cannot update login metadata")
            },
        }
    }
}

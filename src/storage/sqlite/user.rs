use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{Pool, Sqlite, SqliteConnection};

use super::{begin_write, get, insert, remove, upsert, values};
use crate::crypto::PasswordManager;
use crate::error::{Result, ServerError};
use crate::model::User;
use crate::storage::{
    EMAIL_INDEX, FEDERATED_INDEX, PHONE_INDEX, StoredUser, USERNAME_INDEX,
    UserStorage, check_id, filter_regex, merge_update, page_users,
    prepare_new_user, username_key,
};

const USERS: &str = "users";

/// Users stored in the `users` bucket, indexed by unique lookups buckets.
pub struct SqliteUserStorage {
    pool: Pool<Sqlite>,
    passwords: Arc<PasswordManager>,
}

impl SqliteUserStorage {
    /// Create a new [`SqliteUserStorage`].
    pub fn new(pool: Pool<Sqlite>, passwords: Arc<PasswordManager>) -> Self {
        Self { pool, passwords }
    }

    async fn stored(
        conn: &mut SqliteConnection,
        id: &str,
    ) -> Result<StoredUser> {
        let value = get(conn, USERS, id).await?.ok_or(ServerError::NotFound)?;
        Ok(serde_json::from_str(&value)?)
    }

    /// Resolve an index entry then load the user.
    async fn stored_by(&self, index: &str, key: &str) -> Result<StoredUser> {
        let mut conn = self.pool.acquire().await?;
        let id = get(&mut conn, index, key)
            .await?
            .ok_or(ServerError::NotFound)?;

        Self::stored(&mut conn, &id).await
    }

    /// Replace index entries of `old` by those of `new`.
    async fn reindex(
        conn: &mut SqliteConnection,
        old: &StoredUser,
        new: &StoredUser,
    ) -> Result<()> {
        for (index, key) in old.unique_keys() {
            remove(conn, index, &key).await?;
        }
        for (index, key) in new.unique_keys() {
            insert(conn, index, &key, &new.user.id, None).await?;
        }

        Ok(())
    }

    async fn save(conn: &mut SqliteConnection, user: &StoredUser) -> Result<()> {
        upsert(conn, USERS, &user.user.id, &serde_json::to_string(user)?, None)
            .await
    }
}

#[async_trait]
impl UserStorage for SqliteUserStorage {
    async fn user_by_id(&self, id: &str) -> Result<User> {
        check_id(id)?;

        let mut conn = self.pool.acquire().await?;
        Self::stored(&mut conn, id).await.map(StoredUser::into_user)
    }

    async fn user_by_email(&self, email: &str) -> Result<User> {
        self.stored_by(EMAIL_INDEX, &email.trim().to_lowercase())
            .await
            .map(StoredUser::into_user)
    }

    async fn user_by_phone(&self, phone: &str) -> Result<User> {
        self.stored_by(PHONE_INDEX, phone.trim())
            .await
            .map(StoredUser::into_user)
    }

    async fn user_by_federated_id(
        &self,
        provider: &str,
        id: &str,
    ) -> Result<User> {
        self.stored_by(FEDERATED_INDEX, &User::federated_id(provider, id))
            .await
            .map(StoredUser::into_user)
    }

    async fn user_exists(&self, name: &str) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        Ok(get(&mut conn, USERNAME_INDEX, &username_key(name))
            .await?
            .is_some())
    }

    async fn user_by_name_password(
        &self,
        name: &str,
        password: &str,
    ) -> Result<User> {
        let stored = self.stored_by(USERNAME_INDEX, &username_key(name)).await?;

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
        let stored = self.stored_by(USERNAME_INDEX, &username_key(name)).await?;
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

        let mut tx = begin_write(&self.pool).await?;
        for (index, key) in stored.unique_keys() {
            insert(&mut tx, index, &key, &stored.user.id, None).await?;
        }
        Self::save(&mut tx, &stored).await?;
        tx.commit().await?;

        Ok(stored.into_user())
    }

    async fn update_user(&self, id: &str, user: User) -> Result<User> {
        check_id(id)?;

        let mut tx = begin_write(&self.pool).await?;
        let existing = Self::stored(&mut tx, id).await?;
        let updated = merge_update(&existing, user)?;
        Self::reindex(&mut tx, &existing, &updated).await?;
        Self::save(&mut tx, &updated).await?;
        tx.commit().await?;

        Ok(updated.into_user())
    }

    async fn reset_password(&self, id: &str, password: &str) -> Result<()> {
        check_id(id)?;
        let hash = self.passwords.hash(password.to_owned()).await?;

        let mut tx = begin_write(&self.pool).await?;
        let mut stored = Self::stored(&mut tx, id).await?;
        stored.password_hash = hash;
        Self::save(&mut tx, &stored).await?;
        tx.commit().await?;

        Ok(())
    }

    async fn reset_username(&self, id: &str, username: &str) -> Result<()> {
        check_id(id)?;
        if username.trim().is_empty() {
            return Err(ServerError::WrongDataFormat("empty username".into()));
        }

        let mut tx = begin_write(&self.pool).await?;
        let existing = Self::stored(&mut tx, id).await?;
        let mut updated = existing.clone();
        updated.user.username = username.to_owned();
        Self::reindex(&mut tx, &existing, &updated).await?;
        Self::save(&mut tx, &updated).await?;
        tx.commit().await?;

        Ok(())
    }

    async fn delete_user(&self, id: &str) -> Result<()> {
        check_id(id)?;

        let mut tx = begin_write(&self.pool).await?;
        let existing = Self::stored(&mut tx, id).await?;
        for (index, key) in existing.unique_keys() {
            remove(&mut tx, index, &key).await?;
        }
        remove(&mut tx, USERS, id).await?;
        tx.commit().await?;

        Ok(())
    }

    async fn fetch_users(
        &self,
        filter: &str,
        skip: usize,
        limit: usize,
    ) -> Result<(Vec<User>, u64)> {
        let regex = filter_regex(filter);
        let mut conn = self.pool.acquire().await?;

        let mut users = Vec::new();
        for value in values(&mut conn, USERS).await? {
            let user = serde_json::from_str::<StoredUser>(&value)?.into_user();
            if regex.as_ref().is_none_or(|r| r.is_match(&user.username)) {
                users.push(user);
            }
        }

        Ok(page_users(users, skip, limit))
    }

    async fn update_login_metadata(&self, id: &str) {
        let result = async {
            let mut tx = begin_write(&self.pool).await?;
            let mut stored = Self::stored(&mut tx, id).await?;
            stored.user.num_of_logins += 1;
            stored.user.latest_login_time = chrono::Utc::now().timestamp();
            Self::save(&mut tx, &stored).await?;
            tx.commit().await?;
            Ok::<_, ServerError>(())
        }
        .await;

        if let Err(err) = result {
            tracing::warn!(user_id = id, %err, "cannot update login metadata");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_password_manager;
    use crate::storage::sqlite::{self, test_pool};

    async fn storage() -> SqliteUserStorage {
        SqliteUserStorage::new(test_pool().await, test_password_manager())
    }

    #[tokio::test]
    async fn test_name_password_round_trip() {
        let storage = storage().await;
        let user = storage
            .add_user_by_name_and_password("alice", "p@ss", "user", false)
            .await
            .unwrap();

        let found = storage.user_by_name_password("Alice", "p@ss").await.unwrap();
        assert_eq!(found.id, user.id);
        assert!(found.password_hash.is_empty());

        assert!(matches!(
            storage.user_by_name_password("alice", "wrong").await,
            Err(ServerError::NotFound)
        ));
        assert!(matches!(
            storage.user_by_name_password("nobody", "p@ss").await,
            Err(ServerError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_uniqueness() {
        let storage = storage().await;
        storage
            .add_user_by_name_and_password("bob@example.com", "pwd", "user", false)
            .await
            .unwrap();

        assert!(matches!(
            storage
                .add_user_by_name_and_password("BOB@example.com", "pwd", "user", false)
                .await,
            Err(ServerError::AlreadyExists)
        ));

        // Email conflict under another username.
        let user = User {
            username: "robert".into(),
            email: Some("Bob@Example.com".into()),
            ..User::new()
        };
        assert!(matches!(
            storage.add_new_user(user, "").await,
            Err(ServerError::AlreadyExists)
        ));

        // Failed insertions leave nothing behind.
        assert!(!storage.user_exists("robert").await.unwrap());
    }

    #[tokio::test]
    async fn test_update_reindexes() {
        let storage = storage().await;
        let user = storage
            .add_user_by_name_and_password("alice", "pwd", "user", false)
            .await
            .unwrap();
        storage
            .add_user_by_name_and_password("bob", "pwd", "user", false)
            .await
            .unwrap();

        let mut update = user.clone();
        update.username = "BOB".into();
        assert!(matches!(
            storage.update_user(&user.id, update).await,
            Err(ServerError::AlreadyExists)
        ));

        let mut update = user.clone();
        update.username = "carol".into();
        update.email = Some("Carol@Example.com".into());
        storage.update_user(&user.id, update).await.unwrap();

        assert!(!storage.user_exists("alice").await.unwrap());
        assert_eq!(
            storage.user_by_email("carol@example.com").await.unwrap().id,
            user.id
        );
        storage.user_by_name_password("carol", "pwd").await.unwrap();

        storage.reset_username(&user.id, "dave").await.unwrap();
        assert_eq!(storage.id_by_name("DAVE").await.unwrap(), user.id);

        storage.delete_user(&user.id).await.unwrap();
        assert!(!storage.user_exists("dave").await.unwrap());
        assert!(matches!(
            storage.user_by_email("carol@example.com").await,
            Err(ServerError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_login_metadata() {
        let storage = storage().await;
        let user = storage
            .add_user_by_name_and_password("alice", "pwd", "user", false)
            .await
            .unwrap();

        storage.update_login_metadata(&user.id).await;
        storage.update_login_metadata(&user.id).await;
        // Unknown users are only logged.
        storage
            .update_login_metadata(&uuid::Uuid::new_v4().to_string())
            .await;

        let user = storage.user_by_id(&user.id).await.unwrap();
        assert_eq!(user.num_of_logins, 2);
        assert!(user.latest_login_time > 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_on_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.db");
        let pool = sqlite::connect(&path.to_string_lossy(), None).await.unwrap();
        let storage =
            Arc::new(SqliteUserStorage::new(pool, test_password_manager()));

        let mut ids = Vec::new();
        for i in 0..20 {
            let user = User {
                username: format!("member{i:02}"),
                ..User::new()
            };
            ids.push(storage.add_new_user(user, "").await.unwrap().id);
        }

        let mut tasks = Vec::new();
        for i in 0..100 {
            let storage = Arc::clone(&storage);
            let id = ids[i % ids.len()].clone();
            tasks.push(tokio::spawn(async move {
                let mut user = storage.user_by_id(&id).await?;
                user.access_role = format!("role{i}");
                storage.update_user(&id, user).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let mut tasks = Vec::new();
        for _ in 0..30 {
            let storage = Arc::clone(&storage);
            let id = ids[0].clone();
            tasks.push(tokio::spawn(async move {
                storage.update_login_metadata(&id).await
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let user = storage.user_by_id(&ids[0]).await.unwrap();
        assert_eq!(user.num_of_logins, 30);
    }

    #[tokio::test]
    async fn test_fetch_users_paging() {
        let storage = storage().await;
        for i in 0..25 {
            storage
                .add_new_user(
                    User {
                        username: format!("member{i:02}"),
                        ..User::new()
                    },
                    "",
                )
                .await
                .unwrap();
        }

        let (page, total) = storage.fetch_users("", 0, 20).await.unwrap();
        assert_eq!((page.len(), total), (20, 25));

        let (page, total) = storage.fetch_users("", 20, 20).await.unwrap();
        assert_eq!((page.len(), total), (5, 25));
        assert_eq!(page[4].username, "member24");
    }
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgConnection, Pool, Postgres};

use crate::crypto::PasswordManager;
use crate::error::{Result, ServerError};
use crate::model::User;
use crate::storage::{
    StoredUser, UserStorage, check_id, filter_pattern, merge_update,
    prepare_new_user, username_key, with_timeout,
};

/// Users as JSONB documents.
pub struct PgUserStorage {
    pool: Pool<Postgres>,
    passwords: Arc<PasswordManager>,
    timeout: Duration,
}

impl PgUserStorage {
    /// Create a new [`PgUserStorage`].
    pub fn new(
        pool: Pool<Postgres>,
        passwords: Arc<PasswordManager>,
        timeout: Duration,
    ) -> Self {
        Self {
            pool,
            passwords,
            timeout,
        }
    }

    /// Fetch one stored user matching `condition`, bound to `$1`.
    async fn find(&self, condition: &str, value: &str) -> Result<StoredUser> {
        let query = format!("SELECT document::text FROM users WHERE {condition}");

        let (document,) = with_timeout(self.timeout, async {
            Ok::<_, ServerError>(sqlx::query_as::<_, (String,)>(&query)
                .bind(value)
                .fetch_one(&self.pool)
                .await?)
        })
        .await?;

        Ok(serde_json::from_str(&document)?)
    }

    async fn find_by_name(&self, name: &str) -> Result<StoredUser> {
        self.find("lower(document->>'username') = $1", &username_key(name))
            .await
    }

    async fn lock(conn: &mut PgConnection, id: &str) -> Result<StoredUser> {
        let (document,) = sqlx::query_as::<_, (String,)>(
            "SELECT document::text FROM users WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_one(&mut *conn)
        .await?;

        Ok(serde_json::from_str(&document)?)
    }

    async fn save(conn: &mut PgConnection, user: &StoredUser) -> Result<()> {
        sqlx::query("UPDATE users SET document = $2::jsonb WHERE id = $1")
            .bind(&user.user.id)
            .bind(serde_json::to_string(user)?)
            .execute(&mut *conn)
            .await?;

        Ok(())
    }

    async fn link_federated_ids(
        conn: &mut PgConnection,
        user: &StoredUser,
    ) -> Result<()> {
        sqlx::query("DELETE FROM user_federated_ids WHERE user_id = $1")
            .bind(&user.user.id)
            .execute(&mut *conn)
            .await?;

        for sid in &user.user.federated_ids {
            sqlx::query(
                r#"INSERT INTO user_federated_ids (federated_id, user_id)
                    VALUES ($1, $2)"#,
            )
            .bind(sid)
            .bind(&user.user.id)
            .execute(&mut *conn)
            .await?;
        }

        Ok(())
    }

    /// Lock, modify then save a user in one transaction.
    async fn modify<F>(&self, id: &str, apply: F) -> Result<StoredUser>
    where
        F: FnOnce(&StoredUser) -> Result<StoredUser> + Send,
    {
        with_timeout(self.timeout, async {
            let mut tx = self.pool.begin().await?;
            let existing = Self::lock(&mut tx, id).await?;
            let updated = apply(&existing)?;
            Self::save(&mut tx, &updated).await?;
            if existing.user.federated_ids != updated.user.federated_ids {
                Self::link_federated_ids(&mut tx, &updated).await?;
            }
            tx.commit().await?;

            Ok::<_, ServerError>(updated)
        })
        .await
    }
}

#[async_trait]
impl UserStorage for PgUserStorage {
    async fn user_by_id(&self, id: &str) -> Result<User> {
        check_id(id)?;
        self.find("id = $1", id).await.map(StoredUser::into_user)
    }

    async fn user_by_email(&self, email: &str) -> Result<User> {
        self.find("document->>'email' = $1", &email.trim().to_lowercase())
            .await
            .map(StoredUser::into_user)
    }

    async fn user_by_phone(&self, phone: &str) -> Result<User> {
        self.find("document->>'phone' = $1", phone.trim())
            .await
            .map(StoredUser::into_user)
    }

    async fn user_by_federated_id(
        &self,
        provider: &str,
        id: &str,
    ) -> Result<User> {
        self.find(
            "id = (SELECT user_id FROM user_federated_ids WHERE federated_id = $1)",
            &User::federated_id(provider, id),
        )
        .await
        .map(StoredUser::into_user)
    }

    async fn user_exists(&self, name: &str) -> Result<bool> {
        let key = username_key(name);
        let (exists,) = with_timeout(self.timeout, async {
            Ok::<_, ServerError>(sqlx::query_as::<_, (bool,)>(
                r#"SELECT EXISTS (SELECT 1 FROM users
                    WHERE lower(document->>'username') = $1)"#,
            )
            .bind(&key)
            .fetch_one(&self.pool)
            .await?)
        })
        .await?;

        Ok(exists)
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

        with_timeout(self.timeout, async {
            let mut tx = self.pool.begin().await?;
            sqlx::query("INSERT INTO users (id, document) VALUES ($1, $2::jsonb)")
                .bind(&stored.user.id)
                .bind(serde_json::to_string(&stored)?)
                .execute(&mut *tx)
                .await?;
            Self::link_federated_ids(&mut tx, &stored).await?;
            tx.commit().await?;

            Ok::<_, ServerError>(())
        })
        .await?;

        Ok(stored.into_user())
    }

    async fn update_user(&self, id: &str, user: User) -> Result<User> {
        check_id(id)?;
        self.modify(id, |existing| merge_update(existing, user))
            .await
            .map(StoredUser::into_user)
    }

    async fn reset_password(&self, id: &str, password: &str) -> Result<()> {
        check_id(id)?;
        let hash = self.passwords.hash(password.to_owned()).await?;

        self.modify(id, |existing| {
            Ok(StoredUser {
                user: existing.user.clone(),
                password_hash: hash,
            })
        })
        .await?;

        Ok(())
    }

    async fn reset_username(&self, id: &str, username: &str) -> Result<()> {
        check_id(id)?;
        if username.trim().is_empty() {
            return Err(ServerError::WrongDataFormat("empty username".into()));
        }

        self.modify(id, |existing| {
            let mut updated = existing.clone();
            updated.user.username = username.to_owned();
            Ok(updated)
        })
        .await?;

        Ok(())
    }

    async fn delete_user(&self, id: &str) -> Result<()> {
        check_id(id)?;

        let result = with_timeout(self.timeout, async {
            Ok::<_, ServerError>(sqlx::query("DELETE FROM users WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await?)
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(ServerError::NotFound);
        }

        Ok(())
    }

    async fn fetch_users(
        &self,
        filter: &str,
        skip: usize,
        limit: usize,
    ) -> Result<(Vec<User>, u64)> {
        const CONDITION: &str = "($1 = '' OR document->>'username' ~* $1)";

        let pattern = filter_pattern(filter);

        with_timeout(self.timeout * 2, async {
            let (total,) = sqlx::query_as::<_, (i64,)>(&format!(
                "SELECT count(*) FROM users WHERE {CONDITION}"
            ))
            .bind(pattern.as_ref())
            .fetch_one(&self.pool)
            .await?;

            let documents = sqlx::query_as::<_, (String,)>(&format!(
                r#"SELECT document::text FROM users WHERE {CONDITION}
                    ORDER BY lower(document->>'username') OFFSET $2 LIMIT $3"#
            ))
            .bind(pattern.as_ref())
            .bind(skip as i64)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

            let users = documents
                .into_iter()
                .map(|(document,)| {
                    serde_json::from_str::<StoredUser>(&document)
                        .map(StoredUser::into_user)
                })
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok::<_, ServerError>((users, total as u64))
        })
        .await
    }

    async fn update_login_metadata(&self, id: &str) {
        let result = with_timeout(self.timeout * 2, async {
            Ok::<_, ServerError>(sqlx::query(
                r#"UPDATE users SET document = document
                    || jsonb_build_object(
                        'num_of_logins',
                        COALESCE((document->>'num_of_logins')::bigint, 0) + 1,
                        'latest_login_time', $2::bigint)
                    WHERE id = $1"#,
            )
            .bind(id)
            .bind(chrono::Utc::now().timestamp())
            .execute(&self.pool)
            .await?)
        })
        .await;

        match result {
            Ok(result) if result.rows_affected() == 0 => {
                tracing::warn!(user_id = id, "cannot update login metadata")
            },
            Err(err) => {
                tracing::warn!(user_id = id, %err, "cannot update login metadata")
            },
            Ok(_) => {},
        }
    }
}

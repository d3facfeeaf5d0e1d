//! Storage abstraction.
//!
//! Every category is a trait implemented by sibling backends. Callers only
//! ever see `Arc<dyn _>` and never downcast.

pub mod memory;
pub mod postgres;
pub mod sqlite;

use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ServerError};
use crate::model::{
    App, EMAIL_REGEX, ImportedUser, PHONE_REGEX, Purpose, User,
    VerificationCode,
};

/// Storage-wide scopes granted to any user.
pub const DEFAULT_SCOPES: [&str; 2] = ["offline", "user"];

/// Storage categories assembled by the composer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Category {
    App,
    User,
    Token,
    TokenBlacklist,
    VerificationCode,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::App,
        Category::User,
        Category::Token,
        Category::TokenBlacklist,
        Category::VerificationCode,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::App => "app_storage",
            Category::User => "user_storage",
            Category::Token => "token_storage",
            Category::TokenBlacklist => "token_blacklist",
            Category::VerificationCode => "verification_code_storage",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client applications.
#[async_trait]
pub trait AppStorage: Send + Sync {
    async fn app_by_id(&self, id: &str) -> Result<App>;

    /// Insert `app`, generating its ID and secret when empty.
    async fn add_app(&self, app: App) -> Result<App>;

    async fn update_app(&self, id: &str, app: App) -> Result<App>;

    async fn delete_app(&self, id: &str) -> Result<()>;

    /// Page of apps ordered by name, with the total matching `filter`.
    async fn fetch_apps(
        &self,
        filter: &str,
        skip: usize,
        limit: usize,
    ) -> Result<(Vec<App>, u64)>;

    /// Insert every app of a JSON array. Stops on first failure.
    async fn import_json(&self, data: &[u8]) -> Result<()> {
        let apps: Vec<App> = serde_json::from_slice(data)?;
        for app in apps {
            self.add_app(app).await?;
        }
        Ok(())
    }
}

/// End users.
///
/// Every returned [`User`] has its password hash cleared.
#[async_trait]
pub trait UserStorage: Send + Sync {
    fn new_user(&self) -> User {
        User::new()
    }

    async fn user_by_id(&self, id: &str) -> Result<User>;

    async fn user_by_email(&self, email: &str) -> Result<User>;

    async fn user_by_phone(&self, phone: &str) -> Result<User>;

    async fn user_by_federated_id(
        &self,
        provider: &str,
        id: &str,
    ) -> Result<User>;

    /// Case-insensitive exact match on username.
    async fn user_exists(&self, name: &str) -> Result<bool>;

    /// Unknown name and wrong password both are [`ServerError::NotFound`].
    async fn user_by_name_password(
        &self,
        name: &str,
        password: &str,
    ) -> Result<User>;

    /// ID of an active user.
    async fn id_by_name(&self, name: &str) -> Result<String>;

    /// Persist `user` with a fresh ID. An empty password stores no hash.
    async fn add_new_user(&self, user: User, password: &str) -> Result<User>;

    async fn add_user_by_name_and_password(
        &self,
        username: &str,
        password: &str,
        role: &str,
        is_anonymous: bool,
    ) -> Result<User> {
        let mut user = self.new_user();
        user.username = username.to_owned();
        user.access_role = role.to_owned();
        user.anonymous = is_anonymous;

        if EMAIL_REGEX.is_match(username) {
            user.email = Some(username.to_owned());
        }
        if PHONE_REGEX.is_match(username) {
            user.phone = Some(username.to_owned());
        }

        self.add_new_user(user, password).await
    }

    async fn add_user_by_phone(&self, phone: &str, role: &str) -> Result<User> {
        let mut user = self.new_user();
        user.username = phone.to_owned();
        user.phone = Some(phone.to_owned());
        user.access_role = role.to_owned();

        self.add_new_user(user, "").await
    }

    async fn add_user_with_federated_id(
        &self,
        provider: &str,
        federated_id: &str,
        role: &str,
    ) -> Result<User> {
        match self.user_by_federated_id(provider, federated_id).await {
            Ok(_) => return Err(ServerError::AlreadyExists),
            Err(ServerError::NotFound) => {},
            Err(err) => return Err(err),
        }

        let sid = User::federated_id(provider, federated_id);
        let mut user = self.new_user();
        user.username = sid.clone();
        user.federated_ids = vec![sid];
        user.access_role = role.to_owned();

        self.add_new_user(user, "").await
    }

    /// Replace mutable fields. ID, password hash and login metadata are kept.
    async fn update_user(&self, id: &str, user: User) -> Result<User>;

    async fn reset_password(&self, id: &str, password: &str) -> Result<()>;

    async fn reset_username(&self, id: &str, username: &str) -> Result<()>;

    async fn delete_user(&self, id: &str) -> Result<()>;

    /// Page of users ordered by username, with the total matching `filter`.
    ///
    /// Total and page are not read under one snapshot.
    async fn fetch_users(
        &self,
        filter: &str,
        skip: usize,
        limit: usize,
    ) -> Result<(Vec<User>, u64)>;

    /// Increment login counter. Failures are only logged.
    async fn update_login_metadata(&self, id: &str);

    /// Scopes of `scopes` the user may be granted.
    async fn request_scopes(
        &self,
        user_id: &str,
        scopes: &[String],
    ) -> Result<Vec<String>> {
        let user = self.user_by_id(user_id).await?;
        let allowed = self.scopes().await;

        Ok(scopes
            .iter()
            .filter(|scope| {
                user.scopes.contains(*scope) || allowed.contains(*scope)
            })
            .cloned()
            .collect())
    }

    /// Scopes any user may be granted.
    async fn scopes(&self) -> Vec<String> {
        DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect()
    }

    async fn attach_device_token(&self, _id: &str, _token: &str) -> Result<()> {
        Err(ServerError::NotImplemented)
    }

    async fn detach_device_token(&self, _token: &str) -> Result<()> {
        Err(ServerError::NotImplemented)
    }

    /// Insert every user of a JSON array, hashing their plaintext password.
    /// Stops on first failure.
    async fn import_json(&self, data: &[u8]) -> Result<()> {
        let records: Vec<ImportedUser> = serde_json::from_slice(data)?;
        for record in records {
            self.add_new_user(record.user, &record.password).await?;
        }
        Ok(())
    }
}

/// Issued refresh tokens.
#[async_trait]
pub trait TokenStorage: Send + Sync {
    /// `expires_at` is the token own expiry, in seconds.
    async fn save_token(&self, token: &str, expires_at: i64) -> Result<()>;

    async fn has_token(&self, token: &str) -> Result<bool>;

    async fn delete_token(&self, token: &str) -> Result<()>;

    /// Drop tokens which can no longer be exchanged.
    async fn delete_expired(&self) -> Result<u64>;
}

/// Revoked token identifiers.
#[async_trait]
pub trait TokenBlacklist: Send + Sync {
    async fn is_blacklisted(&self, jti: &str) -> Result<bool>;

    /// Idempotent. `expires_at` is the token own expiry, in seconds.
    async fn add(&self, jti: &str, expires_at: i64) -> Result<()>;

    /// Drop entries whose token is expired anyway.
    async fn cleanup_expired(&self) -> Result<u64>;
}

/// Single-use verification codes.
#[async_trait]
pub trait VerificationCodeStorage: Send + Sync {
    /// Replace any previous code of the same user and purpose.
    async fn create_code(&self, code: &VerificationCode) -> Result<()>;

    /// Delete a matching, unexpired code or fail with
    /// [`ServerError::NotFound`].
    async fn consume_code(
        &self,
        user_id: &str,
        purpose: Purpose,
        code: &str,
    ) -> Result<()>;

    async fn delete_expired(&self) -> Result<u64>;
}

/// Update login metadata without blocking the caller.
pub fn spawn_login_metadata_update(storage: Arc<dyn UserStorage>, id: String) {
    tokio::spawn(async move {
        storage.update_login_metadata(&id).await;
    });
}

/// Bound a remote call by `duration`.
pub(crate) async fn with_timeout<T>(
    duration: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(duration, fut).await?
}

/// User as persisted by backends, hash included.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct StoredUser {
    #[serde(flatten)]
    pub user: User,
    #[serde(default)]
    pub password_hash: String,
}

impl StoredUser {
    pub fn into_user(self) -> User {
        let mut user = self.user;
        user.password_hash.clear();
        user
    }

    /// Lookup keys which must be unique across users.
    pub fn unique_keys(&self) -> Vec<(&'static str, String)> {
        let mut keys = vec![(USERNAME_INDEX, username_key(&self.user.username))];
        if let Some(email) = &self.user.email {
            keys.push((EMAIL_INDEX, email.clone()));
        }
        if let Some(phone) = &self.user.phone {
            keys.push((PHONE_INDEX, phone.clone()));
        }
        for sid in &self.user.federated_ids {
            keys.push((FEDERATED_INDEX, sid.clone()));
        }
        keys
    }
}

pub(crate) const USERNAME_INDEX: &str = "usernames";
pub(crate) const EMAIL_INDEX: &str = "emails";
pub(crate) const PHONE_INDEX: &str = "phones";
pub(crate) const FEDERATED_INDEX: &str = "federated_ids";

/// Normalized username used for uniqueness and lookups.
pub(crate) fn username_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Reject IDs which are not UUIDs.
pub(crate) fn check_id(id: &str) -> Result<()> {
    uuid::Uuid::parse_str(id)
        .map(|_| ())
        .map_err(|_| ServerError::WrongDataFormat(format!("invalid id {id:?}")))
}

/// Build the persisted form of a new user.
pub(crate) fn prepare_new_user(
    mut user: User,
    password_hash: String,
) -> Result<StoredUser> {
    if user.username.trim().is_empty() {
        return Err(ServerError::WrongDataFormat("empty username".into()));
    }

    user.id = uuid::Uuid::new_v4().to_string();
    user.password_hash.clear();
    user.normalize();

    Ok(StoredUser {
        user,
        password_hash,
    })
}

/// Apply an update on a stored user, keeping immutable fields.
///
/// Users leave the process without their TFA secret, so the stored secret
/// is kept unless TFA is switched on or off.
pub(crate) fn merge_update(
    existing: &StoredUser,
    mut update: User,
) -> Result<StoredUser> {
    if update.username.trim().is_empty() {
        return Err(ServerError::WrongDataFormat("empty username".into()));
    }

    update.id = existing.user.id.clone();
    update.password_hash.clear();
    update.num_of_logins = existing.user.num_of_logins;
    update.latest_login_time = existing.user.latest_login_time;
    if update.tfa_info.is_enabled == existing.user.tfa_info.is_enabled {
        update.tfa_info.secret = existing.user.tfa_info.secret.clone();
    }
    update.normalize();

    Ok(StoredUser {
        user: update,
        password_hash: existing.password_hash.clone(),
    })
}

/// Case-insensitive matcher of a fetch filter. Not a valid regex means a
/// literal substring.
pub(crate) fn filter_regex(filter: &str) -> Option<Regex> {
    if filter.is_empty() {
        return None;
    }

    Regex::new(&format!("(?i){filter}"))
        .or_else(|_| {
            Regex::new(&format!("(?i){}", regex_lite::escape(filter)))
        })
        .ok()
}

/// Fetch filter as handed to a database regex operator. Not a valid regex
/// means a literal substring, as with [`filter_regex`].
pub(crate) fn filter_pattern(filter: &str) -> Cow<'_, str> {
    if Regex::new(filter).is_ok() {
        Cow::Borrowed(filter)
    } else {
        Cow::Owned(regex_lite::escape(filter))
    }
}

/// Sort users by username then cut the requested page.
pub(crate) fn page_users(
    mut users: Vec<User>,
    skip: usize,
    limit: usize,
) -> (Vec<User>, u64) {
    let total = users.len() as u64;
    users.sort_by_key(|user| username_key(&user.username));

    (users.into_iter().skip(skip).take(limit).collect(), total)
}

/// Sort apps by name then cut the requested page.
pub(crate) fn page_apps(
    mut apps: Vec<App>,
    skip: usize,
    limit: usize,
) -> (Vec<App>, u64) {
    let total = apps.len() as u64;
    apps.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));

    (apps.into_iter().skip(skip).take(limit).collect(), total)
}

/// Fill ID and secret of a new app.
pub(crate) fn prepare_new_app(mut app: App) -> App {
    if app.id.is_empty() {
        app.id = uuid::Uuid::new_v4().to_string();
    }
    if app.secret.is_empty() {
        app.secret = App::generate_secret();
    }
    app
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_id() {
        assert!(check_id(&uuid::Uuid::new_v4().to_string()).is_ok());
        assert!(matches!(
            check_id("not-an-id"),
            Err(ServerError::WrongDataFormat(_))
        ));
    }

    #[test]
    fn test_prepare_new_user() {
        let mut user = User::new();
        user.username = "Alice".into();
        user.email = Some(" Alice@Example.COM ".into());
        user.phone = Some(String::new());

        let stored = prepare_new_user(user, "hash".into()).unwrap();
        assert!(check_id(&stored.user.id).is_ok());
        assert_eq!(stored.user.email.as_deref(), Some("alice@example.com"));
        assert_eq!(stored.user.phone, None);
        assert_eq!(stored.unique_keys()[0], (USERNAME_INDEX, "alice".into()));

        assert!(matches!(
            prepare_new_user(User::new(), String::new()),
            Err(ServerError::WrongDataFormat(_))
        ));
    }

    #[test]
    fn test_merge_update() {
        let mut user = User::new();
        user.username = "alice".into();
        let mut existing = prepare_new_user(user, "hash".into()).unwrap();
        existing.user.num_of_logins = 3;

        let mut update = User::new();
        update.id = "other".into();
        update.username = "bob".into();
        update.num_of_logins = 0;

        let merged = merge_update(&existing, update).unwrap();
        assert_eq!(merged.user.id, existing.user.id);
        assert_eq!(merged.user.username, "bob");
        assert_eq!(merged.user.num_of_logins, 3);
        assert_eq!(merged.password_hash, "hash");
    }

    #[test]
    fn test_merge_update_keeps_tfa_secret() {
        let mut user = User::new();
        user.username = "alice".into();
        user.tfa_info.is_enabled = true;
        user.tfa_info.secret = "JBSWY3DPEHPK3PXP".into();
        let existing = prepare_new_user(user, "hash".into()).unwrap();

        let update = existing.user.clone().sanitized();
        let merged = merge_update(&existing, update).unwrap();
        assert!(merged.user.tfa_info.is_enabled);
        assert_eq!(merged.user.tfa_info.secret, "JBSWY3DPEHPK3PXP");

        // Switching TFA off takes the update as is.
        let mut update = existing.user.clone().sanitized();
        update.tfa_info.is_enabled = false;
        let merged = merge_update(&existing, update).unwrap();
        assert!(!merged.user.tfa_info.is_enabled);
        assert!(merged.user.tfa_info.secret.is_empty());
    }

    #[test]
    fn test_filter_pattern() {
        assert_eq!(filter_pattern("^al.*"), "^al.*");
        assert_eq!(filter_pattern("a("), r"a\(");
    }

    #[test]
    fn test_filter_regex() {
        assert!(filter_regex("").is_none());

        let regex = filter_regex("^AL").unwrap();
        assert!(regex.is_match("alice"));
        assert!(!regex.is_match("bob"));

        // Unbalanced group is taken literally.
        let regex = filter_regex("a(").unwrap();
        assert!(regex.is_match("xA(x"));
    }

    #[test]
    fn test_page_users() {
        let users = ["carol", "Alice", "bob"]
            .iter()
            .map(|name| User {
                username: name.to_string(),
                ..Default::default()
            })
            .collect();

        let (page, total) = page_users(users, 1, 5);
        assert_eq!(total, 3);
        assert_eq!(
            page.iter().map(|u| u.username.as_str()).collect::<Vec<_>>(),
            ["bob", "carol"]
        );
    }
}

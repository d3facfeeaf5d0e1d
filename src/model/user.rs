use std::sync::LazyLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

/// Matches usernames that are in fact email addresses.
pub static EMAIL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email regex")
});

/// Matches usernames that are in fact E.164 phone numbers.
pub static PHONE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\+[0-9]{6,15}$").expect("valid phone regex")
});

/// Two-factor authentication settings of a [`User`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TfaInfo {
    pub is_enabled: bool,
    pub secret: String,
}

/// End user as exposed by every storage.
///
/// The password hash is never serialized: it only lives inside storages and
/// is cleared on every read.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip)]
    pub password_hash: String,
    pub access_role: String,
    pub scopes: Vec<String>,
    pub tfa_info: TfaInfo,
    pub federated_ids: Vec<String>,
    pub active: bool,
    pub anonymous: bool,
    pub num_of_logins: u64,
    /// Unix timestamp, in seconds.
    pub latest_login_time: i64,
}

impl User {
    /// Create an empty, active [`User`].
    pub fn new() -> Self {
        Self {
            active: true,
            ..Default::default()
        }
    }

    /// Remove every secret before the user leaves the process.
    pub fn sanitized(mut self) -> Self {
        self.password_hash.clear();
        self.tfa_info.secret.clear();
        self
    }

    /// Identifier of a federated account, `provider:id`.
    pub fn federated_id(provider: &str, id: &str) -> String {
        format!("{provider}:{id}")
    }

    /// Lowercase email and drop empty optional identifiers.
    pub(crate) fn normalize(&mut self) {
        self.email = self
            .email
            .take()
            .map(|email| email.trim().to_lowercase())
            .filter(|email| !email.is_empty());
        self.phone = self
            .phone
            .take()
            .map(|phone| phone.trim().to_owned())
            .filter(|phone| !phone.is_empty());
    }
}

/// User record as found on a bulk import file.
///
/// Any inbound hash is discarded; the plaintext password is hashed again on
/// insertion.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ImportedUser {
    #[serde(flatten)]
    pub user: User,
    #[serde(default, alias = "pswd")]
    pub password: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitized() {
        let mut user = User::new();
        user.password_hash = "$argon2id$...".into();
        user.tfa_info.secret = "JBSWY3DPEHPK3PXP".into();

        let user = user.sanitized();
        assert!(user.password_hash.is_empty());
        assert!(user.tfa_info.secret.is_empty());
    }

    #[test]
    fn test_hash_never_serialized() {
        let mut user = User::new();
        user.password_hash = "secret-hash".into();

        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("secret-hash"));
    }

    #[test]
    fn test_import_record() {
        let record: ImportedUser = serde_json::from_str(
            r#"{"username":"alice","pswd":"password","password_hash":"x"}"#,
        )
        .unwrap();

        assert_eq!(record.user.username, "alice");
        assert_eq!(record.password, "password");
        assert!(record.user.password_hash.is_empty());
    }

    #[test]
    fn test_identifier_regex() {
        assert!(EMAIL_REGEX.is_match("alice@example.com"));
        assert!(!EMAIL_REGEX.is_match("alice"));
        assert!(PHONE_REGEX.is_match("+33612345678"));
        assert!(!PHONE_REGEX.is_match("0612"));
    }
}

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Why a [`VerificationCode`] was sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    Phone,
    Email,
    ResetPassword,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Phone => "phone",
            Purpose::Email => "email",
            Purpose::ResetPassword => "reset_password",
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single-use code sent to a user.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VerificationCode {
    pub user_id: String,
    pub purpose: Purpose,
    pub code: String,
    /// Unix timestamp, in seconds.
    pub expires_at: i64,
}

impl VerificationCode {
    /// Generate a random 6-digit code valid for `ttl` seconds.
    pub fn generate(user_id: &str, purpose: Purpose, ttl: i64) -> Self {
        let code = rand::thread_rng().gen_range(0..1_000_000);

        Self {
            user_id: user_id.to_owned(),
            purpose,
            code: format!("{code:06}"),
            expires_at: chrono::Utc::now().timestamp() + ttl,
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }

    /// Key grouping codes per user and purpose.
    pub(crate) fn key(&self) -> String {
        code_key(&self.user_id, self.purpose)
    }
}

pub(crate) fn code_key(user_id: &str, purpose: Purpose) -> String {
    format!("{user_id}:{purpose}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate() {
        let code = VerificationCode::generate("id", Purpose::Email, 60);
        assert_eq!(code.code.len(), 6);
        assert!(code.code.chars().all(|c| c.is_ascii_digit()));
        assert!(!code.is_expired(chrono::Utc::now().timestamp()));
        assert_eq!(code.key(), "id:email");
    }
}

use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

const SECRET_LENGTH: usize = 32;

/// Client application allowed to request tokens.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct App {
    pub id: String,
    pub secret: String,
    pub active: bool,
    pub name: String,
    pub description: String,
    /// Scopes the app may request. Empty means unrestricted.
    pub scopes: Vec<String>,
    /// Whether the app may receive refresh tokens.
    pub offline: bool,
    pub redirect_urls: Vec<String>,
    /// Access token lifespan, in seconds. `0` falls back on service default.
    pub token_lifespan: i64,
    /// Refresh token lifespan, in seconds. `0` falls back on service default.
    pub refresh_token_lifespan: i64,
}

impl App {
    /// Whether `scope` is allowed for this app.
    pub fn allows(&self, scope: &str) -> bool {
        self.scopes.is_empty() || self.scopes.iter().any(|s| s == scope)
    }

    /// Random hex-encoded secret.
    pub fn generate_secret() -> String {
        let mut bytes = [0u8; SECRET_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows() {
        let mut app = App::default();
        assert!(app.allows("anything"));

        app.scopes = vec!["user".into()];
        assert!(app.allows("user"));
        assert!(!app.allows("admin"));
    }

    #[test]
    fn test_generate_secret() {
        let secret = App::generate_secret();
        assert_eq!(secret.len(), SECRET_LENGTH * 2);
        assert_ne!(secret, App::generate_secret());
    }
}

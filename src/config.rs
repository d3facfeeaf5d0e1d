//! Configuration manager for vouch.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::FromRef;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::AppState;
use crate::error::{Result, ServerError};
use crate::storage::Category;

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const DEFAULT_ADDRESS: &str = "0.0.0.0:8080";
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default administrator credentials, used when environment is empty.
pub const DEFAULT_ADMIN_LOGIN: &str = "admin@admin.com";
pub const DEFAULT_ADMIN_PASSWORD: &str = "password";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    /// Instance name.
    #[serde(default)]
    pub name: String,
    /// Public URL of current instance, used as token issuer.
    #[serde(default)]
    pub url: String,
    /// Listening address.
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default)]
    version: String,
    #[serde(skip)]
    path: PathBuf,
    /// Related to JsonWebToken configuration.
    #[serde(default, skip_serializing)]
    pub token: Token,
    /// Backend of every storage category.
    #[serde(default, skip_serializing)]
    pub storage: Storage,
    /// Related to Argon2 configuration.
    #[serde(skip_serializing)]
    pub argon2: Option<Argon2>,
    /// Administrator credentials location.
    #[serde(default, skip_serializing)]
    pub admin_account: AdminAccount,
    /// Files imported on first start.
    #[serde(skip_serializing)]
    pub import: Option<Import>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            name: String::default(),
            url: String::default(),
            address: default_address(),
            version: String::default(),
            path: PathBuf::default(),
            token: Token::default(),
            storage: Storage::default(),
            argon2: None,
            admin_account: AdminAccount::default(),
            import: None,
        }
    }
}

fn default_address() -> String {
    DEFAULT_ADDRESS.to_owned()
}

/// Argon2 configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Argon2 {
    /// Memory used while hashing.
    pub memory_cost: u32,
    /// Iterations of hash.
    pub iterations: u32,
    /// Parallelism degree.
    pub parallelism: u32,
    /// Output hash length.
    pub hash_length: usize,
}

impl Default for Argon2 {
    fn default() -> Self {
        Self {
            memory_cost: 1024 * 64, // 64 MiB.
            iterations: 4,
            parallelism: 2,
            hash_length: 32,
        }
    }
}

/// Json Web Token configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Token {
    /// One of `RS256`, `RS384`, `RS512`, `PS256`, `PS384`, `PS512`, `ES256`
    /// or `ES384`.
    pub algorithm: String,
    pub private_key_pem: Option<String>,
    pub public_key_pem: Option<String>,
    pub private_key_path: Option<PathBuf>,
    pub public_key_path: Option<PathBuf>,
    /// Generate an ephemeral key pair when none is given.
    /// Tokens do not survive a restart.
    pub generate: bool,
    /// Default access token lifespan, in seconds.
    pub access_token_ttl: i64,
    /// Default refresh token lifespan, in seconds.
    pub refresh_token_ttl: i64,
}

impl Default for Token {
    fn default() -> Self {
        Self {
            algorithm: "ES256".into(),
            private_key_pem: None,
            public_key_pem: None,
            private_key_path: None,
            public_key_path: None,
            generate: false,
            access_token_ttl: 60 * 15,               // 15 minutes.
            refresh_token_ttl: 60 * 60 * 24 * 30, // 30 days.
        }
    }
}

impl Token {
    /// Read `(private, public)` PEM, inline value first then file.
    pub fn pem_pair(&self) -> Result<Option<(String, String)>> {
        let private_key = read_pem(&self.private_key_pem, &self.private_key_path)?;
        let public_key = read_pem(&self.public_key_pem, &self.public_key_path)?;

        match (private_key, public_key) {
            (Some(private_key), Some(public_key)) => {
                Ok(Some((private_key, public_key)))
            },
            (None, None) => Ok(None),
            _ => Err(ServerError::Config(
                "both private and public keys must be set".into(),
            )),
        }
    }
}

fn read_pem(
    inline: &Option<String>,
    path: &Option<PathBuf>,
) -> Result<Option<String>> {
    if let Some(pem) = inline.as_ref().filter(|pem| !pem.trim().is_empty()) {
        return Ok(Some(pem.clone()));
    }

    path.as_ref()
        .map(|path| {
            std::fs::read_to_string(path).map_err(|err| {
                ServerError::Config(format!(
                    "cannot read key {}: {err}",
                    path.display()
                ))
            })
        })
        .transpose()
}

/// Kind of backend for a storage category.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    #[default]
    Memory,
    /// Embedded key-value store.
    Sqlite,
    /// Document store.
    Postgres,
    /// External process, user storage only.
    Plugin,
}

impl DatabaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseKind::Memory => "memory",
            DatabaseKind::Sqlite => "sqlite",
            DatabaseKind::Postgres => "postgres",
            DatabaseKind::Plugin => "plugin",
        }
    }
}

/// Backend settings of one storage category.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Database {
    #[serde(rename = "type")]
    pub kind: DatabaseKind,
    /// SQLite file or plugin executable.
    pub path: Option<String>,
    /// PostgreSQL connection URI.
    pub uri: Option<String>,
    /// Maximum pool connections.
    pub pool_size: Option<u32>,
    /// Plugin arguments.
    pub args: Vec<String>,
}

impl Database {
    /// Where data lives; categories sharing a location share a pool.
    pub fn location(&self) -> String {
        match self.kind {
            DatabaseKind::Memory => String::default(),
            DatabaseKind::Sqlite | DatabaseKind::Plugin => {
                self.path.clone().unwrap_or_default()
            },
            DatabaseKind::Postgres => self.uri.clone().unwrap_or_default(),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Storage {
    pub app_storage: Database,
    pub user_storage: Database,
    pub token_storage: Database,
    pub token_blacklist: Database,
    pub verification_code_storage: Database,
    /// Per-call timeout for remote backends, in seconds.
    pub timeout: u64,
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            app_storage: Database::default(),
            user_storage: Database::default(),
            token_storage: Database::default(),
            token_blacklist: Database::default(),
            verification_code_storage: Database::default(),
            timeout: 30,
        }
    }
}

impl Storage {
    /// Settings of a given category.
    pub fn get(&self, category: Category) -> &Database {
        match category {
            Category::App => &self.app_storage,
            Category::User => &self.user_storage,
            Category::Token => &self.token_storage,
            Category::TokenBlacklist => &self.token_blacklist,
            Category::VerificationCode => &self.verification_code_storage,
        }
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout.max(1))
    }
}

/// Administrator account configuration.
///
/// Only names of environment variables are stored here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminAccount {
    pub login_env_name: String,
    pub password_env_name: String,
}

impl Default for AdminAccount {
    fn default() -> Self {
        Self {
            login_env_name: "VOUCH_ADMIN_LOGIN".into(),
            password_env_name: "VOUCH_ADMIN_PASSWORD".into(),
        }
    }
}

/// Resolved administrator credentials.
#[derive(Debug, Clone, PartialEq)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

impl AdminAccount {
    /// Read credentials from environment, falling back on defaults.
    pub fn credentials(&self) -> Credentials {
        let login = std::env::var(&self.login_env_name).unwrap_or_else(|_| {
            tracing::warn!(
                env = self.login_env_name,
                "admin login not set, using default"
            );
            DEFAULT_ADMIN_LOGIN.to_owned()
        });
        let password =
            std::env::var(&self.password_env_name).unwrap_or_else(|_| {
                tracing::warn!(
                    env = self.password_env_name,
                    "admin password not set, using default"
                );
                DEFAULT_ADMIN_PASSWORD.to_owned()
            });

        Credentials { login, password }
    }
}

/// Bulk import done when storages are empty.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Import {
    pub apps: Option<PathBuf>,
    pub users: Option<PathBuf>,
}

impl FromRef<AppState> for Arc<Configuration> {
    fn from_ref(state: &AppState) -> Arc<Configuration> {
        Arc::clone(&state.config)
    }
}

impl Configuration {
    pub fn path(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }

    /// Normalizes a URL string by ensuring it starts with a valid scheme
    /// (`http` or `https`).
    fn normalize_url(&self, url: &str) -> std::result::Result<String, url::ParseError> {
        let url_with_scheme =
            if url.starts_with("http://") || url.starts_with("https://") {
                url.to_string()
            } else {
                format!("https://{url}")
            };

        let parsed_url = Url::parse(&url_with_scheme)?;
        Ok(parsed_url.to_string())
    }

    /// Reads the `config.yaml` file from the specified path or the default
    /// location.
    ///
    /// A missing file falls back on the default configuration, a malformed
    /// one is an error.
    pub fn read(self) -> Result<Arc<Self>> {
        let file_path = if self.path.is_file() {
            &self.path
        } else {
            &Path::new(DEFAULT_CONFIG_PATH).to_path_buf()
        };

        match File::open(file_path) {
            Ok(file) => {
                let mut config: Configuration = serde_yaml::from_reader(file)
                    .map_err(|err| ServerError::Config(err.to_string()))?;

                // set app version.
                config.version = VERSION.to_owned();
                config.path = file_path.clone();

                // normalize URLs.
                if !config.url.is_empty() {
                    config.url = self
                        .normalize_url(&config.url)
                        .map_err(|err| ServerError::Config(err.to_string()))?;
                }

                Ok(Arc::new(config))
            },
            Err(err) => Ok(Arc::new(self.error(err))),
        }
    }

    /// Return a default configuration as fallback.
    fn error(&self, err: impl std::error::Error) -> Self {
        tracing::error!(error = %err, "`config.yaml` file not found");
        Self {
            version: VERSION.to_owned(),
            ..Default::default()
        }
    }
}

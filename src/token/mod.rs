//! Manage json web tokens.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode,
};
use serde::{Deserialize, Serialize};

use crate::config;
use crate::crypto::{KeyFamily, check_key, check_private_key, generate_key_pair};
use crate::error::{Result, ServerError, ToInternal};
use crate::model::{App, User};
use crate::storage::{
    AppStorage, TokenBlacklist, TokenStorage, UserStorage,
    spawn_login_metadata_update,
};

pub const ACCESS_TOKEN_TYPE: &str = "access";
pub const REFRESH_TOKEN_TYPE: &str = "refresh";
const OFFLINE_SCOPE: &str = "offline";

/// Asymmetric algorithms allowed to sign tokens.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    RS256,
    RS384,
    RS512,
    PS256,
    PS384,
    PS512,
    ES256,
    ES384,
}

impl SignatureAlgorithm {
    fn algorithm(&self) -> Algorithm {
        match self {
            SignatureAlgorithm::RS256 => Algorithm::RS256,
            SignatureAlgorithm::RS384 => Algorithm::RS384,
            SignatureAlgorithm::RS512 => Algorithm::RS512,
            SignatureAlgorithm::PS256 => Algorithm::PS256,
            SignatureAlgorithm::PS384 => Algorithm::PS384,
            SignatureAlgorithm::PS512 => Algorithm::PS512,
            SignatureAlgorithm::ES256 => Algorithm::ES256,
            SignatureAlgorithm::ES384 => Algorithm::ES384,
        }
    }

    /// Kind of key pair the algorithm needs.
    pub fn family(&self) -> KeyFamily {
        match self {
            SignatureAlgorithm::ES256 => KeyFamily::P256,
            SignatureAlgorithm::ES384 => KeyFamily::P384,
            _ => KeyFamily::Rsa,
        }
    }
}

impl FromStr for SignatureAlgorithm {
    type Err = ServerError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "RS256" => Ok(SignatureAlgorithm::RS256),
            "RS384" => Ok(SignatureAlgorithm::RS384),
            "RS512" => Ok(SignatureAlgorithm::RS512),
            "PS256" => Ok(SignatureAlgorithm::PS256),
            "PS384" => Ok(SignatureAlgorithm::PS384),
            "PS512" => Ok(SignatureAlgorithm::PS512),
            "ES256" => Ok(SignatureAlgorithm::ES256),
            "ES384" => Ok(SignatureAlgorithm::ES384),
            _ => Err(ServerError::Config(format!(
                "unsupported token signature algorithm {s:?}"
            ))),
        }
    }
}

/// Pieces of information asserted on a JWT.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Identifies the organization that issued the JWT.
    pub iss: String,
    /// User ID.
    pub sub: String,
    /// App ID.
    pub aud: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Identifies the time at which the JWT was issued.
    pub iat: i64,
    /// Identifies the expiration time on or after which the JWT must not be
    /// accepted for processing.
    pub exp: i64,
    /// Unique token identifier, used for revocation.
    pub jti: String,
    /// Either `access` or `refresh`.
    #[serde(rename = "type")]
    pub kind: String,
}

/// A signed token with its decoded claims.
#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    raw: String,
    claims: Claims,
}

impl Token {
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    pub fn user_id(&self) -> &str {
        &self.claims.sub
    }

    pub fn is_refresh(&self) -> bool {
        self.claims.kind == REFRESH_TOKEN_TYPE
    }

    /// Check expiry against current clock.
    pub fn validate(&self) -> Result<()> {
        if self.claims.exp <= chrono::Utc::now().timestamp() {
            return Err(ServerError::Invalid);
        }

        Ok(())
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Issue, parse and revoke tokens.
pub struct TokenService {
    algorithm: SignatureAlgorithm,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    access_token_ttl: i64,
    refresh_token_ttl: i64,
    token_storage: Arc<dyn TokenStorage>,
    blacklist: Arc<dyn TokenBlacklist>,
    app_storage: Arc<dyn AppStorage>,
    user_storage: Arc<dyn UserStorage>,
}

impl TokenService {
    /// Create a new [`TokenService`].
    ///
    /// Fails with [`ServerError::Config`] on unknown algorithm or when keys
    /// do not fit it.
    pub fn new(
        issuer: &str,
        settings: &config::Token,
        token_storage: Arc<dyn TokenStorage>,
        blacklist: Arc<dyn TokenBlacklist>,
        app_storage: Arc<dyn AppStorage>,
        user_storage: Arc<dyn UserStorage>,
    ) -> Result<Self> {
        let algorithm = settings.algorithm.parse::<SignatureAlgorithm>()?;
        let family = algorithm.family();

        let (private_key, public_key) = match settings.pem_pair()? {
            Some(pair) => pair,
            None if settings.generate => {
                tracing::warn!(
                    ?algorithm,
                    "no key configured, generating an ephemeral key pair"
                );
                generate_key_pair(family)?
            },
            None => {
                return Err(ServerError::Config(
                    "missing token signing keys".into(),
                ));
            },
        };

        check_private_key(&private_key, family)?;
        check_key(&public_key, family)?;

        let (encoding_key, decoding_key) = match family {
            KeyFamily::Rsa => (
                EncodingKey::from_rsa_pem(private_key.as_bytes()),
                DecodingKey::from_rsa_pem(public_key.as_bytes()),
            ),
            KeyFamily::P256 | KeyFamily::P384 => (
                EncodingKey::from_ec_pem(private_key.as_bytes()),
                DecodingKey::from_ec_pem(public_key.as_bytes()),
            ),
        };
        let encoding_key =
            encoding_key.map_err(|err| ServerError::Config(err.to_string()))?;
        let decoding_key =
            decoding_key.map_err(|err| ServerError::Config(err.to_string()))?;

        Ok(Self {
            algorithm,
            encoding_key,
            decoding_key,
            issuer: issuer.to_owned(),
            access_token_ttl: settings.access_token_ttl,
            refresh_token_ttl: settings.refresh_token_ttl,
            token_storage,
            blacklist,
            app_storage,
            user_storage,
        })
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    async fn issue(
        &self,
        user: &User,
        scopes: &[String],
        app: &App,
        kind: &str,
        ttl: i64,
    ) -> Result<Token> {
        if !user.active {
            return Err(ServerError::InactiveUser);
        }

        let granted = self.user_storage.request_scopes(&user.id, scopes).await?;
        if let Some(scope) = scopes
            .iter()
            .find(|scope| !granted.contains(*scope) || !app.allows(scope))
        {
            return Err(ServerError::Config(format!(
                "scope {scope:?} cannot be granted"
            )));
        }

        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            iss: self.issuer.clone(),
            sub: user.id.clone(),
            aud: app.id.clone(),
            scopes: scopes.to_vec(),
            iat: now,
            exp: now + ttl,
            jti: uuid::Uuid::new_v4().to_string(),
            kind: kind.to_owned(),
        };

        let header = Header::new(self.algorithm.algorithm());
        let raw = encode(&header, &claims, &self.encoding_key).catch()?;
        metrics::counter!("tokens_issued_total", "type" => kind.to_owned())
            .increment(1);

        Ok(Token { raw, claims })
    }

    /// Issue an access token for `user` on behalf of `app`.
    pub async fn new_token(
        &self,
        user: &User,
        scopes: &[String],
        app: &App,
    ) -> Result<Token> {
        let ttl = if app.token_lifespan > 0 {
            app.token_lifespan
        } else {
            self.access_token_ttl
        };

        self.issue(user, scopes, app, ACCESS_TOKEN_TYPE, ttl).await
    }

    /// Issue and register a refresh token. Requires the `offline` scope.
    pub async fn new_refresh_token(
        &self,
        user: &User,
        scopes: &[String],
        app: &App,
    ) -> Result<Token> {
        if !app.offline || !scopes.iter().any(|scope| scope == OFFLINE_SCOPE) {
            return Err(ServerError::Config(
                "refresh tokens require an offline app and scope".into(),
            ));
        }

        let ttl = if app.refresh_token_lifespan > 0 {
            app.refresh_token_lifespan
        } else {
            self.refresh_token_ttl
        };

        let token = self
            .issue(user, scopes, app, REFRESH_TOKEN_TYPE, ttl)
            .await?;
        self.token_storage
            .save_token(&token.raw, token.claims.exp)
            .await?;

        Ok(token)
    }

    /// Verify signature, issuer, expiry and revocation of `raw`.
    pub async fn parse(&self, raw: &str) -> Result<Token> {
        let mut validation = Validation::new(self.algorithm.algorithm());
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        validation.validate_aud = false;
        validation.leeway = 0;

        let claims = match decode::<Claims>(raw, &self.decoding_key, &validation) {
            Ok(data) => data.claims,
            Err(err) => {
                tracing::debug!(%err, "token rejected");
                return Err(ServerError::Invalid);
            },
        };

        if self.blacklist.is_blacklisted(&claims.jti).await? {
            return Err(ServerError::Revoked);
        }

        Ok(Token {
            raw: raw.to_owned(),
            claims,
        })
    }

    /// Blacklist `token` until it expires.
    pub async fn revoke(&self, token: &Token) -> Result<()> {
        self.blacklist
            .add(&token.claims.jti, token.claims.exp)
            .await?;

        if token.is_refresh() {
            self.token_storage.delete_token(&token.raw).await?;
        }

        tracing::info!(user_id = token.claims.sub, "token revoked");
        Ok(())
    }

    /// Exchange a refresh token against a fresh access token.
    pub async fn refresh_access_token(&self, raw: &str) -> Result<Token> {
        let token = self.parse(raw).await?;
        token.validate()?;

        if !token.is_refresh() || !self.token_storage.has_token(raw).await? {
            return Err(ServerError::Invalid);
        }

        let app = not_found_as_invalid(
            self.app_storage.app_by_id(&token.claims.aud).await,
        )?;
        let user = not_found_as_invalid(
            self.user_storage.user_by_id(&token.claims.sub).await,
        )?;

        self.new_token(&user, &token.claims.scopes, &app).await
    }

    /// Password login. Login metadata is updated in background.
    pub async fn authenticate(
        &self,
        name: &str,
        password: &str,
        scopes: &[String],
        app: &App,
    ) -> Result<Token> {
        let user = self.user_storage.user_by_name_password(name, password).await?;
        if !user.active {
            return Err(ServerError::InactiveUser);
        }

        spawn_login_metadata_update(
            Arc::clone(&self.user_storage),
            user.id.clone(),
        );

        self.new_token(&user, scopes, app).await
    }
}

fn not_found_as_invalid<T>(result: Result<T>) -> Result<T> {
    result.map_err(|err| match err {
        ServerError::NotFound | ServerError::WrongDataFormat(_) => {
            ServerError::Invalid
        },
        err => err,
    })
}

//! Cryptogragic logics.

use std::sync::Arc;

use argon2::password_hash::{
    PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::{Argon2, Params, Version};
use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{
    DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey,
    LineEnding,
};
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::config::Argon2 as ArgonConfig;
use crate::error::ToInternal;

const RSA_KEY_SIZE: usize = 2048;

type Result<T> = std::result::Result<T, CryptoError>;

#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("argon2 error: {0}")]
    Argon2(String),
}

/// Password manager that uses Argon2id and PHC string format for hashing and
/// verification.
pub struct PasswordManager {
    params: Params,
}

impl PasswordManager {
    /// Create a new [`PasswordManager`].
    pub fn new(config: Option<ArgonConfig>) -> Result<Self> {
        let config = config.unwrap_or_default();

        let params = Params::new(
            config.memory_cost,
            config.iterations,
            config.parallelism,
            Some(config.hash_length),
        )
        .map_err(|err| CryptoError::Argon2(err.to_string()))?;

        Ok(Self { params })
    }

    fn argon2(&self) -> Argon2<'_> {
        Argon2::new(
            argon2::Algorithm::Argon2id,
            Version::V0x13,
            self.params.clone(),
        )
    }

    /// Hash password using Argon2id.
    pub fn hash_password(&self, password: impl AsRef<[u8]>) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2()
            .hash_password(password.as_ref(), &salt)
            .map_err(|e| CryptoError::Argon2(e.to_string()))?;

        Ok(hash.to_string())
    }

    /// Verify password against a PHC.
    ///
    /// A malformed PHC string never matches.
    pub fn verify_password(
        &self,
        password: impl AsRef<[u8]>,
        phc_hash: &str,
    ) -> bool {
        let Ok(parsed) = PasswordHash::new(phc_hash) else {
            return false;
        };

        self.argon2()
            .verify_password(password.as_ref(), &parsed)
            .is_ok()
    }

    /// Hash on the blocking pool, Argon2 is CPU bound.
    pub async fn hash(
        self: &Arc<Self>,
        password: String,
    ) -> crate::error::Result<String> {
        let manager = Arc::clone(self);
        Ok(
            tokio::task::spawn_blocking(move || {
                manager.hash_password(password)
            })
            .await
            .catch()??,
        )
    }

    /// Verify on the blocking pool.
    pub async fn verify(
        self: &Arc<Self>,
        password: String,
        phc_hash: String,
    ) -> crate::error::Result<bool> {
        let manager = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            manager.verify_password(password, &phc_hash)
        })
        .await
        .catch()
    }
}

/// Key families usable to sign tokens.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyFamily {
    Rsa,
    P256,
    P384,
}

/// Error related to keys.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error(transparent)]
    Pkcs1(#[from] rsa::pkcs1::Error),
    #[error(transparent)]
    Pkcs8(#[from] rsa::pkcs8::Error),
    #[error(transparent)]
    Spki(#[from] rsa::pkcs8::spki::Error),
    #[error(transparent)]
    Rsa(#[from] rsa::Error),
    #[error("unknown key format")]
    UnknownFormat,
}

/// Check if a public key is well-formatted for `family`.
pub fn check_key(
    key: &str,
    family: KeyFamily,
) -> std::result::Result<(), KeyError> {
    match family {
        KeyFamily::Rsa if key.contains("BEGIN RSA PUBLIC KEY") => {
            // Means it is PKCS#1 and only RSA.
            RsaPublicKey::from_pkcs1_pem(key)?;
        },
        _ if !key.contains("BEGIN PUBLIC KEY") => {
            return Err(KeyError::UnknownFormat);
        },
        KeyFamily::Rsa => {
            RsaPublicKey::from_public_key_pem(key)?;
        },
        KeyFamily::P256 => {
            p256::ecdsa::VerifyingKey::from_public_key_pem(key)?;
        },
        KeyFamily::P384 => {
            p384::ecdsa::VerifyingKey::from_public_key_pem(key)?;
        },
    }

    Ok(())
}

/// Check if a private key is well-formatted for `family`.
pub fn check_private_key(
    key: &str,
    family: KeyFamily,
) -> std::result::Result<(), KeyError> {
    match family {
        KeyFamily::Rsa if key.contains("BEGIN RSA PRIVATE KEY") => {
            RsaPrivateKey::from_pkcs1_pem(key)?;
        },
        _ if !key.contains("BEGIN PRIVATE KEY") => {
            return Err(KeyError::UnknownFormat);
        },
        KeyFamily::Rsa => {
            RsaPrivateKey::from_pkcs8_pem(key)?;
        },
        KeyFamily::P256 => {
            p256::SecretKey::from_pkcs8_pem(key)?;
        },
        KeyFamily::P384 => {
            p384::SecretKey::from_pkcs8_pem(key)?;
        },
    }

    Ok(())
}

/// Generate a PKCS#8 `(private, public)` PEM key pair.
pub fn generate_key_pair(
    family: KeyFamily,
) -> std::result::Result<(String, String), KeyError> {
    match family {
        KeyFamily::Rsa => {
            let private_key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_SIZE)?;
            let public_key = RsaPublicKey::from(&private_key);

            Ok((
                private_key.to_pkcs8_pem(LineEnding::LF)?.to_string(),
                public_key.to_public_key_pem(LineEnding::LF)?,
            ))
        },
        KeyFamily::P256 => {
            let secret = p256::SecretKey::random(&mut OsRng);

            Ok((
                secret.to_pkcs8_pem(LineEnding::LF)?.to_string(),
                secret.public_key().to_public_key_pem(LineEnding::LF)?,
            ))
        },
        KeyFamily::P384 => {
            let secret = p384::SecretKey::random(&mut OsRng);

            Ok((
                secret.to_pkcs8_pem(LineEnding::LF)?.to_string(),
                secret.public_key().to_public_key_pem(LineEnding::LF)?,
            ))
        },
    }
}

/// Cheap Argon2 parameters, tests only.
#[cfg(test)]
pub(crate) fn test_password_manager() -> Arc<PasswordManager> {
    Arc::new(
        PasswordManager::new(Some(ArgonConfig {
            memory_cost: 64,
            iterations: 1,
            parallelism: 1,
            hash_length: 32,
        }))
        .unwrap(),
    )
}

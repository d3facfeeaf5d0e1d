//! Reference user storage plugin.
//!
//! Serves users kept in memory, or in the SQLite file given as first
//! argument. Started by vouch when `user_storage.type` is `plugin`.

use std::sync::Arc;

use vouch::crypto::PasswordManager;
use vouch::plugin;
use vouch::storage::UserStorage;
use vouch::storage::memory::MemoryUserStorage;
use vouch::storage::sqlite::{self, SqliteUserStorage};
use vouch::telemetry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    plugin::check_magic_cookie()?;
    // stdout is reserved for the protocol.
    let _otlp = telemetry::setup_tracing(std::io::stderr);

    let passwords = Arc::new(PasswordManager::new(None)?);
    let storage: Arc<dyn UserStorage> = match std::env::args().nth(1) {
        Some(path) => {
            let pool = sqlite::connect(&path, None).await?;
            tracing::info!(path, "serving sqlite users");
            Arc::new(SqliteUserStorage::new(pool, passwords))
        },
        None => {
            tracing::info!("serving in-memory users");
            Arc::new(MemoryUserStorage::new(passwords))
        },
    };

    plugin::serve(storage).await?;
    Ok(())
}

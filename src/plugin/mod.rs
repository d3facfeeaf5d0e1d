//! User storage living in an external process.
//!
//! The host spawns the plugin executable with a magic cookie in its
//! environment. The plugin answers with a handshake line
//! `<version>|<protocol>|<services>` on stdout, then serves newline
//! delimited JSON-RPC 2.0 requests read from stdin.

mod client;
pub mod protocol;
mod server;

use crate::error::{Result, ServerError};

pub use client::PluginClient;
pub use server::{serve, serve_with};

pub const PROTOCOL_VERSION: u32 = 1;
pub const PROTOCOL: &str = "jsonrpc";
pub const USER_STORAGE_SERVICE: &str = "user_storage";

pub const MAGIC_COOKIE_KEY: &str = "VOUCH_PLUGIN_MAGIC_COOKIE";
pub const MAGIC_COOKIE_VALUE: &str =
    "5b1a0c7e9f4d43a8b2e6d0f1c3a5e7b9d2f4a6c8e0b1d3f5a7c9e1b3d5f7a9c1";

/// First line written by a plugin.
pub fn handshake_line(services: &[&str]) -> String {
    format!("{PROTOCOL_VERSION}|{PROTOCOL}|{}", services.join(","))
}

/// Parse a handshake line, returning advertised services.
pub fn parse_handshake(line: &str) -> Result<Vec<String>> {
    let mut parts = line.trim().splitn(3, '|');
    let (Some(version), Some(protocol), Some(services)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return Err(ServerError::Config(format!(
            "malformed plugin handshake {line:?}"
        )));
    };

    if version.parse::<u32>().ok() != Some(PROTOCOL_VERSION) {
        return Err(ServerError::Config(format!(
            "unsupported plugin protocol version {version:?}, \
             expected {PROTOCOL_VERSION}"
        )));
    }
    if protocol != PROTOCOL {
        return Err(ServerError::Config(format!(
            "unsupported plugin protocol {protocol:?}"
        )));
    }

    Ok(services
        .split(',')
        .map(str::trim)
        .filter(|service| !service.is_empty())
        .map(str::to_owned)
        .collect())
}

/// Refuse to run when not started by a host.
pub fn check_magic_cookie() -> Result<()> {
    match std::env::var(MAGIC_COOKIE_KEY) {
        Ok(value) if value == MAGIC_COOKIE_VALUE => Ok(()),
        _ => Err(ServerError::Config(
            "this binary is a plugin and is not meant to be executed directly"
                .into(),
        )),
    }
}

//! In-process storages. Data does not survive a restart.

mod app;
mod token;
mod user;
mod verification;

pub use app::MemoryAppStorage;
pub use token::{MemoryTokenBlacklist, MemoryTokenStorage};
pub use user::MemoryUserStorage;
pub use verification::MemoryVerificationCodeStorage;

//! Entities shared by storages, the token service and the HTTP layer.

mod app;
mod user;
mod verification;

pub use app::*;
pub use user::*;
pub use verification::*;

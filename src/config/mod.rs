//! Configuration

pub(crate) mod defaults;
pub mod hot_reload;
mod load;
pub mod types;

pub use hot_reload::{ReloadCoordinator, resolve_tenants, spawn_reload_listener};
pub use types::*;

//! SFX Plugin Host Library
//!
//! This library provides the versioned plugin host: plugin archives with their own
//! class loaders, a plugin manager keeping the latest version of each plugin active, an
//! endpoint-keyed event bus, and the admin REST API.

pub mod api;
pub mod core;
pub mod plugin;

// Re-export commonly used types
pub use api::ApiServer;
pub use crate::core::{Config, EventBus, SfxError};
pub use plugin::{HostClassRegistry, PluginArchive, PluginManager, RegisteredPlugin};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

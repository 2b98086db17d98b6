//! Plugin system module
//!
//! This module provides the plugin system implementation including:
//! - Plugin archives and their dedicated unpack directories
//! - Per-plugin class loaders over the unpacked package
//! - Service instantiation (native libraries, host factories, declared classes)
//! - Registered plugin lifecycle
//! - Plugin manager for discovery, version resolution and hot install/uninstall

pub mod archive;
pub mod class_loader;
pub mod host;
pub mod manager;
pub mod native;
pub mod package;
pub mod registered;
pub mod service;
pub mod types;

#[cfg(test)]
pub mod testing;

pub use archive::{PluginArchive, UnpackReport, UnpackState};
pub use class_loader::{ClassOrigin, LoadedClass, PluginClassLoader};
pub use host::HostClassRegistry;
pub use manager::{Diagnostic, PluginManager, LIFECYCLE_ENDPOINT};
pub use native::NativeService;
pub use package::{ClassDescriptor, ClassKind, PluginPackage};
pub use registered::{PluginInfo, RegisteredPlugin};
pub use service::{DeclaredService, Service, ServiceContext, ServiceFactory};
pub use types::{PluginId, PluginManifest, PluginState, PluginStateEvent, PluginType, PluginVersion};

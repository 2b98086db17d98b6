//! Host class registry
//!
//! Classes, interfaces and resources provided by the host application. Every plugin
//! class loader falls back to this registry, never the other way round.

use crate::plugin::class_loader::{ClassOrigin, LoadedClass};
use crate::plugin::package::{ClassDescriptor, ClassKind};
use crate::plugin::service::ServiceFactory;
use crate::plugin::types::{PluginType, PLUGIN_INTERFACE};
use std::collections::HashMap;
use std::sync::Arc;

/// Abstract base class plugin classes usually extend
pub const ABSTRACT_PLUGIN_CLASS: &str = "sfx.plugin.AbstractPlugin";

#[derive(Default)]
pub struct HostClassRegistry {
    classes: HashMap<String, Arc<LoadedClass>>,
    resources: HashMap<String, Vec<u8>>,
    factories: HashMap<String, ServiceFactory>,
}

impl HostClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the plugin base interface, the capability interface of every
    /// plugin type and the abstract plugin base class
    pub fn with_standard_interfaces() -> Self {
        let mut registry = Self::new();
        registry.register_interface(PLUGIN_INTERFACE, &[]);
        for plugin_type in PluginType::ALL {
            let interface = plugin_type.interface();
            if interface != PLUGIN_INTERFACE {
                registry.register_interface(interface, &[PLUGIN_INTERFACE]);
            }
        }
        registry.register_class(ClassDescriptor {
            name: ABSTRACT_PLUGIN_CLASS.to_string(),
            kind: ClassKind::Class,
            extends: None,
            implements: vec![PLUGIN_INTERFACE.to_string()],
            library: None,
            properties: serde_json::Map::new(),
        });
        registry
    }

    pub fn register_interface(&mut self, name: &str, extends: &[&str]) -> Arc<LoadedClass> {
        self.register_class(ClassDescriptor {
            name: name.to_string(),
            kind: ClassKind::Interface,
            extends: None,
            implements: extends.iter().map(|s| s.to_string()).collect(),
            library: None,
            properties: serde_json::Map::new(),
        })
    }

    /// Register a host class, replacing one of the same name
    pub fn register_class(&mut self, descriptor: ClassDescriptor) -> Arc<LoadedClass> {
        let class = Arc::new(LoadedClass::new(ClassOrigin::Host, descriptor));
        self.classes.insert(class.name().to_string(), class.clone());
        class
    }

    pub fn register_resource(&mut self, path: &str, bytes: Vec<u8>) {
        self.resources.insert(path.trim_start_matches('/').to_string(), bytes);
    }

    /// Instantiate plugin classes extending or implementing `class` through `factory`
    pub fn register_factory(&mut self, class: &str, factory: ServiceFactory) {
        self.factories.insert(class.to_string(), factory);
    }

    pub fn class(&self, name: &str) -> Option<Arc<LoadedClass>> {
        self.classes.get(name).cloned()
    }

    pub fn resource(&self, path: &str) -> Option<Vec<u8>> {
        self.resources.get(path.trim_start_matches('/')).cloned()
    }

    pub fn factory(&self, class: &str) -> Option<ServiceFactory> {
        self.factories.get(class).cloned()
    }

    pub fn class_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.classes.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for HostClassRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostClassRegistry")
            .field("classes", &self.class_names())
            .field("resources", &self.resources.len())
            .field("factories", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

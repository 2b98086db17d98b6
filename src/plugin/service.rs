//! Plugin service instances
//!
//! A service is a live instance of a plugin class. Which implementation backs it depends
//! on the class:
//!
//! 1. a plugin class naming a native `library` is driven through that library
//! 2. a class deriving from a host class with a registered factory is built by the factory
//! 3. anything else becomes a [`DeclaredService`] answering from its descriptor

use crate::core::error::{Result, SfxError};
use crate::plugin::class_loader::{ClassOrigin, LoadedClass, PluginClassLoader};
use crate::plugin::native::NativeService;
use async_trait::async_trait;
use serde_json::Value;
use std::any::Any;
use std::sync::Arc;

#[async_trait]
pub trait Service: Send + Sync {
    /// Class this service is an instance of
    fn class(&self) -> &Arc<LoadedClass>;

    async fn invoke(&self, method: &str, params: Value) -> Result<Value>;

    /// Release whatever the instance holds; called before its class loader closes
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any;
}

/// What a host factory gets to build a service from
pub struct ServiceContext<'a> {
    /// Class being instantiated
    pub class: &'a Arc<LoadedClass>,
    /// Host class the factory was registered for
    pub factory_class: &'a Arc<LoadedClass>,
    pub loader: &'a PluginClassLoader,
}

pub type ServiceFactory = Arc<dyn Fn(&ServiceContext<'_>) -> Result<Arc<dyn Service>> + Send + Sync>;

/// Create an instance of `class_name` as resolved by `loader`
pub fn instantiate(loader: &PluginClassLoader, class_name: &str) -> Result<Arc<dyn Service>> {
    let class = loader.load_class(class_name)?;
    if class.is_interface() {
        return Err(SfxError::PluginLoadError(format!(
            "Cannot instantiate interface {}",
            class_name
        )));
    }

    if let (ClassOrigin::Plugin(_), Some(library)) = (class.origin(), class.descriptor().library.as_deref()) {
        let service = NativeService::load(loader, class.clone(), library)?;
        return Ok(Arc::new(service));
    }

    for ancestor in loader.hierarchy(&class)? {
        if ancestor.origin() != &ClassOrigin::Host {
            continue;
        }
        if let Some(factory) = loader.host().factory(ancestor.name()) {
            tracing::debug!(class = class_name, factory = ancestor.name(), "Instantiating through host factory");
            let context = ServiceContext {
                class: &class,
                factory_class: &ancestor,
                loader,
            };
            return factory(&context);
        }
    }

    Ok(Arc::new(DeclaredService::new(class)))
}

/// Service with no code behind it
///
/// `describe` returns the class descriptor; every other method fails.
pub struct DeclaredService {
    class: Arc<LoadedClass>,
}

impl DeclaredService {
    pub fn new(class: Arc<LoadedClass>) -> Self {
        Self { class }
    }
}

#[async_trait]
impl Service for DeclaredService {
    fn class(&self) -> &Arc<LoadedClass> {
        &self.class
    }

    async fn invoke(&self, method: &str, _params: Value) -> Result<Value> {
        match method {
            "describe" => serde_json::to_value(self.class.descriptor())
                .map_err(|e| SfxError::SerializationError(e.to_string())),
            other => Err(SfxError::PluginExecutionError(format!(
                "{} does not implement {}",
                self.class.name(),
                other
            ))),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

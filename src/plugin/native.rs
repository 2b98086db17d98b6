//! Native plugin services
//!
//! A plugin class naming a `library` is backed by a dynamic library (.so, .dll or
//! .dylib) shipped in the plugin. The library exports the plugin call interface:
//!
//! ```c
//! int plugin_invoke(const char* method, const char* params, char** result);
//! void plugin_free(char* result); /* optional, falls back to free() */
//! ```
//!
//! `params` and `*result` are JSON documents; a non-zero return code is a failure.

use crate::core::error::{Result, SfxError};
use crate::plugin::class_loader::{LoadedClass, PluginClassLoader};
use crate::plugin::service::Service;
use async_trait::async_trait;
use libloading::{Library, Symbol};
use serde_json::Value;
use std::any::Any;
use std::ffi::{CStr, CString};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

type InvokeFn = unsafe extern "C" fn(*const u8, *const u8, *mut *mut u8) -> i32;
type FreeFn = unsafe extern "C" fn(*mut u8);

const INVOKE_SYMBOL: &[u8] = b"plugin_invoke";
const FREE_SYMBOL: &[u8] = b"plugin_free";

pub struct NativeService {
    class: Arc<LoadedClass>,
    loader_id: Uuid,
    library: RwLock<Option<Arc<Library>>>,
}

impl NativeService {
    /// Load `library` through the plugin's class loader and check it exports
    /// `plugin_invoke`
    pub fn load(loader: &PluginClassLoader, class: Arc<LoadedClass>, library: &str) -> Result<Self> {
        let handle = loader.load_native_library(library)?;

        let exported = unsafe { handle.get::<InvokeFn>(INVOKE_SYMBOL).is_ok() };
        if !exported {
            return Err(SfxError::PluginLoadError(format!(
                "Library {} of class {} does not export plugin_invoke",
                library,
                class.name()
            )));
        }

        tracing::info!(class = class.name(), library, "Native service loaded");

        Ok(Self {
            class,
            loader_id: loader.id(),
            library: RwLock::new(Some(handle)),
        })
    }

    fn handle(&self) -> Result<Arc<Library>> {
        self.library
            .read()
            .map_err(|e| SfxError::PluginExecutionError(format!("Failed to acquire read lock: {}", e)))?
            .clone()
            .ok_or_else(|| SfxError::PluginExecutionError(format!("{} has been shut down", self.class.name())))
    }
}

#[async_trait]
impl Service for NativeService {
    fn class(&self) -> &Arc<LoadedClass> {
        &self.class
    }

    async fn invoke(&self, method: &str, params: Value) -> Result<Value> {
        let library = self.handle()?;
        let class = self.class.name().to_string();

        let params = serde_json::to_string(&params)
            .map_err(|e| SfxError::PluginExecutionError(format!("Failed to serialize arguments: {}", e)))?;
        let method_cstr = CString::new(method)
            .map_err(|e| SfxError::PluginExecutionError(format!("Invalid function name: {}", e)))?;
        let params_cstr = CString::new(params)
            .map_err(|e| SfxError::PluginExecutionError(format!("Invalid parameters: {}", e)))?;

        // Native calls block; keep them off the async workers
        tokio::task::spawn_blocking(move || call(&library, &class, method_cstr, params_cstr))
            .await
            .map_err(|e| SfxError::PluginExecutionError(format!("Task join error: {}", e)))?
    }

    async fn shutdown(&self) -> Result<()> {
        if let Ok(mut library) = self.library.write() {
            library.take();
        }
        tracing::debug!(class = self.class.name(), loader_id = %self.loader_id, "Native service shut down");
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn call(library: &Library, class: &str, method: CString, params: CString) -> Result<Value> {
    let invoke: Symbol<InvokeFn> = unsafe {
        library.get(INVOKE_SYMBOL).map_err(|e| {
            SfxError::PluginExecutionError(format!("Symbol 'plugin_invoke' not found for {}: {}", class, e))
        })?
    };

    let mut result_ptr: *mut u8 = std::ptr::null_mut();

    let return_code = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| unsafe {
        invoke(
            method.as_ptr() as *const u8,
            params.as_ptr() as *const u8,
            &mut result_ptr as *mut *mut u8,
        )
    }));

    let return_code = match return_code {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(class, "Native plugin panicked during execution: {:?}", e);
            return Err(SfxError::PluginExecutionError(
                "Native plugin panicked during execution".to_string(),
            ));
        }
    };

    if return_code != 0 {
        tracing::warn!(class, return_code, "Native plugin returned error code");
        release(library, result_ptr);
        return Err(SfxError::PluginExecutionError(format!(
            "Plugin function returned error code: {}",
            return_code
        )));
    }

    if result_ptr.is_null() {
        return Err(SfxError::PluginExecutionError(
            "Plugin function returned null result".to_string(),
        ));
    }

    let parsed = {
        let cstr = unsafe { CStr::from_ptr(result_ptr as *const std::os::raw::c_char) };
        cstr.to_str()
            .map_err(|e| SfxError::PluginExecutionError(format!("Invalid UTF-8 in result: {}", e)))
            .and_then(|text| {
                serde_json::from_str(text)
                    .map_err(|e| SfxError::PluginExecutionError(format!("Failed to parse result JSON: {}", e)))
            })
    };

    release(library, result_ptr);
    parsed
}

/// Free a result with the library's own allocator when it exports `plugin_free`
fn release(library: &Library, result_ptr: *mut u8) {
    if result_ptr.is_null() {
        return;
    }

    unsafe {
        match library.get::<FreeFn>(FREE_SYMBOL) {
            Ok(free_fn) => free_fn(result_ptr),
            Err(_) => libc::free(result_ptr as *mut libc::c_void),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::archive::PluginArchive;
    use crate::plugin::host::HostClassRegistry;
    use crate::plugin::service::instantiate;
    use crate::plugin::testing::{ArchiveBuilder, PackageBuilder};
    use tempfile::TempDir;

    #[test]
    fn test_library_that_is_not_a_library() {
        let dir = TempDir::new().unwrap();
        let path = ArchiveBuilder::new(
            "native",
            PackageBuilder::new("Native", "1.0")
                .attribute("Plugin-Class", "com.acme.Native")
                .class("com.acme.Native", "library = \"lib/libnative.so\"\n")
                .resource("lib/libnative.so", b"this is not an ELF file"),
        )
        .write_to(dir.path());

        let root = dir.path().join("unpacked");
        let archive = PluginArchive::open(path).unwrap();
        archive.unpack(&root).unwrap();
        let loader =
            PluginClassLoader::new(&archive, &root, Arc::new(HostClassRegistry::with_standard_interfaces()))
                .unwrap();

        let result = instantiate(&loader, "com.acme.Native");
        assert!(matches!(result, Err(SfxError::PluginLoadError(_))));
        assert!(loader.dir().join(".native/lib/libnative.so").is_file());
    }
}

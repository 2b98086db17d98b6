//! Per-plugin class loader
//!
//! Each loader owns an open handle on one unpacked plugin package plus the native
//! libraries loaded out of it. Lookups consult the plugin first and the host registry
//! second. Classes carry the identity of the loader that defined them, so two plugins
//! shipping a class of the same name never share it.

use crate::core::error::{ErrorContext, Result, SfxError};
use crate::plugin::archive::PluginArchive;
use crate::plugin::host::HostClassRegistry;
use crate::plugin::package::{self, ClassDescriptor, ClassKind, PluginPackage};
use libloading::Library;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;
use zip::ZipArchive;

/// Directory under the unpacked plugin receiving native libraries taken out of the package
const NATIVE_DIR: &str = ".native";

/// Who defined a class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClassOrigin {
    Host,
    /// Defined by the plugin class loader with this id
    Plugin(Uuid),
}

/// A class resolved by a loader; identity is `(origin, name)`
#[derive(Debug)]
pub struct LoadedClass {
    origin: ClassOrigin,
    descriptor: ClassDescriptor,
}

impl LoadedClass {
    pub fn new(origin: ClassOrigin, descriptor: ClassDescriptor) -> Self {
        Self { origin, descriptor }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn origin(&self) -> &ClassOrigin {
        &self.origin
    }

    pub fn descriptor(&self) -> &ClassDescriptor {
        &self.descriptor
    }

    pub fn is_interface(&self) -> bool {
        self.descriptor.kind == ClassKind::Interface
    }

    /// Same defining loader and same name
    pub fn same_class(&self, other: &LoadedClass) -> bool {
        self.origin == other.origin && self.descriptor.name == other.descriptor.name
    }
}

struct LoaderState {
    package: ZipArchive<File>,
    index: PluginPackage,
    classes: HashMap<String, Arc<LoadedClass>>,
    libraries: HashMap<String, Arc<Library>>,
}

pub struct PluginClassLoader {
    id: Uuid,
    plugin: String,
    dir: PathBuf,
    host: Arc<HostClassRegistry>,
    state: Mutex<Option<LoaderState>>,
}

impl PluginClassLoader {
    /// Open the package of an archive unpacked under `root`
    ///
    /// Fails with [`SfxError::NotUnpacked`] when the archive has not been unpacked there.
    pub fn new(archive: &PluginArchive, root: &Path, host: Arc<HostClassRegistry>) -> Result<Self> {
        if !archive.is_unpacked(root) {
            return Err(SfxError::NotUnpacked(archive.file().display().to_string()));
        }

        let dir = archive.unpack_dir(root)?;
        let package_path = archive.unpacked_package(root)?;
        let file = File::open(&package_path).with_context(|| format!("Failed to open {}", package_path.display()))?;
        let mut package = ZipArchive::new(file).context("Failed to open plugin package")?;
        let index = PluginPackage::read(&mut package)?;

        let id = Uuid::new_v4();
        let classes = index
            .classes()
            .values()
            .map(|descriptor| {
                let class = LoadedClass::new(ClassOrigin::Plugin(id), descriptor.clone());
                (descriptor.name.clone(), Arc::new(class))
            })
            .collect::<HashMap<_, _>>();

        let plugin = index.manifest().id();
        info!(
            plugin = %plugin,
            loader_id = %id,
            classes = classes.len(),
            "Class loader created"
        );

        Ok(Self {
            id,
            plugin,
            dir,
            host,
            state: Mutex::new(Some(LoaderState {
                package,
                index,
                classes,
                libraries: HashMap::new(),
            })),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Unpacked directory this loader reads from
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn host(&self) -> &Arc<HostClassRegistry> {
        &self.host
    }

    /// Resolve a class: plugin-local first, then the host
    pub fn load_class(&self, name: &str) -> Result<Arc<LoadedClass>> {
        let guard = self.lock()?;
        let state = self.open_state(&guard)?;

        if let Some(class) = state.classes.get(name) {
            return Ok(class.clone());
        }
        drop(guard);

        self.host
            .class(name)
            .ok_or_else(|| SfxError::ClassNotFound(name.to_string()))
    }

    /// `class` followed by everything it extends or implements, transitively, each
    /// name resolved through this loader
    pub fn hierarchy(&self, class: &Arc<LoadedClass>) -> Result<Vec<Arc<LoadedClass>>> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([class.clone()]);
        let mut hierarchy = Vec::new();

        while let Some(current) = queue.pop_front() {
            if !seen.insert((*current.origin(), current.name().to_string())) {
                continue;
            }
            for supertype in current.descriptor().supertypes() {
                queue.push_back(self.load_class(supertype)?);
            }
            hierarchy.push(current);
        }

        Ok(hierarchy)
    }

    /// Look a resource up in the package, then the unpacked directory, then the host
    pub fn get_resource(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let path = path.trim_start_matches('/');
        let mut guard = self.lock()?;
        let state = self.open_state_mut(&mut guard)?;

        if let Some(bytes) = package::read_entry(&mut state.package, path)? {
            return Ok(Some(bytes));
        }
        drop(guard);

        if let Some(relative) = contained(path) {
            let candidate = self.dir.join(relative);
            if candidate.is_file() {
                return Ok(Some(fs::read(candidate)?));
            }
        }

        Ok(self.host.resource(path))
    }

    /// Interface name to implementing class name, from the services directory
    pub fn services(&self) -> Result<BTreeMap<String, String>> {
        let guard = self.lock()?;
        Ok(self.open_state(&guard)?.index.services().clone())
    }

    /// Class instantiated when the plugin starts
    pub fn activation_class(&self) -> Result<Option<String>> {
        let guard = self.lock()?;
        Ok(self
            .open_state(&guard)?
            .index
            .activation_class()
            .map(str::to_string))
    }

    /// Load a native library shipped in the plugin
    ///
    /// `path` names a package entry or a file beside the package in the unpacked
    /// directory. Package entries are copied out first since shared objects can only be
    /// mapped from disk. The loader keeps the library until it is closed.
    pub fn load_native_library(&self, path: &str) -> Result<Arc<Library>> {
        let path = path.trim_start_matches('/');
        let relative = contained(path)
            .ok_or_else(|| SfxError::PluginLoadError(format!("Invalid library path: {}", path)))?;

        let mut guard = self.lock()?;
        let state = self.open_state_mut(&mut guard)?;

        if let Some(library) = state.libraries.get(path) {
            return Ok(library.clone());
        }

        let target = match package::read_entry(&mut state.package, path)? {
            Some(bytes) => {
                let target = self.dir.join(NATIVE_DIR).join(&relative);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&target, bytes)?;
                target
            }
            None => {
                let beside = self.dir.join(&relative);
                if !beside.is_file() {
                    return Err(SfxError::PluginLoadError(format!(
                        "Library not found in plugin {}: {}",
                        self.plugin, path
                    )));
                }
                beside
            }
        };

        let library = unsafe {
            Library::new(&target).map_err(|e| {
                SfxError::PluginLoadError(format!("Failed to load library {:?}: {}", target, e))
            })?
        };
        let library = Arc::new(library);
        state.libraries.insert(path.to_string(), library.clone());

        info!(plugin = %self.plugin, path = ?target, "Native library loaded");
        Ok(library)
    }

    /// Release the package handle and native libraries
    ///
    /// Every later lookup fails with [`SfxError::PluginLoadError`]. Closing twice is fine.
    pub fn close(&self) {
        let released = match self.state.lock() {
            Ok(mut state) => state.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(state) = released {
            debug!(
                plugin = %self.plugin,
                loader_id = %self.id,
                libraries = state.libraries.len(),
                "Class loader closed"
            );
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().map(|state| state.is_none()).unwrap_or(true)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<LoaderState>>> {
        self.state
            .lock()
            .map_err(|e| SfxError::PluginLoadError(format!("Failed to acquire class loader lock: {}", e)))
    }

    fn open_state<'a>(&self, guard: &'a MutexGuard<'_, Option<LoaderState>>) -> Result<&'a LoaderState> {
        guard.as_ref().ok_or_else(|| self.closed_error())
    }

    fn open_state_mut<'a>(
        &self,
        guard: &'a mut MutexGuard<'_, Option<LoaderState>>,
    ) -> Result<&'a mut LoaderState> {
        guard.as_mut().ok_or_else(|| self.closed_error())
    }

    fn closed_error(&self) -> SfxError {
        SfxError::PluginLoadError(format!("Class loader of {} is closed", self.plugin))
    }
}

impl std::fmt::Debug for PluginClassLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginClassLoader")
            .field("id", &self.id)
            .field("plugin", &self.plugin)
            .field("dir", &self.dir)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// `path` as a relative path that stays inside its base directory
fn contained(path: &str) -> Option<PathBuf> {
    let path = Path::new(path);
    let normal = path
        .components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
    if normal && path.components().next().is_some() {
        Some(path.to_path_buf())
    } else {
        None
    }
}

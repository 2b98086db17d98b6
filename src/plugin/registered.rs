//! Registered plugin
//!
//! Runtime handle of one archive known to the manager: identity, lifecycle state, the
//! class loader while started and the service instances it exports.

use crate::core::error::{Result, SfxError};
use crate::plugin::archive::{PluginArchive, UnpackReport};
use crate::plugin::class_loader::PluginClassLoader;
use crate::plugin::host::HostClassRegistry;
use crate::plugin::service::{self, Service};
use crate::plugin::types::{PluginId, PluginManifest, PluginState, PluginType, PluginVersion};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

struct Runtime {
    state: PluginState,
    loader: Option<Arc<PluginClassLoader>>,
    primary: Option<Arc<dyn Service>>,
    exported: BTreeMap<String, Arc<dyn Service>>,
    last_error: Option<String>,
}

/// Serializable view of a registered plugin
#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    pub id: PluginId,
    pub name: String,
    pub version: String,
    pub description: String,
    pub plugin_type: PluginType,
    pub icon_name: Option<String>,
    pub file: PathBuf,
    pub state: PluginState,
    pub install_seq: u64,
    pub services: Vec<String>,
    pub last_error: Option<String>,
}

pub struct RegisteredPlugin {
    archive: PluginArchive,
    manifest: PluginManifest,
    install_seq: u64,
    runtime: RwLock<Runtime>,
}

impl RegisteredPlugin {
    /// Wrap an archive, reading its manifest once
    ///
    /// `install_seq` records arrival order and breaks ties between archives declaring
    /// the same version.
    pub fn new(archive: PluginArchive, install_seq: u64) -> Result<Self> {
        let manifest = archive.metadata()?.clone();
        Ok(Self {
            archive,
            manifest,
            install_seq,
            runtime: RwLock::new(Runtime {
                state: PluginState::Installed,
                loader: None,
                primary: None,
                exported: BTreeMap::new(),
                last_error: None,
            }),
        })
    }

    pub fn id(&self) -> PluginId {
        self.manifest.id()
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn version(&self) -> &PluginVersion {
        &self.manifest.version
    }

    pub fn description(&self) -> &str {
        &self.manifest.description
    }

    pub fn plugin_type(&self) -> PluginType {
        self.manifest.plugin_type
    }

    pub fn icon_name(&self) -> Option<&str> {
        self.manifest.icon_name.as_deref()
    }

    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    pub fn archive(&self) -> &PluginArchive {
        &self.archive
    }

    pub fn file(&self) -> &Path {
        self.archive.file()
    }

    pub fn install_seq(&self) -> u64 {
        self.install_seq
    }

    pub fn state(&self) -> PluginState {
        self.read().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == PluginState::Active
    }

    pub fn last_error(&self) -> Option<String> {
        self.read().last_error.clone()
    }

    /// Make sure the archive is unpacked under `root`
    pub fn install(&self, root: &Path) -> Result<UnpackReport> {
        self.archive.unpack(root)
    }

    /// Create the class loader and instantiate the activation class plus one service per
    /// services file
    ///
    /// The plugin only becomes active when every instance was created. On failure the
    /// loader is closed again and the plugin is left [`PluginState::Failed`].
    pub fn start(&self, root: &Path, host: Arc<HostClassRegistry>) -> Result<()> {
        if self.is_active() {
            return Ok(());
        }

        let loader = Arc::new(PluginClassLoader::new(&self.archive, root, host)?);

        match self.instantiate_all(&loader) {
            Ok((primary, exported)) => {
                let mut runtime = self.write();
                runtime.state = PluginState::Active;
                runtime.loader = Some(loader);
                runtime.primary = Some(primary);
                runtime.exported = exported;
                runtime.last_error = None;
                drop(runtime);

                info!(plugin_id = %self.id(), "Plugin started");
                Ok(())
            }
            Err(e) => {
                loader.close();
                self.mark_failed(&e);
                warn!(plugin_id = %self.id(), error = %e, "Plugin failed to start");
                Err(e)
            }
        }
    }

    fn instantiate_all(
        &self,
        loader: &PluginClassLoader,
    ) -> Result<(Arc<dyn Service>, BTreeMap<String, Arc<dyn Service>>)> {
        let activation = loader.activation_class()?.ok_or_else(|| {
            SfxError::PluginLoadError(format!("{} declares no activation class", self.id()))
        })?;

        let primary = service::instantiate(loader, &activation)?;
        let mut exported = BTreeMap::new();
        for (interface, class) in loader.services()? {
            let instance = if class == activation {
                primary.clone()
            } else {
                service::instantiate(loader, &class)?
            };
            exported.insert(interface, instance);
        }

        debug!(
            plugin_id = %self.id(),
            activation = %activation,
            services = exported.len(),
            "Plugin services instantiated"
        );
        Ok((primary, exported))
    }

    /// Record a failure; the plugin keeps no loader
    pub fn mark_failed(&self, error: &SfxError) {
        let mut runtime = self.write();
        runtime.state = PluginState::Failed;
        runtime.last_error = Some(error.to_string());
    }

    /// Shut the services down and close the class loader
    ///
    /// The loader is closed before this returns, so the unpacked directory can be
    /// removed afterwards.
    pub async fn stop(&self) {
        let (loader, services) = {
            let mut runtime = self.write();
            if runtime.state == PluginState::Active {
                runtime.state = PluginState::Installed;
            }
            let mut services: Vec<Arc<dyn Service>> = runtime.primary.take().into_iter().collect();
            for (_, service) in std::mem::take(&mut runtime.exported) {
                if !services.iter().any(|known| same_instance(known, &service)) {
                    services.push(service);
                }
            }
            (runtime.loader.take(), services)
        };

        for service in services {
            if let Err(e) = service.shutdown().await {
                warn!(plugin_id = %self.id(), class = service.class().name(), error = %e, "Service shutdown failed");
            }
        }

        if let Some(loader) = loader {
            loader.close();
            info!(plugin_id = %self.id(), "Plugin stopped");
        }
    }

    /// Stop, then remove the unpacked directory
    pub async fn uninstall(&self, root: &Path) -> Result<()> {
        self.stop().await;
        self.archive.cleanup(root)?;
        self.write().state = PluginState::Uninstalled;
        info!(plugin_id = %self.id(), "Plugin uninstalled");
        Ok(())
    }

    /// Record removal without touching the unpacked directory
    pub fn mark_uninstalled(&self) {
        self.write().state = PluginState::Uninstalled;
    }

    /// Whether the activation class is `interface` or derives from it
    ///
    /// `interface` is resolved in the host registry while the hierarchy is resolved
    /// through this plugin's own loader, and classes are compared by identity: a class
    /// the plugin packages under the same name as a host interface does not count.
    /// False while the plugin has no loader.
    pub fn is_instance_of(&self, interface: &str, host: &HostClassRegistry) -> bool {
        let Some(wanted) = host.class(interface) else {
            return false;
        };
        let Some(loader) = self.read().loader.clone() else {
            return false;
        };

        let hierarchy = loader
            .activation_class()
            .and_then(|activation| {
                activation.ok_or_else(|| SfxError::PluginLoadError("no activation class".to_string()))
            })
            .and_then(|activation| loader.load_class(&activation))
            .and_then(|class| loader.hierarchy(&class));

        match hierarchy {
            Ok(classes) => classes.iter().any(|class| class.same_class(&wanted)),
            Err(e) => {
                debug!(plugin_id = %self.id(), interface, error = %e, "Capability check failed");
                false
            }
        }
    }

    /// Instance exported for `interface` through its services file, else the activation
    /// instance
    pub fn service_for(&self, interface: &str) -> Option<Arc<dyn Service>> {
        let runtime = self.read();
        runtime
            .exported
            .get(interface)
            .cloned()
            .or_else(|| runtime.primary.clone())
    }

    pub fn loader(&self) -> Option<Arc<PluginClassLoader>> {
        self.read().loader.clone()
    }

    pub fn info(&self) -> PluginInfo {
        let runtime = self.read();
        PluginInfo {
            id: self.id(),
            name: self.manifest.name.clone(),
            version: self.manifest.version.to_string(),
            description: self.manifest.description.clone(),
            plugin_type: self.manifest.plugin_type,
            icon_name: self.manifest.icon_name.clone(),
            file: self.archive.file().to_path_buf(),
            state: runtime.state,
            install_seq: self.install_seq,
            services: runtime.exported.keys().cloned().collect(),
            last_error: runtime.last_error.clone(),
        }
    }

    /// Name, version, then arrival order
    pub fn precedence(&self, other: &RegisteredPlugin) -> Ordering {
        self.cmp(other).then(self.install_seq.cmp(&other.install_seq))
    }

    fn read(&self) -> RwLockReadGuard<'_, Runtime> {
        self.runtime.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Runtime> {
        self.runtime.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn same_instance(a: &Arc<dyn Service>, b: &Arc<dyn Service>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl PartialEq for RegisteredPlugin {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RegisteredPlugin {}

impl PartialOrd for RegisteredPlugin {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RegisteredPlugin {
    fn cmp(&self, other: &Self) -> Ordering {
        self.manifest
            .name
            .cmp(&other.manifest.name)
            .then_with(|| self.manifest.version.cmp(&other.manifest.version))
    }
}

impl std::fmt::Debug for RegisteredPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredPlugin")
            .field("id", &self.id())
            .field("file", &self.archive.file())
            .field("install_seq", &self.install_seq)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::testing::{create_dummy_plugin, markup_package, ArchiveBuilder, PackageBuilder};
    use tempfile::TempDir;

    fn host() -> Arc<HostClassRegistry> {
        Arc::new(HostClassRegistry::with_standard_interfaces())
    }

    fn registered(dir: &Path, builder: ArchiveBuilder, seq: u64) -> RegisteredPlugin {
        RegisteredPlugin::new(PluginArchive::new(builder.write_to(dir)).unwrap(), seq).unwrap()
    }

    #[test]
    fn test_manifest_round_trip_after_unpack() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("unpacked");
        let path = create_dummy_plugin(dir.path(), "awesome", "Awesome plugin", "1.0");

        let plugin = RegisteredPlugin::new(PluginArchive::new(path).unwrap(), 0).unwrap();
        plugin.install(&root).unwrap();

        assert_eq!(plugin.name(), "Awesome plugin");
        assert_eq!(plugin.version().as_str(), "1.0");
        assert_eq!(plugin.description(), "This is a dummy plugin");
        assert_eq!(plugin.plugin_type(), PluginType::Markup);
        assert_eq!(plugin.state(), PluginState::Installed);
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("unpacked");
        let plugin = registered(dir.path(), ArchiveBuilder::new("awesome", markup_package("Awesome plugin", "1.0")), 0);

        assert!(matches!(plugin.start(&root, host()), Err(SfxError::NotUnpacked(_))));

        plugin.install(&root).unwrap();
        plugin.start(&root, host()).unwrap();
        assert!(plugin.is_active());
        assert!(plugin.service_for("sfx.markup.Markup").is_some());
        assert_eq!(plugin.info().services, vec!["sfx.markup.Markup".to_string()]);

        let loader = plugin.loader().unwrap();
        plugin.stop().await;
        assert_eq!(plugin.state(), PluginState::Installed);
        assert!(loader.is_closed());
        assert!(plugin.service_for("sfx.markup.Markup").is_none());

        plugin.uninstall(&root).await.unwrap();
        assert_eq!(plugin.state(), PluginState::Uninstalled);
        assert!(!plugin.archive().is_unpacked(&root));
    }

    #[test]
    fn test_is_instance_of() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("unpacked");
        let host = host();
        let plugin = registered(dir.path(), ArchiveBuilder::new("awesome", markup_package("Awesome plugin", "1.0")), 0);

        assert!(!plugin.is_instance_of("sfx.markup.Markup", &host));

        plugin.install(&root).unwrap();
        plugin.start(&root, host.clone()).unwrap();

        assert!(plugin.is_instance_of("sfx.markup.Markup", &host));
        assert!(plugin.is_instance_of("sfx.plugin.Plugin", &host));
        assert!(plugin.is_instance_of("sfx.plugin.AbstractPlugin", &host));
        assert!(!plugin.is_instance_of("sfx.snippet.SnippetExecutor", &host));
        assert!(!plugin.is_instance_of("com.acme.DummyMarkup", &host));
        assert!(!plugin.is_instance_of("sfx.unknown.Interface", &host));
    }

    #[test]
    fn test_local_class_shadowing_host_interface_does_not_match() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("unpacked");
        let host = host();
        let plugin = registered(
            dir.path(),
            ArchiveBuilder::new(
                "impostor",
                PackageBuilder::new("Impostor", "1.0")
                    .attribute("Plugin-Class", "com.acme.Impostor")
                    .class("sfx.markup.Markup", "kind = \"interface\"\n")
                    .class("com.acme.Impostor", "implements = [\"sfx.markup.Markup\"]\n"),
            ),
            0,
        );

        plugin.install(&root).unwrap();
        plugin.start(&root, host.clone()).unwrap();

        assert!(!plugin.is_instance_of("sfx.markup.Markup", &host));
    }

    #[test]
    fn test_failed_start_closes_loader() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("unpacked");
        let plugin = registered(
            dir.path(),
            ArchiveBuilder::new(
                "broken",
                PackageBuilder::new("Broken", "1.0").service("sfx.markup.Markup", "com.acme.Missing"),
            ),
            0,
        );

        plugin.install(&root).unwrap();
        let result = plugin.start(&root, host());

        assert!(matches!(result, Err(SfxError::ClassNotFound(_))));
        assert_eq!(plugin.state(), PluginState::Failed);
        assert!(plugin.loader().is_none());
        assert!(plugin.last_error().unwrap().contains("com.acme.Missing"));
    }

    #[test]
    fn test_ordering_by_name_then_version() {
        let dir = TempDir::new().unwrap();
        let a10 = registered(dir.path(), ArchiveBuilder::new("a10", PackageBuilder::new("alpha", "1.0")), 0);
        let a12 = registered(dir.path(), ArchiveBuilder::new("a12", PackageBuilder::new("alpha", "1.2")), 1);
        let b01 = registered(dir.path(), ArchiveBuilder::new("b01", PackageBuilder::new("beta", "0.1")), 2);
        let a12_again = registered(dir.path(), ArchiveBuilder::new("a12b", PackageBuilder::new("alpha", "1.2.0")), 3);

        assert!(a10 < a12);
        assert!(a12 < b01);
        assert_eq!(a12, a12_again);
        assert_eq!(a12.precedence(&a12_again), Ordering::Less);
    }
}

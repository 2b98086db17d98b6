//! Plugin manager
//!
//! Owns the plugin population: scans the plugins directory, keeps exactly one active
//! plugin per name (the highest version, ties going to the latest arrival), and
//! answers the capability queries the rest of the host is built on.
//!
//! Mutations (start, stop, install, uninstall) are serialized behind one async mutex.
//! Queries read an immutable snapshot that is swapped after every mutation, so they
//! never wait for an install in progress.

use crate::core::config::PluginConfig;
use crate::core::error::{Result, SfxError};
use crate::core::event_bus::{EventBus, Message};
use crate::plugin::archive::{PluginArchive, ARCHIVE_EXTENSION};
use crate::plugin::host::HostClassRegistry;
use crate::plugin::registered::RegisteredPlugin;
use crate::plugin::service::Service;
use crate::plugin::types::{PluginState, PluginStateEvent};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Endpoint receiving plugin lifecycle messages
pub const LIFECYCLE_ENDPOINT: &str = "plugins.lifecycle";
pub const EVENT_ACTIVATED: &str = "plugin.activated";
pub const EVENT_DEACTIVATED: &str = "plugin.deactivated";

/// A problem met while scanning, installing or starting a plugin
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub file: PathBuf,
    /// `name@version` when the manifest could be read
    pub plugin: Option<String>,
    pub error_type: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Diagnostic {
    fn new(file: &Path, plugin: Option<String>, error: &SfxError) -> Self {
        Self {
            file: file.to_path_buf(),
            plugin,
            error_type: error.error_type().to_string(),
            message: error.to_string(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Default)]
struct Snapshot {
    installed: Vec<Arc<RegisteredPlugin>>,
    active: Vec<Arc<RegisteredPlugin>>,
}

#[derive(Default)]
struct ManagerState {
    started: bool,
    installed: Vec<Arc<RegisteredPlugin>>,
    next_seq: u64,
}

pub struct PluginManager {
    plugin_dir: PathBuf,
    unpack_root: PathBuf,
    retain_unpacked_on_stop: bool,
    host: Arc<HostClassRegistry>,
    bus: Option<Arc<EventBus>>,
    state: Mutex<ManagerState>,
    snapshot: RwLock<Arc<Snapshot>>,
    diagnostics: RwLock<Vec<Diagnostic>>,
}

impl PluginManager {
    pub fn new(config: &PluginConfig, host: Arc<HostClassRegistry>) -> Self {
        Self {
            plugin_dir: config.plugin_dir.clone(),
            unpack_root: config.unpack_root(),
            retain_unpacked_on_stop: config.retain_unpacked_on_stop,
            host,
            bus: None,
            state: Mutex::new(ManagerState::default()),
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            diagnostics: RwLock::new(Vec::new()),
        }
    }

    /// Publish lifecycle messages on [`LIFECYCLE_ENDPOINT`]
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    pub fn unpack_root(&self) -> &Path {
        &self.unpack_root
    }

    pub fn host(&self) -> &Arc<HostClassRegistry> {
        &self.host
    }

    /// Scan the plugins directory and start the most recent version of every plugin
    ///
    /// Archives are registered in arrival order (modification time, then file name).
    /// Unreadable archives are skipped and recorded as diagnostics. Does nothing when
    /// already started.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.started {
            debug!("Plugin manager already started");
            return Ok(());
        }

        info!(plugin_dir = %self.plugin_dir.display(), "Starting plugin manager");
        tokio::fs::create_dir_all(&self.plugin_dir).await?;
        tokio::fs::create_dir_all(&self.unpack_root).await?;

        // Diagnostics describe the current run only
        if let Ok(mut diagnostics) = self.diagnostics.write() {
            diagnostics.clear();
        }

        for path in self.scan().await? {
            if let Some(existing) = self.find(&state, &path) {
                debug!(plugin_id = %existing.id(), file = %path.display(), "Archive already registered");
                continue;
            }
            if let Err(e) = self.register(&mut state, &path) {
                if !e.is_recoverable() {
                    return Err(e);
                }
                warn!(file = %path.display(), error = %e, "Skipping plugin archive");
                self.record(Diagnostic::new(&path, None, &e));
            }
        }

        state.started = true;
        self.resolve(&state).await;
        self.publish(&state);

        info!(
            installed = state.installed.len(),
            active = self.get_active_plugins().len(),
            "Plugin manager started"
        );
        Ok(())
    }

    /// Stop every active plugin and forget the installed set
    ///
    /// Unpacked directories are removed unless `retain_unpacked_on_stop` is set.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if !state.started {
            return;
        }

        for plugin in &state.installed {
            self.deactivate(plugin).await;
        }

        if !self.retain_unpacked_on_stop {
            for plugin in &state.installed {
                if let Err(e) = plugin.archive().cleanup(&self.unpack_root) {
                    warn!(plugin_id = %plugin.id(), error = %e, "Failed to remove unpacked plugin");
                }
            }
        }

        state.installed.clear();
        state.started = false;
        self.publish(&state);
        info!("Plugin manager stopped");
    }

    /// Install an archive, copying it into the plugins directory
    ///
    /// The archive is validated before anything is touched. Installing an archive that
    /// is already registered at the same location with the same identity returns the
    /// existing handle and leaves everything as is. If the new archive is the most
    /// recent of its name it replaces the active one, otherwise it is kept inactive.
    pub async fn install_plugin(&self, file: &Path) -> Result<Arc<RegisteredPlugin>> {
        let metadata = tokio::fs::metadata(file)
            .await
            .map_err(|_| SfxError::InvalidArgument(format!("{} does not exist", file.display())))?;
        if !metadata.is_file() {
            return Err(SfxError::InvalidArgument(format!("{} is not a file", file.display())));
        }
        let incoming = PluginArchive::open(file)?;
        let manifest = incoming.metadata()?.clone();

        let mut state = self.state.lock().await;
        tokio::fs::create_dir_all(&self.plugin_dir).await?;

        let file_name = file
            .file_name()
            .ok_or_else(|| SfxError::InvalidArgument(format!("{} has no file name", file.display())))?;
        let destination = self.plugin_dir.join(file_name);

        if let Some(existing) = self.find(&state, &destination) {
            if existing.name() == manifest.name && existing.version().is_textually_equal(&manifest.version) {
                debug!(plugin_id = %existing.id(), "Archive already installed");
                return Ok(existing);
            }

            info!(
                old = %existing.id(),
                new = %manifest.id(),
                "Replacing archive installed under the same file name"
            );
            self.remove(&mut state, &existing).await?;
        }

        if !same_file(file, &destination).await {
            tokio::fs::copy(file, &destination).await?;
        }

        let plugin = self.register(&mut state, &destination)?;
        info!(plugin_id = %plugin.id(), file = %destination.display(), "Plugin installed");

        if state.started {
            self.resolve(&state).await;
        }
        self.publish(&state);
        Ok(plugin)
    }

    /// Remove an installed archive and delete its file
    ///
    /// `file` may be the full path or just the file name inside the plugins directory.
    /// When the removed plugin was active, the next most recent version of the same name
    /// takes over.
    pub async fn uninstall_plugin(&self, file: &Path) -> Result<()> {
        let mut state = self.state.lock().await;

        let plugin = self
            .find(&state, file)
            .ok_or_else(|| SfxError::PluginNotFound(file.display().to_string()))?;

        self.remove(&mut state, &plugin).await?;

        match tokio::fs::remove_file(plugin.file()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(plugin_id = %plugin.id(), "Plugin archive deleted");

        if state.started {
            self.resolve(&state).await;
        }
        self.publish(&state);
        Ok(())
    }

    /// Services of active plugins implementing `interface`
    pub fn get_services(&self, interface: &str) -> Vec<Arc<dyn Service>> {
        self.get_plugins(interface)
            .iter()
            .filter_map(|plugin| plugin.service_for(interface))
            .collect()
    }

    /// Active plugins implementing `interface`
    pub fn get_plugins(&self, interface: &str) -> Vec<Arc<RegisteredPlugin>> {
        self.current()
            .active
            .iter()
            .filter(|plugin| plugin.is_instance_of(interface, &self.host))
            .cloned()
            .collect()
    }

    /// Plugins of the current snapshot that are still running
    pub fn get_active_plugins(&self) -> Vec<Arc<RegisteredPlugin>> {
        self.current()
            .active
            .iter()
            .filter(|plugin| plugin.is_active())
            .cloned()
            .collect()
    }

    /// Every registered archive, active or not, ordered by name then version
    pub fn get_installed_plugins(&self) -> Vec<Arc<RegisteredPlugin>> {
        self.current().installed.clone()
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics
            .read()
            .map(|diagnostics| diagnostics.clone())
            .unwrap_or_default()
    }

    /// Whether `plugin` is at least as recent as the active plugin of its name
    ///
    /// True when no plugin of that name is active.
    pub fn is_plugin_most_recent(&self, plugin: &RegisteredPlugin) -> bool {
        self.current()
            .active
            .iter()
            .find(|active| active.name() == plugin.name())
            .map_or(true, |active| plugin.version() >= active.version())
    }

    async fn scan(&self) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&self.plugin_dir).await?;

        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Cannot stat plugin candidate");
                    continue;
                }
            };
            let is_archive = path.extension().and_then(|ext| ext.to_str()) == Some(ARCHIVE_EXTENSION);
            if !metadata.is_file() || !is_archive {
                continue;
            }

            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((modified, entry.file_name(), path));
        }

        found.sort();
        debug!(count = found.len(), "Plugin archives found");
        Ok(found.into_iter().map(|(_, _, path)| path).collect())
    }

    fn register(&self, state: &mut ManagerState, path: &Path) -> Result<Arc<RegisteredPlugin>> {
        let archive = PluginArchive::open(path)?;
        let plugin = Arc::new(RegisteredPlugin::new(archive, state.next_seq)?);
        state.next_seq += 1;
        state.installed.push(plugin.clone());
        debug!(plugin_id = %plugin.id(), install_seq = plugin.install_seq(), "Plugin registered");
        Ok(plugin)
    }

    fn find(&self, state: &ManagerState, file: &Path) -> Option<Arc<RegisteredPlugin>> {
        let wanted = file.file_name()?;
        state
            .installed
            .iter()
            .find(|plugin| plugin.file() == file || plugin.file().file_name() == Some(wanted))
            .cloned()
    }

    /// Stop a plugin, drop it from the installed set and delete its unpacked directory
    /// unless another registered archive unpacks to the same place
    async fn remove(&self, state: &mut ManagerState, plugin: &Arc<RegisteredPlugin>) -> Result<()> {
        state.installed.retain(|other| !Arc::ptr_eq(other, plugin));

        let dir = plugin.archive().unpack_dir(&self.unpack_root)?;
        let shared = state
            .installed
            .iter()
            .any(|other| other.archive().unpack_dir(&self.unpack_root).map_or(false, |d| d == dir));

        let was_active = plugin.is_active();
        if shared {
            plugin.stop().await;
            plugin.mark_uninstalled();
        } else {
            plugin.uninstall(&self.unpack_root).await?;
        }
        if was_active {
            self.emit(EVENT_DEACTIVATED, plugin, PluginState::Active);
        }
        Ok(())
    }

    /// Make the most recent startable archive of every name the active one
    async fn resolve(&self, state: &ManagerState) {
        let names: BTreeSet<String> = state.installed.iter().map(|p| p.name().to_string()).collect();

        for name in names {
            let mut candidates: Vec<Arc<RegisteredPlugin>> = state
                .installed
                .iter()
                .filter(|plugin| plugin.name() == name)
                .cloned()
                .collect();
            candidates.sort_by(|a, b| b.precedence(a));

            let mut winner: Option<Arc<RegisteredPlugin>> = None;
            for candidate in &candidates {
                if candidate.is_active() {
                    winner = Some(candidate.clone());
                    break;
                }
                if candidate.state() == PluginState::Failed {
                    continue;
                }

                for other in candidates.iter().filter(|other| other.is_active()) {
                    self.deactivate(other).await;
                }

                match self.activate(candidate).await {
                    Ok(()) => {
                        winner = Some(candidate.clone());
                        break;
                    }
                    Err(e) => {
                        error!(plugin_id = %candidate.id(), error = %e, "Plugin failed to activate");
                        self.record(Diagnostic::new(candidate.file(), Some(candidate.id()), &e));
                    }
                }
            }

            for other in &candidates {
                let is_winner = winner.as_ref().map_or(false, |w| Arc::ptr_eq(w, other));
                if !is_winner && other.is_active() {
                    self.deactivate(other).await;
                }
            }
        }
    }

    async fn activate(&self, plugin: &Arc<RegisteredPlugin>) -> Result<()> {
        let worker = plugin.clone();
        let root = self.unpack_root.clone();
        let host = self.host.clone();

        // Unpacking and class loading are blocking file work
        let outcome = tokio::task::spawn_blocking(move || {
            let report = worker.install(&root)?;
            worker.start(&root, host)?;
            Ok::<_, SfxError>(report)
        })
        .await
        .map_err(|e| SfxError::PluginLoadError(format!("Task join error: {}", e)))
        .and_then(|outcome| outcome);

        let report = match outcome {
            Ok(report) => report,
            Err(e) => {
                plugin.mark_failed(&e);
                return Err(e);
            }
        };

        for rejected in &report.rejected {
            self.record(Diagnostic::new(plugin.file(), Some(plugin.id()), rejected));
        }

        self.emit(EVENT_ACTIVATED, plugin, PluginState::Installed);
        Ok(())
    }

    async fn deactivate(&self, plugin: &Arc<RegisteredPlugin>) {
        if !plugin.is_active() {
            return;
        }
        plugin.stop().await;
        self.emit(EVENT_DEACTIVATED, plugin, PluginState::Active);
    }

    fn emit(&self, kind: &str, plugin: &RegisteredPlugin, old_state: PluginState) {
        let Some(bus) = self.bus.clone() else {
            return;
        };

        let event = PluginStateEvent {
            plugin_id: plugin.id(),
            plugin_name: plugin.name().to_string(),
            version: plugin.version().to_string(),
            old_state: Some(old_state),
            new_state: plugin.state(),
            timestamp: Utc::now().timestamp(),
        };
        let payload = match serde_json::to_value(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to serialize plugin event");
                return;
            }
        };

        let message = Message::new(kind, payload);
        tokio::spawn(async move {
            if let Err(e) = bus.broadcast(LIFECYCLE_ENDPOINT, message).await {
                warn!(error = %e, "Failed to publish plugin event");
            }
        });
    }

    fn publish(&self, state: &ManagerState) {
        let mut installed = state.installed.clone();
        installed.sort_by(|a, b| a.precedence(b));
        let active = installed.iter().filter(|p| p.is_active()).cloned().collect();

        let snapshot = Arc::new(Snapshot { installed, active });
        match self.snapshot.write() {
            Ok(mut current) => *current = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }

    fn current(&self) -> Arc<Snapshot> {
        match self.snapshot.read() {
            Ok(snapshot) => snapshot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn record(&self, diagnostic: Diagnostic) {
        if let Ok(mut diagnostics) = self.diagnostics.write() {
            diagnostics.push(diagnostic);
        }
    }
}

async fn same_file(a: &Path, b: &Path) -> bool {
    match (tokio::fs::canonicalize(a).await, tokio::fs::canonicalize(b).await) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event_bus::Actor;
    use crate::plugin::service::{DeclaredService, ServiceContext, ServiceFactory};
    use crate::plugin::testing::{create_dummy_plugin, markup_package, ArchiveBuilder, PackageBuilder};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    const MARKUP: &str = "sfx.markup.Markup";

    struct Harness {
        _dir: TempDir,
        plugins: PathBuf,
        incoming: PathBuf,
        config: PluginConfig,
    }

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let plugins = dir.path().join("plugins");
            let incoming = dir.path().join("incoming");
            std::fs::create_dir_all(&plugins).unwrap();
            std::fs::create_dir_all(&incoming).unwrap();
            let config = PluginConfig {
                plugin_dir: plugins.clone(),
                unpack_dir: None,
                retain_unpacked_on_stop: true,
            };
            Self {
                _dir: dir,
                plugins,
                incoming,
                config,
            }
        }

        fn manager(&self) -> PluginManager {
            PluginManager::new(&self.config, Arc::new(HostClassRegistry::with_standard_interfaces()))
        }
    }

    fn active_versions(manager: &PluginManager, name: &str) -> Vec<String> {
        manager
            .get_plugins(MARKUP)
            .iter()
            .filter(|p| p.name() == name)
            .map(|p| p.version().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_start_activates_max_version_per_name() {
        let harness = Harness::new();
        for (stem, name, version) in [
            ("awesome-1.0", "Awesome", "1.0"),
            ("awesome-1.10", "Awesome", "1.10"),
            ("awesome-1.9", "Awesome", "1.9"),
            ("other-0.1", "Other", "0.1"),
            ("other-0.2", "Other", "0.2"),
        ] {
            create_dummy_plugin(&harness.plugins, stem, name, version);
        }
        std::fs::write(harness.plugins.join("notes.txt"), "ignored").unwrap();

        let manager = harness.manager();
        manager.start().await.unwrap();

        assert_eq!(active_versions(&manager, "Awesome"), vec!["1.10"]);
        assert_eq!(active_versions(&manager, "Other"), vec!["0.2"]);
        assert_eq!(manager.get_active_plugins().len(), 2);
        assert_eq!(manager.get_installed_plugins().len(), 5);
        assert_eq!(manager.get_services(MARKUP).len(), 2);
        assert!(manager.diagnostics().is_empty());

        let superseded = manager
            .get_installed_plugins()
            .into_iter()
            .find(|p| p.version().as_str() == "1.0")
            .unwrap();
        assert_eq!(superseded.state(), PluginState::Installed);
        assert!(!superseded.archive().is_unpacked(manager.unpack_root()));
    }

    #[tokio::test]
    async fn test_start_skips_invalid_archives() {
        let harness = Harness::new();
        create_dummy_plugin(&harness.plugins, "good", "Good", "1.0");
        ArchiveBuilder::new("blank", PackageBuilder::new("", "1.0")).write_to(&harness.plugins);
        ArchiveBuilder::new("badversion", PackageBuilder::new("Bad", "one")).write_to(&harness.plugins);
        std::fs::write(harness.plugins.join("corrupt.sfx-plugin"), b"PK garbage").unwrap();

        let manager = harness.manager();
        manager.start().await.unwrap();

        assert_eq!(manager.get_active_plugins().len(), 1);
        let diagnostics = manager.diagnostics();
        assert_eq!(diagnostics.len(), 3);
        assert!(diagnostics.iter().all(|d| d.error_type == "ManifestInvalid"));
    }

    #[tokio::test]
    async fn test_restart_replaces_diagnostics() {
        let harness = Harness::new();
        create_dummy_plugin(&harness.plugins, "good", "Good", "1.0");
        std::fs::write(harness.plugins.join("corrupt.sfx-plugin"), b"PK garbage").unwrap();

        let manager = harness.manager();
        manager.start().await.unwrap();
        assert_eq!(manager.diagnostics().len(), 1);

        manager.stop().await;
        manager.start().await.unwrap();
        manager.stop().await;
        manager.start().await.unwrap();

        let diagnostics = manager.diagnostics();
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].file.ends_with("corrupt.sfx-plugin"));
    }

    #[tokio::test]
    async fn test_install_before_start_registers_once() {
        let harness = Harness::new();
        let manager = harness.manager();

        let file = create_dummy_plugin(&harness.incoming, "awesome", "Awesome", "1.0");
        let installed = manager.install_plugin(&file).await.unwrap();
        assert_eq!(installed.state(), PluginState::Installed);

        manager.start().await.unwrap();

        let plugins = manager.get_installed_plugins();
        assert_eq!(plugins.len(), 1);
        assert!(Arc::ptr_eq(&plugins[0], &installed));
        assert!(installed.is_active());
        assert_eq!(active_versions(&manager, "Awesome"), vec!["1.0"]);
    }

    #[tokio::test]
    async fn test_active_plugins_exclude_stopped_handles() {
        let harness = Harness::new();
        create_dummy_plugin(&harness.plugins, "awesome", "Awesome", "1.0");

        let manager = harness.manager();
        manager.start().await.unwrap();
        let active = manager.get_active_plugins();
        assert_eq!(active.len(), 1);

        // Stopped behind the manager's back, the published snapshot still lists it
        active[0].stop().await;

        assert!(manager.get_active_plugins().is_empty());
        assert!(manager.get_plugins(MARKUP).is_empty());
        assert_eq!(manager.get_installed_plugins().len(), 1);
    }

    #[tokio::test]
    async fn test_names_slugging_alike_stay_isolated() {
        let harness = Harness::new();
        ArchiveBuilder::new(
            "foo-bar-a",
            markup_package("Foo Bar", "1.0").resource("docs/note.txt", b"from A"),
        )
        .write_to(&harness.plugins);
        ArchiveBuilder::new(
            "foo-bar-b",
            markup_package("foo-bar", "1.0").resource("docs/note.txt", b"from B"),
        )
        .write_to(&harness.plugins);

        let manager = harness.manager();
        manager.start().await.unwrap();
        let active = manager.get_active_plugins();
        assert_eq!(active.len(), 2);

        let dirs: BTreeSet<PathBuf> = active
            .iter()
            .map(|p| p.archive().unpack_dir(manager.unpack_root()).unwrap())
            .collect();
        assert_eq!(dirs.len(), 2);

        for (name, note) in [("Foo Bar", "from A"), ("foo-bar", "from B")] {
            let plugin = active.iter().find(|p| p.name() == name).unwrap();
            let loader = plugin.loader().unwrap();
            assert_eq!(
                loader.get_resource("docs/note.txt").unwrap(),
                Some(note.as_bytes().to_vec())
            );
        }

        let first = active.iter().find(|p| p.name() == "Foo Bar").unwrap().clone();
        let second = active.iter().find(|p| p.name() == "foo-bar").unwrap().clone();
        manager.uninstall_plugin(Path::new("foo-bar-a.sfx-plugin")).await.unwrap();

        assert!(!first.archive().unpack_dir(manager.unpack_root()).unwrap().exists());
        assert!(second.archive().is_unpacked(manager.unpack_root()));
        assert!(second.is_active());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_queries_answer_from_snapshot_during_slow_install() {
        let harness = Harness::new();
        create_dummy_plugin(&harness.plugins, "other", "Other", "1.0");

        // Every instantiation after the first waits for the test to let it through
        let (entered_tx, entered_rx) = std::sync::mpsc::channel::<()>();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let gate = std::sync::Mutex::new((entered_tx, release_rx));
        let calls = AtomicUsize::new(0);
        let factory: ServiceFactory = Arc::new(move |context: &ServiceContext<'_>| {
            if calls.fetch_add(1, Ordering::SeqCst) > 0 {
                let gate = gate.lock().unwrap();
                gate.0.send(()).unwrap();
                gate.1.recv_timeout(Duration::from_secs(10)).unwrap();
            }
            Ok(Arc::new(DeclaredService::new(context.class.clone())) as Arc<dyn Service>)
        });
        let mut host = HostClassRegistry::with_standard_interfaces();
        host.register_factory(MARKUP, factory);

        let manager = Arc::new(PluginManager::new(&harness.config, Arc::new(host)));
        manager.start().await.unwrap();
        assert_eq!(active_versions(&manager, "Other"), vec!["1.0"]);

        let slow = create_dummy_plugin(&harness.incoming, "slow", "Slow", "1.0");
        let installing = tokio::spawn({
            let manager = manager.clone();
            async move { manager.install_plugin(&slow).await }
        });
        tokio::task::spawn_blocking(move || entered_rx.recv_timeout(Duration::from_secs(10)))
            .await
            .unwrap()
            .unwrap();

        // The install holds the manager lock inside the factory call
        let queried = tokio::time::timeout(Duration::from_secs(1), async {
            (manager.get_plugins(MARKUP), manager.get_services(MARKUP), manager.get_installed_plugins())
        })
        .await
        .unwrap();
        assert_eq!(queried.0.len(), 1);
        assert_eq!(queried.0[0].name(), "Other");
        assert_eq!(queried.1.len(), 1);
        assert_eq!(queried.2.len(), 1);
        assert!(!installing.is_finished());

        release_tx.send(()).unwrap();
        let installed = installing.await.unwrap().unwrap();
        assert!(installed.is_active());
        assert_eq!(active_versions(&manager, "Slow"), vec!["1.0"]);
        assert_eq!(manager.get_services(MARKUP).len(), 2);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let harness = Harness::new();
        create_dummy_plugin(&harness.plugins, "awesome", "Awesome", "1.0");

        let manager = harness.manager();
        manager.start().await.unwrap();
        let first = manager.get_active_plugins();
        manager.start().await.unwrap();
        let second = manager.get_active_plugins();

        assert_eq!(first.len(), 1);
        assert!(Arc::ptr_eq(&first[0], &second[0]));
    }

    #[tokio::test]
    async fn test_install_order_independence() {
        for order in [["1.0", "1.2"], ["1.2", "1.0"]] {
            let harness = Harness::new();
            let manager = harness.manager();
            manager.start().await.unwrap();

            for version in order {
                let path = create_dummy_plugin(&harness.incoming, &format!("awesome-{}", version), "Awesome", version);
                manager.install_plugin(&path).await.unwrap();
            }

            assert_eq!(active_versions(&manager, "Awesome"), vec!["1.2"], "order {:?}", order);
            assert_eq!(manager.get_installed_plugins().len(), 2);
            assert!(harness.plugins.join("awesome-1.0.sfx-plugin").is_file());
            assert!(harness.plugins.join("awesome-1.2.sfx-plugin").is_file());
        }
    }

    #[tokio::test]
    async fn test_install_same_archive_twice_is_noop() {
        let harness = Harness::new();
        let manager = harness.manager();
        manager.start().await.unwrap();
        let path = create_dummy_plugin(&harness.incoming, "awesome", "Awesome", "1.0");

        let first = manager.install_plugin(&path).await.unwrap();
        let second = manager.install_plugin(&path).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.get_installed_plugins().len(), 1);
        assert!(Arc::ptr_eq(&manager.get_active_plugins()[0], &first));
    }

    #[tokio::test]
    async fn test_equal_versions_latest_arrival_wins() {
        let harness = Harness::new();
        let manager = harness.manager();
        manager.start().await.unwrap();

        let early = create_dummy_plugin(&harness.incoming, "awesome-a", "Awesome", "1.0");
        let late = create_dummy_plugin(&harness.incoming, "awesome-b", "Awesome", "1.0");
        manager.install_plugin(&early).await.unwrap();
        let winner = manager.install_plugin(&late).await.unwrap();

        let active = manager.get_plugins(MARKUP);
        assert_eq!(active.len(), 1);
        assert!(Arc::ptr_eq(&active[0], &winner));
    }

    #[tokio::test]
    async fn test_install_rejects_bad_input_without_side_effects() {
        let harness = Harness::new();
        let manager = harness.manager();
        manager.start().await.unwrap();

        let missing = harness.incoming.join("missing.sfx-plugin");
        assert!(matches!(
            manager.install_plugin(&missing).await,
            Err(SfxError::InvalidArgument(_))
        ));
        assert!(matches!(
            manager.install_plugin(&harness.incoming).await,
            Err(SfxError::InvalidArgument(_))
        ));

        let wrong_extension = harness.incoming.join("awesome.zip");
        std::fs::write(&wrong_extension, b"zip").unwrap();
        assert!(matches!(
            manager.install_plugin(&wrong_extension).await,
            Err(SfxError::InvalidArgument(_))
        ));

        let blank = ArchiveBuilder::new("blank", PackageBuilder::new("Blank", "  ")).write_to(&harness.incoming);
        assert!(matches!(
            manager.install_plugin(&blank).await,
            Err(SfxError::ManifestInvalid(_))
        ));

        assert!(manager.get_installed_plugins().is_empty());
        assert!(std::fs::read_dir(&harness.plugins)
            .unwrap()
            .filter_map(|e| e.ok())
            .all(|e| e.path().extension().and_then(|x| x.to_str()) != Some(ARCHIVE_EXTENSION)));
    }

    #[tokio::test]
    async fn test_uninstall_promotes_next_highest() {
        let harness = Harness::new();
        for version in ["1.0", "1.1", "1.2"] {
            create_dummy_plugin(&harness.plugins, &format!("awesome-{}", version), "Awesome", version);
        }
        let manager = harness.manager();
        manager.start().await.unwrap();
        assert_eq!(active_versions(&manager, "Awesome"), vec!["1.2"]);

        manager
            .uninstall_plugin(Path::new("awesome-1.2.sfx-plugin"))
            .await
            .unwrap();
        assert_eq!(active_versions(&manager, "Awesome"), vec!["1.1"]);
        assert!(!harness.plugins.join("awesome-1.2.sfx-plugin").exists());

        manager
            .uninstall_plugin(&harness.plugins.join("awesome-1.0.sfx-plugin"))
            .await
            .unwrap();
        assert_eq!(active_versions(&manager, "Awesome"), vec!["1.1"]);

        manager
            .uninstall_plugin(Path::new("awesome-1.1.sfx-plugin"))
            .await
            .unwrap();
        assert!(manager.get_plugins(MARKUP).is_empty());
        assert!(manager.get_services(MARKUP).is_empty());
        assert!(manager.get_installed_plugins().is_empty());

        assert!(matches!(
            manager.uninstall_plugin(Path::new("awesome-1.1.sfx-plugin")).await,
            Err(SfxError::PluginNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_superseded_plugin_loader_closed() {
        let harness = Harness::new();
        let manager = harness.manager();
        manager.start().await.unwrap();

        let old = manager
            .install_plugin(&create_dummy_plugin(&harness.incoming, "awesome-1.0", "Awesome", "1.0"))
            .await
            .unwrap();
        let loader = old.loader().unwrap();

        manager
            .install_plugin(&create_dummy_plugin(&harness.incoming, "awesome-2.0", "Awesome", "2.0"))
            .await
            .unwrap();

        assert_eq!(old.state(), PluginState::Installed);
        assert!(loader.is_closed());
        assert!(!manager.is_plugin_most_recent(&old));
        assert!(old.service_for(MARKUP).is_none());
        assert_eq!(manager.get_services(MARKUP).len(), 1);
        assert_eq!(active_versions(&manager, "Awesome"), vec!["2.0"]);
    }

    #[tokio::test]
    async fn test_failed_start_falls_back_to_next_candidate() {
        let harness = Harness::new();
        create_dummy_plugin(&harness.plugins, "awesome-1.0", "Awesome", "1.0");
        ArchiveBuilder::new(
            "awesome-2.0",
            PackageBuilder::new("Awesome", "2.0").service(MARKUP, "com.acme.Missing"),
        )
        .write_to(&harness.plugins);

        let manager = harness.manager();
        manager.start().await.unwrap();

        assert_eq!(active_versions(&manager, "Awesome"), vec!["1.0"]);
        let broken = manager
            .get_installed_plugins()
            .into_iter()
            .find(|p| p.version().as_str() == "2.0")
            .unwrap();
        assert_eq!(broken.state(), PluginState::Failed);
        assert!(manager.diagnostics().iter().any(|d| d.error_type == "ClassNotFound"));
    }

    #[tokio::test]
    async fn test_is_plugin_most_recent() {
        let harness = Harness::new();
        let manager = harness.manager();
        manager.start().await.unwrap();

        let v2 = manager
            .install_plugin(&create_dummy_plugin(&harness.incoming, "awesome-2.0", "Awesome", "2.0"))
            .await
            .unwrap();
        let v1 = manager
            .install_plugin(&create_dummy_plugin(&harness.incoming, "awesome-1.0", "Awesome", "1.0"))
            .await
            .unwrap();
        let v2_again = manager
            .install_plugin(&create_dummy_plugin(&harness.incoming, "awesome-2.0.0", "Awesome", "2.0.0"))
            .await
            .unwrap();

        assert!(!manager.is_plugin_most_recent(&v1));
        assert!(manager.is_plugin_most_recent(&v2));
        assert!(manager.is_plugin_most_recent(&v2_again));

        let unrelated = RegisteredPlugin::new(
            PluginArchive::new(create_dummy_plugin(&harness.incoming, "solo", "Solo", "0.1")).unwrap(),
            99,
        )
        .unwrap();
        assert!(manager.is_plugin_most_recent(&unrelated));
    }

    #[tokio::test]
    async fn test_stop_retains_or_removes_unpacked() {
        for retain in [true, false] {
            let mut harness = Harness::new();
            harness.config.retain_unpacked_on_stop = retain;
            create_dummy_plugin(&harness.plugins, "awesome", "Awesome", "1.0");

            let manager = harness.manager();
            manager.start().await.unwrap();
            let plugin = manager.get_active_plugins()[0].clone();
            let loader = plugin.loader().unwrap();
            let dir = plugin.archive().unpack_dir(manager.unpack_root()).unwrap();
            assert!(dir.is_dir());

            manager.stop().await;

            assert!(loader.is_closed());
            assert!(manager.get_active_plugins().is_empty());
            assert!(manager.get_installed_plugins().is_empty());
            assert_eq!(dir.is_dir(), retain);
        }
    }

    #[tokio::test]
    async fn test_restart_reuses_unpacked_directory() {
        let harness = Harness::new();
        create_dummy_plugin(&harness.plugins, "awesome", "Awesome", "1.0");

        let manager = harness.manager();
        manager.start().await.unwrap();
        manager.stop().await;
        manager.start().await.unwrap();

        assert_eq!(active_versions(&manager, "Awesome"), vec!["1.0"]);
    }

    #[tokio::test]
    async fn test_reinstall_under_same_name_with_new_identity() {
        let harness = Harness::new();
        let manager = harness.manager();
        manager.start().await.unwrap();

        let first = create_dummy_plugin(&harness.incoming, "awesome", "Awesome", "1.0");
        let old = manager.install_plugin(&first).await.unwrap();

        let updated = TempDir::new().unwrap();
        let second = create_dummy_plugin(updated.path(), "awesome", "Awesome", "1.1");
        let new = manager.install_plugin(&second).await.unwrap();

        assert_eq!(old.state(), PluginState::Uninstalled);
        assert_eq!(manager.get_installed_plugins().len(), 1);
        assert_eq!(active_versions(&manager, "Awesome"), vec!["1.1"]);
        assert!(Arc::ptr_eq(&manager.get_active_plugins()[0], &new));
    }

    #[tokio::test]
    async fn test_get_plugins_filters_by_capability() {
        let harness = Harness::new();
        create_dummy_plugin(&harness.plugins, "markup", "Markup", "1.0");
        ArchiveBuilder::new(
            "snippet",
            PackageBuilder::new("Snippets", "1.0")
                .attribute("Plugin-Type", "snippet-executor")
                .service("sfx.snippet.SnippetExecutor", "com.acme.Runner")
                .class("com.acme.Runner", "implements = [\"sfx.snippet.SnippetExecutor\"]\n"),
        )
        .write_to(&harness.plugins);

        let manager = harness.manager();
        manager.start().await.unwrap();

        let names = |interface: &str| -> Vec<String> {
            manager
                .get_plugins(interface)
                .iter()
                .map(|p| p.name().to_string())
                .collect()
        };
        assert_eq!(names(MARKUP), vec!["Markup"]);
        assert_eq!(names("sfx.snippet.SnippetExecutor"), vec!["Snippets"]);
        assert_eq!(names("sfx.plugin.Plugin"), vec!["Markup", "Snippets"]);
        assert!(names("sfx.hosting.HostingConnector").is_empty());
    }

    struct Recorder {
        kinds: std::sync::Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Actor for Recorder {
        fn supports_message(&self, _message: &Message) -> bool {
            true
        }

        async fn on_message(&self, message: Message) -> Result<()> {
            let version = message.payload["version"].as_str().unwrap_or_default().to_string();
            self.kinds.lock().unwrap().push((message.kind, version));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_lifecycle_events_published() {
        let harness = Harness::new();
        let bus = Arc::new(EventBus::new());
        let recorder = Arc::new(Recorder {
            kinds: std::sync::Mutex::new(Vec::new()),
        });
        bus.subscribe(LIFECYCLE_ENDPOINT, recorder.clone()).await.unwrap();

        let manager = harness.manager().with_event_bus(bus);
        manager.start().await.unwrap();
        manager
            .install_plugin(&create_dummy_plugin(&harness.incoming, "awesome-1.0", "Awesome", "1.0"))
            .await
            .unwrap();
        manager
            .install_plugin(&create_dummy_plugin(&harness.incoming, "awesome-1.1", "Awesome", "1.1"))
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while recorder.kinds.lock().unwrap().len() < 3 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut seen = recorder.kinds.lock().unwrap().clone();
        seen.sort();
        assert_eq!(
            seen,
            vec![
                (EVENT_ACTIVATED.to_string(), "1.0".to_string()),
                (EVENT_ACTIVATED.to_string(), "1.1".to_string()),
                (EVENT_DEACTIVATED.to_string(), "1.0".to_string()),
            ]
        );
    }
}

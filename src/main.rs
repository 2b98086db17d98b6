//! SFX Plugin Host
//!
//! Discovers versioned plugin archives, keeps the most recent version of each plugin
//! active and serves an admin API over the plugin manager and the event bus.

use sfx_plugin_host::{api, core, plugin};

use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration (handles CLI args, env vars, and config file)
    let config = match core::config::Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            // Print error to stderr since logging isn't initialized yet
            eprintln!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    // Initialize logging system based on configuration
    let _logger = match core::Logger::init(&config.logging) {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return Err(e);
        }
    };

    info!("Starting SFX Plugin Host v{}", sfx_plugin_host::VERSION);
    info!(
        plugin_dir = ?config.plugins.plugin_dir,
        unpack_root = ?config.plugins.unpack_root(),
        retain_unpacked_on_stop = config.plugins.retain_unpacked_on_stop,
        "Plugin configuration"
    );

    for dir in [config.plugins.plugin_dir.clone(), config.plugins.unpack_root()] {
        if !dir.exists() {
            info!("Creating directory: {:?}", dir);
            std::fs::create_dir_all(&dir)
                .map_err(|e| anyhow::anyhow!("Failed to create directory {:?}: {}", dir, e))?;
        }
    }

    let event_bus = Arc::new(core::EventBus::with_config(&config.event_bus));
    let host = Arc::new(plugin::HostClassRegistry::with_standard_interfaces());
    let plugin_manager = Arc::new(
        plugin::PluginManager::new(&config.plugins, host).with_event_bus(event_bus.clone()),
    );

    plugin_manager.start().await?;
    log_diagnostics(&plugin_manager);

    if config.server.enabled {
        let server_url = format!("http://{}:{}", config.server.host, config.server.port);
        let server = api::ApiServer::new(
            &config.server,
            api::handlers::AppState::new(plugin_manager.clone(), event_bus),
        );

        info!(url = %server_url, "Server ready - starting to serve requests");

        // Start serving (this will block until shutdown signal)
        if let Err(e) = server.serve().await {
            error!(error = %e, "HTTP server failed");
            plugin_manager.stop().await;
            return Err(e);
        }
    } else {
        info!("HTTP server disabled, waiting for shutdown signal");
        api::server::shutdown_signal().await;
    }

    plugin_manager.stop().await;
    info!("SFX Plugin Host stopped");

    Ok(())
}

fn log_diagnostics(manager: &plugin::PluginManager) {
    let active = manager.get_active_plugins();
    info!(
        installed = manager.get_installed_plugins().len(),
        active = active.len(),
        "Plugins loaded"
    );
    for plugin in &active {
        info!(plugin_id = %plugin.id(), file = ?plugin.file(), "Active plugin");
    }
    for diagnostic in manager.diagnostics() {
        error!(
            file = ?diagnostic.file,
            error_type = %diagnostic.error_type,
            "{}",
            diagnostic.message
        );
    }
}

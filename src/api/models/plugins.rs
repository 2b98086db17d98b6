use crate::plugin::{Diagnostic, PluginInfo};
use serde::Serialize;

// Plugin Management API models

/// Response for plugin list
#[derive(Debug, Serialize)]
pub struct PluginsListResponse {
    /// List of plugins
    pub plugins: Vec<PluginInfo>,
    /// Total number of plugins
    pub total: usize,
}

impl From<Vec<PluginInfo>> for PluginsListResponse {
    fn from(plugins: Vec<PluginInfo>) -> Self {
        Self {
            total: plugins.len(),
            plugins,
        }
    }
}

/// Response for plugin installation
#[derive(Debug, Serialize)]
pub struct InstallPluginResponse {
    pub plugin: PluginInfo,
    /// Whether the installed archive is the active version of its plugin
    pub active: bool,
    pub message: String,
}

/// Response for plugin uninstallation
#[derive(Debug, Serialize)]
pub struct UninstallPluginResponse {
    pub message: String,
}

/// One active plugin exporting a service
#[derive(Debug, Serialize)]
pub struct ServiceProviderResponse {
    pub plugin_id: String,
    pub plugin_name: String,
    pub version: String,
    /// Class of the exported instance
    pub class: String,
}

/// Response for the service lookup of an interface
#[derive(Debug, Serialize)]
pub struct ServicesResponse {
    pub interface: String,
    pub providers: Vec<ServiceProviderResponse>,
    pub total: usize,
}

/// Response for recorded plugin problems
#[derive(Debug, Serialize)]
pub struct DiagnosticsResponse {
    pub diagnostics: Vec<Diagnostic>,
    pub total: usize,
}

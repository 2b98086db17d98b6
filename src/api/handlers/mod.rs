pub mod bus;
pub mod plugins;

pub use bus::*;
pub use plugins::*;

use crate::core::EventBus;
use crate::plugin::PluginManager;
use std::sync::Arc;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub plugin_manager: Arc<PluginManager>,
    pub event_bus: Arc<EventBus>,
}

impl AppState {
    pub fn new(plugin_manager: Arc<PluginManager>, event_bus: Arc<EventBus>) -> Self {
        Self {
            plugin_manager,
            event_bus,
        }
    }
}

//! API routes

use crate::api::handlers::{
    broadcast_message, get_diagnostics, get_plugin_icon, get_services, install_plugin,
    list_active_plugins, list_endpoints, list_plugins, subscribe_socket, uninstall_plugin,
    AppState,
};
use axum::{
    routing::{delete, get, post},
    Router,
};

/// Build the API routes
pub fn build_api_routes(state: AppState) -> Router {
    Router::new()
        // Plugin management
        .route("/api/plugins", get(list_plugins).post(install_plugin))
        .route("/api/plugins/active", get(list_active_plugins))
        .route("/api/plugins/diagnostics", get(get_diagnostics))
        .route("/api/plugins/:file", delete(uninstall_plugin))
        .route("/api/plugins/:file/icon", get(get_plugin_icon))
        .route("/api/services/:interface", get(get_services))
        // Event bus
        .route("/api/bus", get(list_endpoints))
        .route("/api/bus/:endpoint", post(broadcast_message))
        .route("/api/bus/:endpoint/ws", get(subscribe_socket))
        .with_state(state)
}

use crate::api::models::{
    DiagnosticsResponse, InstallPluginResponse, PluginsListResponse, ServiceProviderResponse,
    ServicesResponse, UninstallPluginResponse,
};
use crate::core::error::{Result, SfxError};
use crate::plugin::RegisteredPlugin;
use axum::{
    extract::{Multipart, Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;
use super::AppState;

/// Handler for GET /api/plugins - List every installed archive with its state
pub async fn list_plugins(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let plugins = state
        .plugin_manager
        .get_installed_plugins()
        .iter()
        .map(|plugin| plugin.info())
        .collect::<Vec<_>>();

    Ok(Json(PluginsListResponse::from(plugins)))
}

/// Handler for GET /api/plugins/active - List active plugins
pub async fn list_active_plugins(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let plugins = state
        .plugin_manager
        .get_active_plugins()
        .iter()
        .map(|plugin| plugin.info())
        .collect::<Vec<_>>();

    Ok(Json(PluginsListResponse::from(plugins)))
}

/// Handler for GET /api/plugins/diagnostics - Problems met while loading plugins
pub async fn get_diagnostics(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let diagnostics = state.plugin_manager.diagnostics();

    Ok(Json(DiagnosticsResponse {
        total: diagnostics.len(),
        diagnostics,
    }))
}

/// Handler for POST /api/plugins - Install an uploaded plugin archive
///
/// The multipart field `file` carries the archive. Its file name is kept, since the
/// archive name decides the name of the package inside it.
pub async fn install_plugin(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse> {
    let upload_dir = std::env::temp_dir()
        .join("sfx-plugin-uploads")
        .join(Uuid::new_v4().to_string());
    let mut uploaded: Option<PathBuf> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| SfxError::InvalidArgument(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let file_name = field
            .file_name()
            .and_then(plain_file_name)
            .map(str::to_string)
            .ok_or_else(|| SfxError::InvalidArgument("Uploaded file has no usable file name".to_string()))?;
        let data = field
            .bytes()
            .await
            .map_err(|e| SfxError::InvalidArgument(e.to_string()))?;

        tokio::fs::create_dir_all(&upload_dir).await?;
        let path = upload_dir.join(file_name);
        tokio::fs::write(&path, data).await?;
        uploaded = Some(path);
        break;
    }

    let Some(path) = uploaded else {
        return Err(SfxError::InvalidArgument("No file uploaded".to_string()));
    };

    let result = state.plugin_manager.install_plugin(&path).await;

    discard_upload(&upload_dir).await;

    let plugin = result?;
    let active = state
        .plugin_manager
        .get_active_plugins()
        .iter()
        .any(|candidate| Arc::ptr_eq(candidate, &plugin));

    Ok((
        StatusCode::CREATED,
        Json(InstallPluginResponse {
            message: format!("Plugin {} installed successfully", plugin.id()),
            plugin: plugin.info(),
            active,
        }),
    ))
}

/// Handler for DELETE /api/plugins/:file - Uninstall the archive with this file name
pub async fn uninstall_plugin(
    State(state): State<AppState>,
    Path(file): Path<String>,
) -> Result<impl IntoResponse> {
    let name = plain_file_name(&file)
        .ok_or_else(|| SfxError::InvalidArgument(format!("Invalid plugin file name: {}", file)))?;

    state
        .plugin_manager
        .uninstall_plugin(std::path::Path::new(name))
        .await?;

    Ok((
        StatusCode::OK,
        Json(UninstallPluginResponse {
            message: format!("Plugin {} uninstalled successfully", name),
        }),
    ))
}

/// Handler for GET /api/plugins/:file/icon - Icon shipped in the archive
pub async fn get_plugin_icon(
    State(state): State<AppState>,
    Path(file): Path<String>,
) -> Result<impl IntoResponse> {
    let plugin = find_installed(&state, &file)?;

    let icon = tokio::task::spawn_blocking(move || plugin.archive().icon())
        .await
        .map_err(|e| SfxError::PluginExecutionError(format!("Task join error: {}", e)))??
        .ok_or_else(|| SfxError::PluginNotFound(format!("{} has no icon", file)))?;

    Ok(([(header::CONTENT_TYPE, "image/png")], icon))
}

/// Handler for GET /api/services/:interface - Active providers of an interface
pub async fn get_services(
    State(state): State<AppState>,
    Path(interface): Path<String>,
) -> Result<impl IntoResponse> {
    let providers: Vec<ServiceProviderResponse> = state
        .plugin_manager
        .get_plugins(&interface)
        .iter()
        .filter_map(|plugin| {
            plugin.service_for(&interface).map(|service| ServiceProviderResponse {
                plugin_id: plugin.id(),
                plugin_name: plugin.name().to_string(),
                version: plugin.version().to_string(),
                class: service.class().name().to_string(),
            })
        })
        .collect();

    Ok(Json(ServicesResponse {
        total: providers.len(),
        interface,
        providers,
    }))
}

fn find_installed(state: &AppState, file: &str) -> Result<Arc<RegisteredPlugin>> {
    let name = plain_file_name(file)
        .ok_or_else(|| SfxError::InvalidArgument(format!("Invalid plugin file name: {}", file)))?;

    state
        .plugin_manager
        .get_installed_plugins()
        .into_iter()
        .find(|plugin| plugin.file().file_name().and_then(|n| n.to_str()) == Some(name))
        .ok_or_else(|| SfxError::PluginNotFound(name.to_string()))
}

/// Remove a temporary upload directory; failures are logged and otherwise ignored
async fn discard_upload(dir: &FsPath) -> bool {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Failed to remove upload directory");
            false
        }
    }
}

/// The name itself when it is a single path component
fn plain_file_name(name: &str) -> Option<&str> {
    let name = name.trim();
    if name.is_empty() || name == "." || name == ".." || name.contains(|c: char| matches!(c, '/' | '\\' | '\0')) {
        return None;
    }
    Some(name)
}

//! Error type system for the plugin host
//!
//! This module provides:
//! - The plugin lifecycle error taxonomy (manifest, unpack, class loading, extraction)
//! - Error context and chaining support
//! - HTTP status code mapping for the admin API
//! - Error responses carrying trace IDs

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Main error type for the plugin host
#[derive(Debug, thiserror::Error)]
pub enum SfxError {
    // System-level errors
    #[error("System initialization failed: {0}")]
    InitializationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Archive and manifest errors
    #[error("Invalid plugin manifest: {0}")]
    ManifestInvalid(String),

    #[error("Plugin is not unpacked: {0}")]
    NotUnpacked(String),

    #[error("Archive entry rejected: {0}")]
    ExtractionRejected(String),

    #[error("Archive error: {0}")]
    ArchiveError(#[from] zip::result::ZipError),

    // Class loading errors
    #[error("Class not found: {0}")]
    ClassNotFound(String),

    // Plugin-related errors
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Plugin load failed: {0}")]
    PluginLoadError(String),

    #[error("Plugin execution error: {0}")]
    PluginExecutionError(String),

    // Caller errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // I/O errors
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),

    // Event bus errors
    #[error("Event error: {0}")]
    EventError(String),
}

impl SfxError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            SfxError::InvalidArgument(_)
            | SfxError::ManifestInvalid(_)
            | SfxError::ExtractionRejected(_)
            | SfxError::ArchiveError(_)
            | SfxError::SerializationError(_) => StatusCode::BAD_REQUEST,

            // 404 Not Found
            SfxError::PluginNotFound(_) | SfxError::ClassNotFound(_) => StatusCode::NOT_FOUND,

            // 409 Conflict
            SfxError::NotUnpacked(_) => StatusCode::CONFLICT,

            // 500 Internal Server Error
            SfxError::InitializationError(_)
            | SfxError::ConfigError(_)
            | SfxError::PluginLoadError(_)
            | SfxError::PluginExecutionError(_)
            | SfxError::IoError(_)
            | SfxError::EventError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error type name for API responses and diagnostics
    pub fn error_type(&self) -> &'static str {
        match self {
            SfxError::InitializationError(_) => "InitializationError",
            SfxError::ConfigError(_) => "ConfigError",
            SfxError::ManifestInvalid(_) => "ManifestInvalid",
            SfxError::NotUnpacked(_) => "NotUnpacked",
            SfxError::ExtractionRejected(_) => "ExtractionRejected",
            SfxError::ArchiveError(_) => "ArchiveError",
            SfxError::ClassNotFound(_) => "ClassNotFound",
            SfxError::PluginNotFound(_) => "PluginNotFound",
            SfxError::PluginLoadError(_) => "PluginLoadError",
            SfxError::PluginExecutionError(_) => "PluginExecutionError",
            SfxError::InvalidArgument(_) => "InvalidArgument",
            SfxError::IoError(_) => "IoError",
            SfxError::SerializationError(_) => "SerializationError",
            SfxError::EventError(_) => "EventError",
        }
    }

    /// Whether a scan or install may skip the offending plugin and carry on
    ///
    /// Contract violations such as [`SfxError::NotUnpacked`] are caller bugs and are
    /// never recovered.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SfxError::NotUnpacked(_))
    }
}

/// Error response structure for API endpoints
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error type identifier
    pub error: String,
    /// Human-readable error message
    pub message: String,
    /// Optional additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// Unique trace ID for this error
    pub trace_id: String,
}

impl ErrorResponse {
    /// Create a new error response with a generated trace ID
    pub fn new(error: String, message: String) -> Self {
        Self {
            error,
            message,
            details: None,
            trace_id: Uuid::new_v4().to_string(),
        }
    }

    /// Create an error response with additional details
    pub fn with_details(error: String, message: String, details: serde_json::Value) -> Self {
        Self {
            error,
            message,
            details: Some(details),
            trace_id: Uuid::new_v4().to_string(),
        }
    }

    /// Create an error response from an SfxError
    pub fn from_error(error: &SfxError) -> Self {
        Self::new(error.error_type().to_string(), error.to_string())
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}{} (trace_id: {})",
            self.error,
            self.message,
            self.details.as_ref().map_or("", |_| " with details"),
            self.trace_id
        )
    }
}

impl IntoResponse for SfxError {
    fn into_response(self) -> Response {
        let status_code = self.status_code();
        let error_response = ErrorResponse::from_error(&self);

        tracing::error!(
            error_type = self.error_type(),
            trace_id = %error_response.trace_id,
            status_code = %status_code,
            "Request failed: {}",
            self
        );

        (status_code, Json(error_response)).into_response()
    }
}

/// Result type alias for operations that can fail with SfxError
pub type Result<T> = std::result::Result<T, SfxError>;

/// Context extension trait for adding context to errors
pub trait ErrorContext<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context to an error using a closure
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| SfxError::PluginLoadError(format!("{}: {}", context.into(), e)))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| SfxError::PluginLoadError(format!("{}: {}", f(), e)))
    }
}

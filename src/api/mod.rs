//! REST API module
//!
//! This module provides the admin HTTP server including:
//! - Plugin management endpoints (list, install, uninstall, service lookup)
//! - Event bus endpoints (broadcast and WebSocket subscribers)
//! - Request tracing middleware

pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;

pub use server::ApiServer;
pub use middleware::{trace_id_middleware, TraceId, TRACE_ID_HEADER};

//! Core application layer
//!
//! This module provides:
//! - Event bus for endpoint-keyed pub/sub messaging
//! - Configuration management
//! - Structured logging system
//! - Error handling and type system

pub mod config;
pub mod error;
pub mod event_bus;
pub mod logging;

pub use config::Config;
pub use error::{ErrorContext, ErrorResponse, Result, SfxError};
pub use event_bus::{Actor, EventBus, Message};
pub use logging::Logger;

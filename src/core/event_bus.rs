//! Event bus implementation for publish-subscribe messaging
//!
//! Components publish [`Message`]s on named endpoints; [`Actor`]s registered on an
//! endpoint receive them asynchronously. It supports:
//! - Many actors per endpoint and many endpoints per actor
//! - Independent delivery: every accepting actor gets its own task
//! - A cap on deliveries running at the same time
//! - Isolated failures (an actor that errors or panics affects nobody else)
//!
//! Delivery is best effort. There is no ordering between broadcasts and no timeout on
//! a slow actor; actors needing ordering serialize internally.

use crate::core::config::EventBusConfig;
use crate::core::error::{Result, SfxError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};
use uuid::Uuid;

/// Unique identifier for a message
pub type MessageId = String;

/// A message broadcast on an endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    /// Free-form discriminator that actors usually filter on
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl Message {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Receiver of messages broadcast on the endpoints it subscribed to
///
/// Actors are registered by reference: the bus never owns them beyond holding an
/// `Arc`, and two registrations of the same `Arc` are the same subscriber.
#[async_trait]
pub trait Actor: Send + Sync {
    /// Whether `on_message` should be called for this message
    fn supports_message(&self, message: &Message) -> bool;

    /// Handle a message; errors are logged by the bus and go no further
    async fn on_message(&self, message: Message) -> Result<()>;
}

/// Endpoint-keyed publish/subscribe bus
pub struct EventBus {
    endpoints: Arc<RwLock<HashMap<String, Vec<Arc<dyn Actor>>>>>,
    deliveries: Arc<Semaphore>,
    max_concurrent_deliveries: usize,
}

impl EventBus {
    /// Create a new event bus with the default delivery cap
    pub fn new() -> Self {
        Self::with_config(&EventBusConfig::default())
    }

    pub fn with_config(config: &EventBusConfig) -> Self {
        let max_concurrent_deliveries = config.max_concurrent_deliveries.max(1);
        Self {
            endpoints: Arc::new(RwLock::new(HashMap::new())),
            deliveries: Arc::new(Semaphore::new(max_concurrent_deliveries)),
            max_concurrent_deliveries,
        }
    }

    /// Register `actor` on `endpoint`
    ///
    /// Subscribing an actor that is already registered on the endpoint has no effect.
    pub async fn subscribe(&self, endpoint: &str, actor: Arc<dyn Actor>) -> Result<()> {
        let endpoint = check_endpoint(endpoint)?;

        let mut endpoints = self.endpoints.write().await;
        let actors = endpoints.entry(endpoint.to_string()).or_default();
        if !actors.iter().any(|a| same_actor(a, &actor)) {
            actors.push(actor);
            tracing::debug!(endpoint = endpoint, subscribers = actors.len(), "Actor subscribed");
        }

        Ok(())
    }

    /// Remove `actor` from `endpoint`; unknown endpoints and actors are ignored
    pub async fn unsubscribe(&self, endpoint: &str, actor: &Arc<dyn Actor>) -> Result<()> {
        let endpoint = check_endpoint(endpoint)?;

        let mut endpoints = self.endpoints.write().await;
        if let Some(actors) = endpoints.get_mut(endpoint) {
            actors.retain(|a| !same_actor(a, actor));
            if actors.is_empty() {
                endpoints.remove(endpoint);
            }
        }

        Ok(())
    }

    /// Drop `endpoint` with all of its subscribers
    pub async fn remove_endpoint(&self, endpoint: &str) -> Result<()> {
        let endpoint = check_endpoint(endpoint)?;

        if let Some(actors) = self.endpoints.write().await.remove(endpoint) {
            tracing::debug!(endpoint = endpoint, subscribers = actors.len(), "Endpoint removed");
        }

        Ok(())
    }

    /// Deliver `message` to every actor on `endpoint` that supports it
    ///
    /// Each delivery runs in its own task and this call returns without waiting for
    /// any of them. Returns how many deliveries were scheduled; unknown or empty
    /// endpoints yield zero.
    pub async fn broadcast(&self, endpoint: &str, message: Message) -> Result<usize> {
        let endpoint = check_endpoint(endpoint)?;

        let actors = match self.endpoints.read().await.get(endpoint) {
            Some(actors) => actors.clone(),
            None => return Ok(0),
        };

        let mut scheduled = 0;
        for actor in actors {
            let supported = std::panic::catch_unwind(AssertUnwindSafe(|| actor.supports_message(&message)));
            match supported {
                Ok(true) => {}
                Ok(false) => continue,
                Err(_) => {
                    tracing::error!(
                        endpoint = endpoint,
                        message_id = %message.id,
                        "Actor panicked while filtering a message"
                    );
                    continue;
                }
            }

            let deliveries = self.deliveries.clone();
            let message = message.clone();
            let endpoint = endpoint.to_string();

            tokio::spawn(async move {
                // The semaphore is never closed, so acquisition only fails on shutdown
                let _permit = match deliveries.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };

                let message_id = message.id.clone();
                match AssertUnwindSafe(actor.on_message(message)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::error!(
                            endpoint = %endpoint,
                            message_id = %message_id,
                            "Actor failed to handle message: {}",
                            e
                        );
                    }
                    Err(_) => {
                        tracing::error!(
                            endpoint = %endpoint,
                            message_id = %message_id,
                            "Actor panicked while handling message"
                        );
                    }
                }
            });
            scheduled += 1;
        }

        tracing::trace!(endpoint = endpoint, scheduled = scheduled, "Message broadcast");
        Ok(scheduled)
    }

    /// Endpoints that currently have at least one subscriber
    pub async fn endpoints(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .endpoints
            .read()
            .await
            .iter()
            .filter(|(_, actors)| !actors.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Number of actors subscribed to `endpoint`; zero for unknown or blank endpoints
    pub async fn subscriber_count(&self, endpoint: &str) -> usize {
        self.endpoints
            .read()
            .await
            .get(endpoint.trim())
            .map_or(0, |actors| actors.len())
    }

    pub fn max_concurrent_deliveries(&self) -> usize {
        self.max_concurrent_deliveries
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn check_endpoint(endpoint: &str) -> Result<&str> {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return Err(SfxError::InvalidArgument("The endpoint can not be empty".to_string()));
    }
    Ok(trimmed)
}

fn same_actor(a: &Arc<dyn Actor>, b: &Arc<dyn Actor>) -> bool {
    // Compare data pointers only; vtable pointers may differ between codegen units
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

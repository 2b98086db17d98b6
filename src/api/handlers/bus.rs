use crate::api::models::{BroadcastRequest, BroadcastResponse, EndpointResponse, EndpointsListResponse};
use crate::core::error::{Result, SfxError};
use crate::core::event_bus::{Actor, EventBus, Message};
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use super::AppState;

/// Handler for GET /api/bus - List endpoints with their subscriber counts
pub async fn list_endpoints(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let mut endpoints = Vec::new();
    for endpoint in state.event_bus.endpoints().await {
        let subscribers = state.event_bus.subscriber_count(&endpoint).await;
        endpoints.push(EndpointResponse {
            endpoint,
            subscribers,
        });
    }

    Ok(Json(EndpointsListResponse {
        total: endpoints.len(),
        endpoints,
    }))
}

/// Handler for POST /api/bus/:endpoint - Broadcast a message
pub async fn broadcast_message(
    State(state): State<AppState>,
    Path(endpoint): Path<String>,
    Json(request): Json<BroadcastRequest>,
) -> Result<impl IntoResponse> {
    let message = Message::new(request.kind, request.payload);
    let message_id = message.id.clone();

    let scheduled = state.event_bus.broadcast(&endpoint, message).await?;

    Ok(Json(BroadcastResponse {
        endpoint,
        message_id,
        scheduled,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct SubscribeQuery {
    /// Only forward messages of this kind
    pub kind: Option<String>,
}

/// Handler for GET /api/bus/:endpoint/ws - Subscribe a WebSocket to an endpoint
///
/// Every message broadcast on the endpoint is sent to the socket as JSON. Text frames
/// received from the socket are parsed as `{kind, payload}` and broadcast on the same
/// endpoint.
pub async fn subscribe_socket(
    State(state): State<AppState>,
    Path(endpoint): Path<String>,
    Query(query): Query<SubscribeQuery>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse> {
    let endpoint = endpoint.trim().to_string();
    if endpoint.is_empty() {
        return Err(SfxError::InvalidArgument("Endpoint must not be blank".to_string()));
    }

    let bus = state.event_bus.clone();
    Ok(ws.on_upgrade(move |socket| forward(socket, bus, endpoint, query.kind)))
}

/// Bus subscriber handing messages over to a socket task
struct SocketActor {
    sender: mpsc::UnboundedSender<Message>,
    kind: Option<String>,
}

#[async_trait]
impl Actor for SocketActor {
    fn supports_message(&self, message: &Message) -> bool {
        self.kind.as_ref().map_or(true, |kind| kind == &message.kind)
    }

    async fn on_message(&self, message: Message) -> Result<()> {
        self.sender
            .send(message)
            .map_err(|_| SfxError::EventError("WebSocket subscriber has gone away".to_string()))
    }
}

async fn forward(mut socket: WebSocket, bus: Arc<EventBus>, endpoint: String, kind: Option<String>) {
    let (sender, mut receiver) = mpsc::unbounded_channel();
    let actor: Arc<dyn Actor> = Arc::new(SocketActor { sender, kind });

    if let Err(e) = bus.subscribe(&endpoint, actor.clone()).await {
        warn!(endpoint = %endpoint, error = %e, "Failed to subscribe WebSocket");
        return;
    }
    info!(endpoint = %endpoint, "WebSocket subscriber connected");

    loop {
        tokio::select! {
            outgoing = receiver.recv() => {
                let Some(message) = outgoing else { break };
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(endpoint = %endpoint, error = %e, "Failed to serialize message");
                        continue;
                    }
                };
                if socket.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => publish(&bus, &endpoint, &text).await,
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    if let Err(e) = bus.unsubscribe(&endpoint, &actor).await {
        warn!(endpoint = %endpoint, error = %e, "Failed to unsubscribe WebSocket");
    }
    info!(endpoint = %endpoint, "WebSocket subscriber disconnected");
}

async fn publish(bus: &EventBus, endpoint: &str, text: &str) {
    let request: BroadcastRequest = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(e) => {
            debug!(endpoint, error = %e, "Ignoring malformed WebSocket frame");
            return;
        }
    };

    if let Err(e) = bus.broadcast(endpoint, Message::new(request.kind, request.payload)).await {
        warn!(endpoint, error = %e, "Failed to broadcast WebSocket frame");
    }
}

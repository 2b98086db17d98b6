use serde::{Deserialize, Serialize};
use serde_json::Value;

// Event bus API models

/// Request to broadcast a message on an endpoint
#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

/// Response for a broadcast
#[derive(Debug, Serialize)]
pub struct BroadcastResponse {
    pub endpoint: String,
    pub message_id: String,
    /// Number of deliveries scheduled
    pub scheduled: usize,
}

#[derive(Debug, Serialize)]
pub struct EndpointResponse {
    pub endpoint: String,
    pub subscribers: usize,
}

#[derive(Debug, Serialize)]
pub struct EndpointsListResponse {
    pub endpoints: Vec<EndpointResponse>,
    pub total: usize,
}
